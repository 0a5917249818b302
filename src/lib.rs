#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cache;
pub mod config;
pub mod dom;
pub mod error;
pub mod extract;
pub mod gallery;
pub mod html;
pub mod logging;
pub mod net;
pub mod queue;
pub mod reconciler;
pub mod render;
pub mod runtime;
pub mod scanner;
pub mod selector;
pub mod storage;
pub mod topic;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
