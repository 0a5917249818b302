use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config;
use crate::dom::Document;
use crate::error::PreviewError;
use crate::html;
use crate::net::{DecodingLoader, DirectorySaver, Fetcher, HttpFetcher};
use crate::render;
use crate::runtime::{Runtime, Services};
use crate::storage;
use crate::topic::{RowDetails, TopicId};

const RUN_BUDGET: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Annotate a listing page and print one line per topic row.
    Scan { listing_url: String },
    /// Resolve a topic's gallery, optionally saving every image.
    Gallery { topic_url: String, download: bool },
}

impl Command {
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mut command = None;
        let mut download = false;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--scan" => {
                    let listing_url = args.next().context("--scan needs a listing URL")?;
                    command = Some(Command::Scan { listing_url });
                }
                "--gallery" => {
                    let topic_url = args.next().context("--gallery needs a topic URL")?;
                    command = Some(Command::Gallery {
                        topic_url,
                        download: false,
                    });
                }
                "--download" => download = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        match command {
            Some(Command::Gallery { topic_url, .. }) => Ok(Command::Gallery { topic_url, download }),
            Some(scan) if !download => Ok(scan),
            Some(_) => bail!("--download only applies to --gallery"),
            None => bail!("nothing to do; pass --scan <LISTING_URL> or --gallery <TOPIC_URL>"),
        }
    }
}

pub fn run(command: Command) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;

    let store = match storage::Store::open(storage::Options {
        path: cfg.storage.path.clone(),
    }) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!("{}: {err:?}", PreviewError::StorageUnavailable);
            None
        }
    };

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&cfg.http)?);
    let services = Services {
        fetcher: fetcher.clone(),
        loader: Arc::new(DecodingLoader::new(fetcher.clone())),
        saver: Arc::new(DirectorySaver::new(cfg.gallery.download_dir.clone())?),
    };

    match command {
        Command::Scan { listing_url } => {
            let markup = fetcher
                .fetch_text(&listing_url)
                .with_context(|| format!("fetch listing {listing_url}"))?;
            let doc = html::parse(&markup);
            let mut runtime = Runtime::new(doc, Some(&listing_url), &cfg, store, services)?;
            runtime.start(Instant::now());
            if !runtime.run_until_idle(RUN_BUDGET) {
                warn!("gave up waiting for previews");
            }
            for line in row_summaries(&runtime) {
                println!("{line}");
            }
        }
        Command::Gallery {
            topic_url,
            download,
        } => {
            let doc = html::parse("<html><body></body></html>");
            let mut runtime = Runtime::new(doc, Some(&topic_url), &cfg, store, services)?;
            runtime.start(Instant::now());
            runtime.open_gallery(&topic_url, &RowDetails::default(), Instant::now())?;
            runtime.run_until_idle(RUN_BUDGET);
            let images = runtime
                .gallery()
                .state()
                .map(|state| state.images.clone())
                .unwrap_or_default();
            if images.is_empty() {
                println!("{}", runtime.gallery().status_text(runtime.document()));
                return Ok(());
            }
            for url in &images {
                println!("{url}");
            }
            if download {
                for _ in &images {
                    runtime.key("s", None, Instant::now());
                    runtime.run_until_idle(RUN_BUDGET);
                    runtime.key("ArrowRight", None, Instant::now());
                    runtime.run_until_idle(RUN_BUDGET);
                }
                info!(count = images.len(), "downloads finished");
            }
        }
    }
    Ok(())
}

/// `<topic>\t<preview>\t<title>` for every annotated row.
fn row_summaries(runtime: &Runtime) -> Vec<String> {
    let doc: &Document = runtime.document();
    let rules = runtime.rules();
    doc.query_all(doc.root(), &rules.topic_row)
        .into_iter()
        .filter_map(|row| {
            let container = render::container_in(doc, row)?;
            let topic = doc
                .attr(container, render::TOPIC_KEY_ATTR)
                .and_then(TopicId::from_key)
                .map(|t| t.to_string())
                .unwrap_or_else(|| render::NO_ID_KEY.to_string());
            let preview = doc
                .first_child(container)
                .and_then(|child| doc.attr(child, "src"))
                .map(str::to_string)
                .or_else(|| doc.attr(container, "title").map(str::to_string))
                .unwrap_or_default();
            let title = RowDetails::from_row(doc, row, rules).title;
            Some(format!("{topic}\t{preview}\t{title}"))
        })
        .collect()
}
