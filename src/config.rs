use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "TOPIC_GALLERY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Page-structure contract. Changing the host page's markup conventions
/// should only ever require touching this section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    pub topic_link: String,
    pub topic_row: String,
    pub topic_cell: String,
    pub avatar_image: String,
    pub preloaded_data: String,
    pub main_outlet: String,
    pub gallery_image_link: String,
    pub gallery_image_fallback: String,
    pub enlarge_link: String,
    pub first_post_content: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            topic_link: "a.raw-topic-link".into(),
            topic_row: "tr".into(),
            topic_cell: "td.main-link, td.topic-list-data.title, td".into(),
            avatar_image: "img.avatar".into(),
            preloaded_data: "#data-preloaded".into(),
            main_outlet: "#main-outlet".into(),
            gallery_image_link: "a.lightbox img".into(),
            gallery_image_fallback: "img".into(),
            enlarge_link: "a.lightbox".into(),
            first_post_content: ".post-stream .topic-post:first-child .cooked".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewConfig {
    #[serde(default = "default_fetch_delay", with = "humantime_serde")]
    pub fetch_delay: Duration,
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_hint_ttl", with = "humantime_serde")]
    pub hint_ttl: Duration,
    #[serde(default = "default_significant_children")]
    pub significant_children: usize,
    #[serde(default = "default_verify_thumbnails")]
    pub verify_thumbnails: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            fetch_delay: default_fetch_delay(),
            debounce: default_debounce(),
            hint_ttl: default_hint_ttl(),
            significant_children: default_significant_children(),
            verify_thumbnails: default_verify_thumbnails(),
        }
    }
}

fn default_fetch_delay() -> Duration {
    Duration::from_millis(700)
}

fn default_debounce() -> Duration {
    Duration::from_millis(100)
}

fn default_hint_ttl() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_significant_children() -> usize {
    20
}

fn default_verify_thumbnails() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GalleryConfig {
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    #[serde(default = "default_download_ok_revert", with = "humantime_serde")]
    pub download_ok_revert: Duration,
    #[serde(default = "default_download_error_revert", with = "humantime_serde")]
    pub download_error_revert: Duration,
    #[serde(default = "default_nothing_to_download_revert", with = "humantime_serde")]
    pub nothing_to_download_revert: Duration,
    #[serde(default = "default_download_dir")]
    pub download_dir: Option<PathBuf>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            download_ok_revert: default_download_ok_revert(),
            download_error_revert: default_download_error_revert(),
            nothing_to_download_revert: default_nothing_to_download_revert(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(16)
}

fn default_download_ok_revert() -> Duration {
    Duration::from_millis(1500)
}

fn default_download_error_revert() -> Duration {
    Duration::from_millis(3000)
}

fn default_nothing_to_download_revert() -> Duration {
    Duration::from_millis(2000)
}

fn default_download_dir() -> Option<PathBuf> {
    dirs::download_dir()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout: default_http_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    format!("topic-gallery/{}", crate::VERSION)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let selectors = [
        (&mut base.selectors.topic_link, other.selectors.topic_link),
        (&mut base.selectors.topic_row, other.selectors.topic_row),
        (&mut base.selectors.topic_cell, other.selectors.topic_cell),
        (&mut base.selectors.avatar_image, other.selectors.avatar_image),
        (&mut base.selectors.preloaded_data, other.selectors.preloaded_data),
        (&mut base.selectors.main_outlet, other.selectors.main_outlet),
        (&mut base.selectors.gallery_image_link, other.selectors.gallery_image_link),
        (
            &mut base.selectors.gallery_image_fallback,
            other.selectors.gallery_image_fallback,
        ),
        (&mut base.selectors.enlarge_link, other.selectors.enlarge_link),
        (
            &mut base.selectors.first_post_content,
            other.selectors.first_post_content,
        ),
    ];
    for (slot, value) in selectors {
        if !value.trim().is_empty() {
            *slot = value;
        }
    }

    if !other.preview.fetch_delay.is_zero() {
        base.preview.fetch_delay = other.preview.fetch_delay;
    }
    base.preview.debounce = other.preview.debounce;
    if !other.preview.hint_ttl.is_zero() {
        base.preview.hint_ttl = other.preview.hint_ttl;
    }
    if other.preview.significant_children != 0 {
        base.preview.significant_children = other.preview.significant_children;
    }
    base.preview.verify_thumbnails = other.preview.verify_thumbnails;

    base.gallery.settle_delay = other.gallery.settle_delay;
    base.gallery.download_ok_revert = other.gallery.download_ok_revert;
    base.gallery.download_error_revert = other.gallery.download_error_revert;
    base.gallery.nothing_to_download_revert = other.gallery.nothing_to_download_revert;
    if other.gallery.download_dir.is_some() {
        base.gallery.download_dir = other.gallery.download_dir;
    }

    if !other.http.user_agent.trim().is_empty() {
        base.http.user_agent = other.http.user_agent;
    }
    if !other.http.timeout.is_zero() {
        base.http.timeout = other.http.timeout;
    }

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    let parsed = humantime::parse_duration(value.trim()).ok();
    match key {
        "selectors.topic_link" => cfg.selectors.topic_link = value,
        "selectors.topic_row" => cfg.selectors.topic_row = value,
        "selectors.topic_cell" => cfg.selectors.topic_cell = value,
        "selectors.avatar_image" => cfg.selectors.avatar_image = value,
        "selectors.preloaded_data" => cfg.selectors.preloaded_data = value,
        "selectors.main_outlet" => cfg.selectors.main_outlet = value,
        "selectors.gallery_image_link" => cfg.selectors.gallery_image_link = value,
        "selectors.gallery_image_fallback" => cfg.selectors.gallery_image_fallback = value,
        "selectors.enlarge_link" => cfg.selectors.enlarge_link = value,
        "selectors.first_post_content" => cfg.selectors.first_post_content = value,
        "preview.fetch_delay" => {
            if let Some(d) = parsed {
                cfg.preview.fetch_delay = d;
            }
        }
        "preview.debounce" => {
            if let Some(d) = parsed {
                cfg.preview.debounce = d;
            }
        }
        "preview.hint_ttl" => {
            if let Some(d) = parsed {
                cfg.preview.hint_ttl = d;
            }
        }
        "preview.significant_children" => {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                cfg.preview.significant_children = parsed;
            }
        }
        "preview.verify_thumbnails" => {
            cfg.preview.verify_thumbnails = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "gallery.settle_delay" => {
            if let Some(d) = parsed {
                cfg.gallery.settle_delay = d;
            }
        }
        "gallery.download_ok_revert" => {
            if let Some(d) = parsed {
                cfg.gallery.download_ok_revert = d;
            }
        }
        "gallery.download_error_revert" => {
            if let Some(d) = parsed {
                cfg.gallery.download_error_revert = d;
            }
        }
        "gallery.nothing_to_download_revert" => {
            if let Some(d) = parsed {
                cfg.gallery.nothing_to_download_revert = d;
            }
        }
        "gallery.download_dir" => cfg.gallery.download_dir = Some(PathBuf::from(value)),
        "http.user_agent" => cfg.http.user_agent = value,
        "http.timeout" => {
            if let Some(d) = parsed {
                cfg.http.timeout = d;
            }
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("topic-gallery").join("config.yaml"))
}
