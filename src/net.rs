use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;

use crate::config::HttpConfig;
use crate::error::PreviewError;

/// GET access to the remote board. No retries; failures surface as
/// [`PreviewError::FetchFailed`].
pub trait Fetcher: Send + Sync {
    fn fetch_text(&self, url: &str) -> Result<String>;
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// Confirms that an image URL can actually be displayed.
pub trait ImageLoader: Send + Sync {
    fn load(&self, url: &str) -> Result<()>;
}

/// Local file-save mechanism used by the gallery's download action.
pub trait FileSaver: Send + Sync {
    fn save(&self, bytes: &[u8], filename: &str) -> Result<PathBuf>;
}

pub struct HttpFetcher {
    http: HttpClient,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(cfg.timeout)
            .build()
            .context("net: build http client")?;
        Ok(Self {
            http,
            user_agent: cfg.user_agent.clone(),
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(|err| PreviewError::FetchFailed {
                url: url.to_string(),
                status: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(PreviewError::FetchFailed {
                url: url.to_string(),
                status: response.status().to_string(),
            }
            .into());
        }
        Ok(response)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_text(&self, url: &str) -> Result<String> {
        self.get(url)?
            .text()
            .with_context(|| format!("net: read body of {url}"))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self
            .get(url)?
            .bytes()
            .with_context(|| format!("net: read bytes of {url}"))?
            .to_vec())
    }
}

/// Fetches the image and decodes it, the way a browser would before
/// firing its load event.
pub struct DecodingLoader {
    fetcher: Arc<dyn Fetcher>,
}

impl DecodingLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

impl ImageLoader for DecodingLoader {
    fn load(&self, url: &str) -> Result<()> {
        if url.starts_with("data:") || url.starts_with("blob:") {
            return Err(PreviewError::ImageLoadFailed(url.to_string()).into());
        }
        let bytes = self.fetcher.fetch_bytes(url)?;
        image::load_from_memory(&bytes)
            .map(|_| ())
            .map_err(|_| PreviewError::ImageLoadFailed(url.to_string()).into())
    }
}

pub struct DirectorySaver {
    dir: PathBuf,
}

impl DirectorySaver {
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let dir = dir
            .or_else(dirs::download_dir)
            .ok_or_else(|| anyhow!("net: no download directory available"))?;
        Ok(Self { dir })
    }
}

impl FileSaver for DirectorySaver {
    fn save(&self, bytes: &[u8], filename: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("net: create {}", self.dir.display()))?;
        let path = unique_path(&self.dir, filename);
        fs::write(&path, bytes).with_context(|| format!("net: write {}", path.display()))?;
        Ok(path)
    }
}

fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (filename, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct StaticFetcher(Vec<u8>);

    impl Fetcher for StaticFetcher {
        fn fetch_text(&self, _url: &str) -> Result<String> {
            Ok(String::from_utf8_lossy(&self.0).into_owned())
        }

        fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::new(1, 1);
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn loader_accepts_decodable_images() {
        let loader = DecodingLoader::new(Arc::new(StaticFetcher(tiny_png())));
        assert!(loader.load("https://a/x.png").is_ok());
    }

    #[test]
    fn loader_rejects_garbage_and_inline_sources() {
        let loader = DecodingLoader::new(Arc::new(StaticFetcher(b"<html>".to_vec())));
        assert!(loader.load("https://a/x.png").is_err());
        assert!(loader.load("data:image/png;base64,AAAA").is_err());
    }

    #[test]
    fn saver_never_overwrites() {
        let dir = tempdir().unwrap();
        let saver = DirectorySaver::new(Some(dir.path().to_path_buf())).unwrap();
        let first = saver.save(b"a", "pic.png").unwrap();
        let second = saver.save(b"b", "pic.png").unwrap();
        assert_ne!(first, second);
        assert_eq!(second.file_name().unwrap(), "pic (1).png");
        assert_eq!(fs::read(first).unwrap(), b"a");
    }
}
