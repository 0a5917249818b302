/// Failure classes of the preview pipeline. Every one of them is handled
/// where it occurs; none is allowed to escape to the driver.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("no topic identifier in {0}")]
    NotFound(String),
    #[error("fetch {url} failed: {status}")]
    FetchFailed { url: String, status: String },
    #[error("could not parse {0}")]
    ParseFailed(String),
    #[error("image {0} failed to load")]
    ImageLoadFailed(String),
    #[error("persistent storage unavailable")]
    StorageUnavailable,
    #[error("download of {0} failed")]
    DownloadFailed(String),
}
