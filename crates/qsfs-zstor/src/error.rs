use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ZstorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("uploader binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("metadata decoder binary not found at {0}")]
    DecoderMissing(PathBuf),
    #[error("uploader config not found at {0}")]
    ConfigMissing(PathBuf),
    #[error("failed to store {path}: {detail}")]
    StoreFailed { path: PathBuf, detail: String },
    #[error("failed to snapshot {path} for upload: {detail}")]
    SnapshotFailed { path: PathBuf, detail: String },
    #[error("failed to retrieve {path}: {detail}")]
    RetrieveFailed { path: PathBuf, detail: String },
    #[error("uploader not ready: {detail}")]
    NotReady { detail: String },
    #[error("metadata query failed: {detail}")]
    MetadataQueryFailed { detail: String },
    #[error("failed to parse uploader config: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("metrics scrape failed: {0}")]
    Scrape(#[from] reqwest::Error),
    #[error("metrics endpoint returned status {0}")]
    ScrapeStatus(u16),
}

impl ZstorError {
    /// True when a retrieve failed because the backends never stored the
    /// key. The restore scan uses this to find the end of the index series.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ZstorError::RetrieveFailed { detail, .. } if detail.contains("entity not found")
        )
    }
}
