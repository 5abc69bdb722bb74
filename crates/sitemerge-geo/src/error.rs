use sitemerge_core::SiteMergeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error from {0}: {1}")]
    Api(String, String),

    #[error("rate limit from {0}, retry after {1}s")]
    RateLimit(String, u64),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] SiteMergeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GeoError {
    pub fn is_config(&self) -> bool {
        matches!(self, GeoError::Core(e) if e.is_config())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GeoError::Core(SiteMergeError::ConfigError(msg.into()))
    }
}

impl From<rusqlite::Error> for GeoError {
    fn from(e: rusqlite::Error) -> Self {
        GeoError::Core(SiteMergeError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, GeoError>;
