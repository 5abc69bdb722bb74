use thiserror::Error;

/// All errors that can occur in sitemerge-core.
#[derive(Debug, Error)]
pub enum SiteMergeError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Archive table missing: {0}")]
    MissingArchiveTable(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl SiteMergeError {
    pub fn is_config(&self) -> bool {
        matches!(self, SiteMergeError::ConfigError(_))
    }
}

/// Process exit codes for the batch jobs.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConfigError = 3,
}

pub type Result<T> = std::result::Result<T, SiteMergeError>;
