//! Error types for credential storage

/// Errors from credential store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid credential key: {0:?}")]
    InvalidKey(String),

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
