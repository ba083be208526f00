use thiserror::Error;

/// Top-level error type for the outreach system.
///
/// Subsystem crates define their own error types and convert from
/// `OutreachError` so that `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutreachError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-set update lost a race or a uniqueness guard fired.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for OutreachError {
    fn from(err: toml::de::Error) -> Self {
        OutreachError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for OutreachError {
    fn from(err: toml::ser::Error) -> Self {
        OutreachError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for OutreachError {
    fn from(err: serde_json::Error) -> Self {
        OutreachError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for outreach operations.
pub type Result<T> = std::result::Result<T, OutreachError>;
