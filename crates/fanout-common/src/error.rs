use thiserror::Error;

/// Errors that stop a run or reject a configuration.
///
/// Per-record delivery failures are not errors at this level: they are
/// [`InvocationError`](crate::InvocationError) values that end up as data in
/// the outcome summary.
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Admission limiter closed")]
    LimiterClosed,

    #[error("Source error: {0}")]
    Source(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FanoutError {
    pub fn configuration(message: impl Into<String>) -> Self {
        FanoutError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, FanoutError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, FanoutError>;
