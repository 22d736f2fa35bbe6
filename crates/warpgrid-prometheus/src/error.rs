//! Receiver error types.

use thiserror::Error;

/// Result type alias for receiver operations.
pub type ReceiverResult<T> = Result<T, ReceiverError>;

/// Errors that can occur while configuring or running the receiver.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("failed to read config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid scrape config for job {job:?}: {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("discovery provider failed for job {job:?}: {source}")]
    Discovery {
        job: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("discovery notification channel closed")]
    NotificationsClosed,

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("scrape of {target} failed: {source}")]
    Scrape {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("scrape of {target} timed out")]
    ScrapeTimeout { target: String },

    #[error("metrics consumer rejected batch: {0}")]
    Consumer(#[source] anyhow::Error),
}

impl ReceiverError {
    /// Shorthand for a rejected job definition.
    pub fn invalid_job(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.into(),
            reason: reason.into(),
        }
    }
}
