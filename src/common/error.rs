//! Error types for the shard distributor

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Backend Errors ===
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Executor {executor_id} not found in namespace {namespace}")]
    ExecutorNotFound {
        namespace: String,
        executor_id: String,
    },

    #[error("Namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("Lease {0:x} not found")]
    LeaseNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Leadership Errors ===
    #[error("Leadership lost: {0}")]
    LeadershipLost(String),

    #[error("Not leader of namespace {0}")]
    NotLeader(String),

    #[error("Campaign failed: {0}")]
    Campaign(String),

    #[error("onLeader: {0}")]
    OnLeader(#[source] Box<Error>),

    #[error("Resign failed: {0}")]
    Resign(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::Timeout(_))
    }

    /// Does this error mean the caller no longer holds namespace leadership?
    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Error::LeadershipLost(_) | Error::NotLeader(_))
    }

    /// Wrap a processor failure raised while taking leadership.
    pub fn on_leader(err: Error) -> Self {
        Error::OnLeader(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
