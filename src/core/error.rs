use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Missing database credentials: {0}")]
    MissingCredentials(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Git error: {0}")]
    Git(String),
    #[error("Impersonation failed: {0}")]
    Impersonation(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("{0} error finding(s); gate failed")]
    GateFailed(usize),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GuardError {
    /// True when the failure came from the network/connection layer rather than
    /// from the analysis itself.
    pub fn is_connectivity(&self) -> bool {
        match self {
            GuardError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            GuardError::Timeout(_) => true,
            _ => false,
        }
    }
}
