//! Typed error hierarchy for forge-grid.
//!
//! `GridError` is the boundary error returned by coordinator operations and
//! mapped onto HTTP responses. Internals use `anyhow` with context and convert
//! through `GridError::Other`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Execution {id} not found")]
    ExecutionNotFound { id: String },

    #[error("Issue #{number} already has an active execution")]
    ActiveExecutionExists { number: u64 },

    /// A remote service (tracker, model, backend) failed in a way that may
    /// succeed on a later cycle.
    #[error("{service} unavailable: {message}")]
    Transient { service: String, message: String },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("Failed to launch execution for issue #{issue}: {source}")]
    Launch {
        issue: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Execution {id} timed out after {elapsed_secs}s")]
    Timeout { id: String, elapsed_secs: i64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Coordinator is not running")]
    CoordinatorStopped,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GridError {
    pub fn transient(service: &str, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}
