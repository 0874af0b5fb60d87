//! Error handling module for devgraph
//!
//! Each component raises its own error enum (`GraphError`, `StagingError`,
//! `ProbeError`, `PlanError`, `CommitError`). `DevgraphError` is the umbrella
//! the session API returns, with `From` conversions from every component.

use thiserror::Error;

use crate::devicegraph::GraphError;
use crate::devices::StagingError;
use crate::engine::commit::CommitError;
use crate::engine::planner::PlanError;
use crate::prober::ProbeError;

/// Main error type for devgraph
#[derive(Error, Debug)]
pub enum DevgraphError {
    /// Structural graph errors (dangling references, invalid relations)
    #[error("Devicegraph error: {0}")]
    Graph(#[from] GraphError),

    /// A staging mutation was rejected
    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    /// Probing the live system failed
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Probed and staging graphs cannot be bridged by an action list
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Commit halted; carries the per-action outcome
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Another session already holds this environment
    #[error("Session conflict: storage session '{key}' is already active")]
    SessionConflict { key: String },

    /// The operation needs a probed graph and none exists yet
    #[error("No probed devicegraph: call probe() first")]
    NotProbed,

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for devgraph operations
pub type Result<T> = std::result::Result<T, DevgraphError>;

impl DevgraphError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a session conflict error
    pub fn session_conflict(key: impl Into<String>) -> Self {
        Self::SessionConflict { key: key.into() }
    }

    /// The commit error carried by this error, if it is one.
    pub fn as_commit(&self) -> Option<&CommitError> {
        match self {
            Self::Commit(err) => Some(err),
            _ => None,
        }
    }
}
