//! Error taxonomy for the dispatch/lifecycle engine (spec.md §7).

use thiserror::Error;

/// Errors surfaced to the operator at the CLI boundary.
///
/// Storage transient errors (lock contention) are deliberately not a
/// variant here: per spec.md §4.1/§7 they're swallowed at the store
/// boundary and observed only as "no job available".
#[derive(Error, Debug)]
pub enum QueueError {
    /// Bad input: malformed JSON, missing `command`, unknown config key,
    /// or a config value of the wrong type.
    #[error("{0}")]
    Input(String),

    /// A uniqueness or existence conflict: duplicate job id, DLQ retry
    /// for an id that doesn't exist (or already has an active twin).
    #[error("{0}")]
    Conflict(String),

    /// A persistent storage failure (corruption, I/O failure). Per
    /// spec.md §7 this is logged and propagated; the worker process
    /// exits rather than looping forever against an unusable store.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
