//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the fabric coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected input (bad pipeline shape, duplicate correlation id, bad config).
    #[error("validation error: {0}")]
    Validation(String),

    /// No ring owner for a digest, unknown node/route/pipeline, digest absent on invoke.
    #[error("not found: {0}")]
    NotFound(String),

    /// Failure reported by a worker in an `ERROR` ack.
    #[error("worker error: {message}")]
    Worker {
        message: String,
        code: Option<i64>,
    },

    /// A lifecycle handler failed and aborted the triggering operation.
    #[error("hook {hook} rejected the operation: {source}")]
    HookRejected {
        hook: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A message could not be handed to the worker's transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// At least one branch of a broadcast failed; the others still ran to completion.
    #[error("broadcast failed on {failed} of {total} nodes: {first}")]
    PartialBroadcast {
        failed: usize,
        total: usize,
        first: String,
    },

    /// Internal errors (coordinator stopped, dropped replies).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable string code, suitable for logs and front-ends.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Worker { .. } => "WORKER_ERROR",
            Error::HookRejected { .. } => "HOOK_REJECTED",
            Error::Transport(_) => "UNAVAILABLE",
            Error::PartialBroadcast { .. } => "PARTIAL_BROADCAST",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "INTERNAL",
        }
    }

    /// Numeric code carried by a worker error, if any.
    pub fn worker_code(&self) -> Option<i64> {
        match self {
            Error::Worker { code, .. } => *code,
            Error::HookRejected { source, .. } => source.worker_code(),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn worker(msg: impl Into<String>, code: Option<i64>) -> Self {
        Self::Worker {
            message: msg.into(),
            code,
        }
    }

    pub fn hook_rejected(hook: &'static str, source: Error) -> Self {
        Self::HookRejected {
            hook,
            source: Box::new(source),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
