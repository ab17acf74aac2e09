//! Error types for the dynaflush write path.
//!
//! Every failure the flush path can see is one of a small number of kinds.
//! The kind, not the message, decides what happens next: validation
//! failures are recovered per batch, transport failures send the whole
//! delivery unit back upstream, and configuration failures stop the process
//! before any unit is accepted.

use thiserror::Error;

/// Errors that can occur while formatting, batching or writing records.
#[derive(Debug, Error)]
pub enum FlushError {
    /// Missing or invalid configuration, unreachable table, bad credentials.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store rejected a batch as structurally invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network, throttling or timeout failure talking to the store.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A numeric key field parsed as zero and strict coercion is enabled.
    #[error("Key coercion error: field '{field}' could not be read as a number (value: {raw})")]
    KeyCoercion { field: String, raw: String },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error reading the upstream stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error in the worker runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Coarse classification of a [`FlushError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Validation,
    Transport,
    KeyCoercion,
    Serialization,
    Io,
    Runtime,
}

impl FlushError {
    /// Return the failure kind of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            FlushError::Config(_) => FailureKind::Config,
            FlushError::Validation(_) => FailureKind::Validation,
            FlushError::Transport(_) => FailureKind::Transport,
            FlushError::KeyCoercion { .. } => FailureKind::KeyCoercion,
            FlushError::Serialization(_) => FailureKind::Serialization,
            FlushError::Io(_) => FailureKind::Io,
            FlushError::Runtime(_) => FailureKind::Runtime,
        }
    }

    /// Whether redelivering the same unit can succeed.
    ///
    /// Only transport failures are transient; everything else fails the
    /// same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transport
    }

    /// Build an error of the given kind carrying `message`.
    ///
    /// Used by executors and test doubles that decide the kind at runtime.
    pub fn of_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            FailureKind::Config => FlushError::Config(message),
            FailureKind::Validation => FlushError::Validation(message),
            FailureKind::Transport => FlushError::Transport(message),
            FailureKind::KeyCoercion => FlushError::KeyCoercion {
                field: String::new(),
                raw: message,
            },
            FailureKind::Serialization => FlushError::Serialization(message),
            FailureKind::Io => FlushError::Io(std::io::Error::other(message)),
            FailureKind::Runtime => FlushError::Runtime(message),
        }
    }
}

/// Result type alias for flush operations.
pub type Result<T> = std::result::Result<T, FlushError>;

impl From<serde_json::Error> for FlushError {
    fn from(e: serde_json::Error) -> Self {
        FlushError::Serialization(e.to_string())
    }
}
