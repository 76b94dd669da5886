//! Error types for ddnssd.

use thiserror::Error;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Container runtime HTTP error
    #[error("container runtime error: {0}")]
    Runtime(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// DNS name error
    #[error("DNS name error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// A stored record could not be parsed back into a typed record
    #[error("invalid record data: {0}")]
    InvalidRecord(String),

    /// A backend failed in a way the event loop cannot recover from
    #[error("backend {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    /// The event queue closed while the loop was still running
    #[error("event queue closed unexpectedly")]
    QueueClosed,
}

/// Failure taxonomy for DNS backend operations.
///
/// `Transient` and `Conflict` are retried inside the backend with a bounded
/// budget; once the budget is exhausted they surface here and the caller logs
/// and moves on (the next reconciliation pass picks the record up again).
/// `InvariantViolation` means the zone itself is in a state we will not touch
/// (e.g. the base domain disappeared): the operation is dropped. `Fatal`
/// terminates the event loop.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Throttling, 5xx, connection loss, database busy. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Another writer changed the zone between read and write.
    #[error("conflicting concurrent change: {0}")]
    Conflict(String),

    /// The zone no longer satisfies our assumptions; drop the operation.
    #[error("zone invariant violated: {0}")]
    InvariantViolation(String),

    /// Credentials, missing schema, unreachable service. Not retryable.
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Conflict(_))
    }

    /// Metrics label for this failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Transient(_) => "transient",
            BackendError::Conflict(_) => "conflict",
            BackendError::InvariantViolation(_) => "invariant_violation",
            BackendError::Fatal(_) => "fatal",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level problems are worth retrying; anything that made it
        // to a status code is classified by the backend itself.
        BackendError::Transient(err.to_string())
    }
}
