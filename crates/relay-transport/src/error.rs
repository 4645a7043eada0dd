use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("transport is closed")]
    Closed,

    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("invalid stream id '{0}'")]
    InvalidId(String),

    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    #[error("unsupported transport url '{0}'")]
    UnsupportedUrl(String),

    /// The log service rejected a command.
    #[error("log service error: {0}")]
    Backend(String),

    #[error("{op} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        source: Box<TransportError>,
    },

    #[error("transport unavailable: circuit open for another {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

impl TransportError {
    /// Failures worth retrying: the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// The TransportUnavailable condition: retries are exhausted or the
    /// circuit breaker is failing calls fast.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::CircuitOpen { .. })
    }
}
