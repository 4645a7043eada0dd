use std::time::Duration;

use relay_protocol::{ProtocolError, ValidationError};
use relay_state::StateStoreError;
use relay_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("stream naming: {0}")]
    Streams(#[from] ValidationError),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state store error: {0}")]
    State(#[from] StateStoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {task_id} did not finish within {waited:?}")]
    Timeout { task_id: String, waited: Duration },
}

impl DelegationError {
    /// The transport gave up: retries exhausted or circuit open.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_unavailable())
    }
}
