use crate::types::TaskStatus;

/// A message failed schema validation and must not reach (or leave) a stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// A well-formed message that cannot be applied: unknown status, unknown
/// task, or a duplicate/out-of-order lifecycle transition. These are logged
/// and discarded, leaving state unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown status value '{0}'")]
    UnknownStatus(String),

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("duplicate response {entry_id} for task {task_id}")]
    DuplicateResponse { task_id: String, entry_id: String },

    #[error("response for unknown task {0}")]
    UnknownTask(String),

    #[error("thread mismatch for task {task_id}: expected {expected}, got {got}")]
    ThreadMismatch {
        task_id: String,
        expected: String,
        got: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
