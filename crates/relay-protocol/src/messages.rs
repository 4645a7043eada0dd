use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{self, Fields};
use crate::types::{require_non_empty, TaskError, TaskProgress, TaskStatus};
use crate::{ProtocolError, ValidationError};

/// A lifecycle update appended to the delegator's response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_possible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl TaskResponse {
    const TEXT_FIELDS: &'static [&'static str] = &["task_id", "thread_id", "message"];

    fn base(
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            thread_id: thread_id.into(),
            status,
            timestamp: Utc::now(),
            message: message.into(),
            results: None,
            error: None,
            progress: None,
            retry_possible: None,
            retry_after: None,
        }
    }

    pub fn acknowledged(
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::base(task_id, thread_id, TaskStatus::Acknowledged, message)
    }

    pub fn in_progress(
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        message: impl Into<String>,
        progress: Option<TaskProgress>,
    ) -> Self {
        let mut response = Self::base(task_id, thread_id, TaskStatus::InProgress, message);
        response.progress = progress;
        response
    }

    pub fn completed(
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        message: impl Into<String>,
        results: Option<Map<String, Value>>,
    ) -> Self {
        let mut response = Self::base(task_id, thread_id, TaskStatus::Completed, message);
        response.results = results;
        response
    }

    /// Failed response; the retry hints are lifted from the error.
    pub fn failed(
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        message: impl Into<String>,
        error: TaskError,
    ) -> Self {
        let mut response = Self::base(task_id, thread_id, TaskStatus::Failed, message);
        response.retry_possible = Some(error.retry_possible);
        response.retry_after = error.retry_after;
        response.error = Some(error);
        response
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.error_code.as_str())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("task_id", &self.task_id)?;
        require_non_empty("thread_id", &self.thread_id)?;

        if self.status == TaskStatus::Created {
            return Err(ValidationError::invalid(
                "status",
                "'created' is not a response status",
            ));
        }
        if self.status != TaskStatus::Failed
            && (self.retry_possible.is_some() || self.retry_after.is_some())
        {
            return Err(ValidationError::invalid(
                "retry_possible",
                "retry hints are only valid on failed responses",
            ));
        }
        if let Some(progress) = &self.progress {
            progress.validate()?;
        }
        if let Some(error) = &self.error {
            error.validate()?;
        }
        Ok(())
    }

    pub fn to_fields(&self) -> Result<Fields, ProtocolError> {
        self.validate()?;
        codec::encode(self)
    }

    /// Decode and validate a response read from a response stream.
    ///
    /// A status outside the response vocabulary is reported as
    /// `ProtocolError::UnknownStatus` rather than a generic decode error.
    pub fn from_fields(fields: &Fields) -> Result<Self, ProtocolError> {
        let status = codec::field_value(fields, "status")
            .ok_or_else(|| ValidationError::MissingField("status".into()))?;
        let status = match status {
            Value::String(s) => s,
            other => other.to_string(),
        };
        status.parse::<TaskStatus>()?;

        let response: Self = codec::decode_with_text(fields, Self::TEXT_FIELDS)?;
        response.validate()?;
        Ok(response)
    }
}
