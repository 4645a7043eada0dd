use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::{self, Fields};
use crate::constants::*;
use crate::{ProtocolError, ValidationError};

/// Lifecycle status of a delegated task.
///
/// `Created` only exists on the delegator side (a task that has been
/// appended but not yet answered); the four remaining values form the
/// response vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const RESPONSE_VOCABULARY: [TaskStatus; 4] = [
        TaskStatus::Acknowledged,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Acknowledged => "acknowledged",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Acknowledged => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether `next` is a valid forward step from `self`:
    /// `created -> acknowledged -> in_progress* -> {completed | failed}`.
    ///
    /// Steps may be skipped (a task rejected on arrival goes straight to
    /// `failed`), `in_progress` may repeat, and terminal states accept
    /// nothing further.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() || next == TaskStatus::Created {
            return false;
        }
        if *self == TaskStatus::InProgress && next == TaskStatus::InProgress {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "acknowledged" => Ok(Self::Acknowledged),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Expected time horizon of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Timeline {
    #[default]
    Immediate,
    ShortTerm,
    LongTerm,
}

/// A validated work request appended to a delegate's command stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    /// Correlation id shared by the task and every response to it.
    pub thread_id: String,
    /// Dispatch key for the delegate's handler registry.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Delegator whose response stream receives the lifecycle responses.
    pub source_agent: String,
    pub assigned_to: String,
    pub description: String,
    pub priority: i32,
    pub timeline: Timeline,
    #[serde(default)]
    pub success_metrics: Vec<String>,
    pub estimated_impact: f64,
    pub estimated_effort: f64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    const TEXT_FIELDS: &'static [&'static str] = &[
        "id",
        "thread_id",
        "task_type",
        "source_agent",
        "assigned_to",
        "description",
    ];
}

fn default_task_type() -> String {
    DEFAULT_TASK_TYPE.to_string()
}

impl TaskEnvelope {
    /// Check the field constraints. Called before an envelope is appended
    /// and after one is read.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("id", &self.id)?;
        require_non_empty("thread_id", &self.thread_id)?;
        require_non_empty("task_type", &self.task_type)?;
        require_non_empty("source_agent", &self.source_agent)?;
        require_non_empty("assigned_to", &self.assigned_to)?;
        require_non_empty("description", &self.description)?;

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(ValidationError::OutOfRange {
                field: "priority",
                value: self.priority.to_string(),
                expected: "1..=10",
            });
        }
        require_unit_interval("estimated_impact", self.estimated_impact)?;
        require_unit_interval("estimated_effort", self.estimated_effort)?;

        if self.dependencies.contains(&self.id) {
            return Err(ValidationError::invalid(
                "dependencies",
                "a task cannot depend on itself",
            ));
        }
        Ok(())
    }

    pub fn to_fields(&self) -> Result<Fields, ProtocolError> {
        self.validate()?;
        codec::encode(self)
    }

    /// Decode and validate an envelope read from a command stream.
    pub fn from_fields(fields: &Fields) -> Result<Self, ValidationError> {
        let envelope: Self = codec::decode_with_text(fields, Self::TEXT_FIELDS)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.as_ref().and_then(|c| c.get(key))
    }
}

/// Caller-facing description of a task to delegate.
///
/// Identity and timestamps are optional; `Delegator::delegate_task` fills
/// in a fresh id, a thread id and `created_at` when they are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequest {
    pub id: Option<String>,
    pub thread_id: Option<String>,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    pub timeline: Timeline,
    pub success_metrics: Vec<String>,
    pub estimated_impact: f64,
    pub estimated_effort: f64,
    pub dependencies: BTreeSet<String>,
    pub context: Option<Map<String, Value>>,
    pub created_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl Default for TaskRequest {
    fn default() -> Self {
        Self {
            id: None,
            thread_id: None,
            task_type: default_task_type(),
            description: String::new(),
            priority: DEFAULT_PRIORITY,
            timeline: Timeline::Immediate,
            success_metrics: Vec::new(),
            estimated_impact: DEFAULT_ESTIMATE,
            estimated_effort: DEFAULT_ESTIMATE,
            dependencies: BTreeSet::new(),
            context: None,
            created_at: None,
            deadline: None,
        }
    }
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_estimates(mut self, impact: f64, effort: f64) -> Self {
        self.estimated_impact = impact;
        self.estimated_effort = effort;
        self
    }

    pub fn with_success_metric(mut self, metric: impl Into<String>) -> Self {
        self.success_metrics.push(metric.into());
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Complete the request into a validated envelope addressed from
    /// `source_agent` to `target`.
    pub fn into_envelope(
        self,
        source_agent: &str,
        target: &str,
    ) -> Result<TaskEnvelope, ValidationError> {
        let envelope = TaskEnvelope {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            thread_id: self.thread_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: self.task_type,
            source_agent: source_agent.to_string(),
            assigned_to: target.to_string(),
            description: self.description,
            priority: self.priority,
            timeline: self.timeline,
            success_metrics: self.success_metrics,
            estimated_impact: self.estimated_impact,
            estimated_effort: self.estimated_effort,
            dependencies: self.dependencies,
            context: self.context,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            deadline: self.deadline,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Structured failure carried by a `failed` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub error_code: String,
    pub error_message: String,
    #[serde(default)]
    pub retry_possible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl TaskError {
    pub fn new(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            error_message: error_message.into(),
            retry_possible: false,
            retry_after: None,
            context: None,
        }
    }

    pub fn retryable(mut self, retry_after: Option<DateTime<Utc>>) -> Self {
        self.retry_possible = true;
        self.retry_after = retry_after;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("error.error_code", &self.error_code)
    }
}

/// Progress report for a long-running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current_step: String,
    pub steps_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl TaskProgress {
    pub fn new(current_step: impl Into<String>, steps_completed: u32) -> Self {
        Self {
            current_step: current_step.into(),
            steps_completed,
            total_steps: None,
            estimated_completion: None,
            details: None,
        }
    }

    pub fn with_total_steps(mut self, total_steps: u32) -> Self {
        self.total_steps = Some(total_steps);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(total) = self.total_steps {
            if total < 1 || total < self.steps_completed {
                return Err(ValidationError::OutOfRange {
                    field: "progress.total_steps",
                    value: total.to_string(),
                    expected: ">= 1 and >= steps_completed",
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

fn require_unit_interval(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
            expected: "0.0..=1.0",
        });
    }
    Ok(())
}
