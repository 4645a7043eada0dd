use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use relay_protocol::{ProtocolError, TaskEnvelope, TaskResponse, TaskStatus, PROTOCOL_VERSION};
use relay_transport::StreamId;

/// The delegator's view of one task it has sent out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTaskRecord {
    pub task_id: String,
    pub target_agent: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub envelope: TaskEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<TaskResponse>,
    /// Response-stream id of the last response merged into this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_id: Option<StreamId>,
}

impl ActiveTaskRecord {
    pub fn new(envelope: TaskEnvelope) -> Self {
        let now = Utc::now();
        Self {
            task_id: envelope.id.clone(),
            target_agent: envelope.assigned_to.clone(),
            status: TaskStatus::Created,
            created_at: envelope.created_at,
            last_updated: now,
            envelope,
            last_response: None,
            last_applied_id: None,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.envelope.thread_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a response read at `entry_id` into the record.
    ///
    /// Entries at or before `last_applied_id` were already merged (a replay
    /// after restart) and yield `DuplicateResponse`. Responses for another
    /// thread or that would move the status backwards are rejected. On any
    /// error the record is left untouched.
    pub fn apply(&mut self, response: &TaskResponse, entry_id: StreamId) -> Result<(), ProtocolError> {
        if self.last_applied_id.is_some_and(|last| entry_id <= last) {
            return Err(ProtocolError::DuplicateResponse {
                task_id: self.task_id.clone(),
                entry_id: entry_id.to_string(),
            });
        }
        if response.task_id != self.task_id {
            return Err(ProtocolError::UnknownTask(response.task_id.clone()));
        }
        if response.thread_id != self.envelope.thread_id {
            return Err(ProtocolError::ThreadMismatch {
                task_id: self.task_id.clone(),
                expected: self.envelope.thread_id.clone(),
                got: response.thread_id.clone(),
            });
        }
        if !self.status.can_transition_to(response.status) {
            return Err(ProtocolError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to: response.status,
            });
        }

        self.status = response.status;
        self.last_updated = response.timestamp;
        self.last_response = Some(response.clone());
        self.last_applied_id = Some(entry_id);
        Ok(())
    }

    /// Non-terminal and created more than `timeout` before `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.is_terminal() && now - self.created_at > timeout
    }

    /// Still waiting for the first response more than `timeout` after creation.
    pub fn is_unacknowledged(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == TaskStatus::Created && now - self.created_at > timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Delegator,
    Delegate,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Delegator => "delegator",
            Self::Delegate => "delegate",
        };
        write!(f, "{s}")
    }
}

/// Self-description an agent persists alongside its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub agent_name: String,
    pub role: AgentRole,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub active_task_count: usize,
    #[serde(default)]
    pub registered_handlers: Vec<String>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl AgentMetadata {
    pub fn new(agent_name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_name: agent_name.into(),
            role,
            last_active: Utc::now(),
            active_task_count: 0,
            registered_handlers: Vec::new(),
            protocol_version: default_protocol_version(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}
