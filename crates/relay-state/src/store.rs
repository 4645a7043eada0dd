use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_transport::StreamId;

use crate::{ActiveTaskRecord, AgentMetadata, StateStoreError};

pub type Offsets = BTreeMap<String, StreamId>;
pub type ActiveTasks = BTreeMap<String, ActiveTaskRecord>;

/// Everything persisted for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    #[serde(default)]
    pub offsets: Offsets,
    #[serde(default)]
    pub active_tasks: ActiveTasks,
    #[serde(default)]
    pub metadata: Option<AgentMetadata>,
}

/// Durable storage scoped to a single agent.
///
/// Loads of never-saved state return empty values, not errors. A failed
/// save leaves the previously saved value readable.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The agent whose namespace this store reads and writes.
    fn agent(&self) -> &str;

    async fn load_offsets(&self) -> Result<Offsets, StateStoreError>;
    async fn save_offsets(&self, offsets: &Offsets) -> Result<(), StateStoreError>;

    async fn load_active_tasks(&self) -> Result<ActiveTasks, StateStoreError>;
    async fn save_active_tasks(&self, tasks: &ActiveTasks) -> Result<(), StateStoreError>;

    async fn load_metadata(&self) -> Result<Option<AgentMetadata>, StateStoreError>;
    async fn save_metadata(&self, metadata: &AgentMetadata) -> Result<(), StateStoreError>;

    /// Remove everything stored for this agent.
    async fn clear(&self) -> Result<(), StateStoreError>;

    async fn load_snapshot(&self) -> Result<AgentSnapshot, StateStoreError> {
        Ok(AgentSnapshot {
            offsets: self.load_offsets().await?,
            active_tasks: self.load_active_tasks().await?,
            metadata: self.load_metadata().await?,
        })
    }
}
