use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::store::{ActiveTasks, AgentSnapshot, Offsets, StateStore};
use crate::{AgentMetadata, StateStoreError};

/// In-process state store.
///
/// Stores created with `namespace` share the backing map, so dropping an
/// agent and opening a new one under the same name restores its state.
#[derive(Clone)]
pub struct MemoryStateStore {
    agent: String,
    inner: Arc<Mutex<HashMap<String, AgentSnapshot>>>,
}

impl MemoryStateStore {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            inner: Arc::default(),
        }
    }

    /// A store for `agent` backed by the same map as `self`.
    pub fn namespace(&self, agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            inner: Arc::clone(&self.inner),
        }
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<String, AgentSnapshot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_snapshot<T>(&self, f: impl FnOnce(&mut AgentSnapshot) -> T) -> T {
        let mut snapshots = self.snapshots();
        f(snapshots.entry(self.agent.clone()).or_default())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn agent(&self) -> &str {
        &self.agent
    }

    async fn load_offsets(&self) -> Result<Offsets, StateStoreError> {
        Ok(self.with_snapshot(|s| s.offsets.clone()))
    }

    async fn save_offsets(&self, offsets: &Offsets) -> Result<(), StateStoreError> {
        self.with_snapshot(|s| s.offsets = offsets.clone());
        Ok(())
    }

    async fn load_active_tasks(&self) -> Result<ActiveTasks, StateStoreError> {
        Ok(self.with_snapshot(|s| s.active_tasks.clone()))
    }

    async fn save_active_tasks(&self, tasks: &ActiveTasks) -> Result<(), StateStoreError> {
        self.with_snapshot(|s| s.active_tasks = tasks.clone());
        Ok(())
    }

    async fn load_metadata(&self) -> Result<Option<AgentMetadata>, StateStoreError> {
        Ok(self.with_snapshot(|s| s.metadata.clone()))
    }

    async fn save_metadata(&self, metadata: &AgentMetadata) -> Result<(), StateStoreError> {
        self.with_snapshot(|s| s.metadata = Some(metadata.clone()));
        Ok(())
    }

    async fn clear(&self) -> Result<(), StateStoreError> {
        self.snapshots().remove(&self.agent);
        Ok(())
    }
}
