use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{ActiveTasks, Offsets, StateStore};
use crate::{AgentMetadata, StateStoreError};

const OFFSETS_FILE: &str = "offsets.json";
const ACTIVE_TASKS_FILE: &str = "active_tasks.json";
const METADATA_FILE: &str = "metadata.json";

/// JSON files under `<root>/<agent>/`.
///
/// Each save writes a sibling temp file and renames it over the target, so
/// a crash mid-write never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    agent: String,
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl AsRef<Path>, agent: impl Into<String>) -> Result<Self, StateStoreError> {
        let agent = agent.into();
        let unsafe_name = agent.is_empty()
            || agent == "."
            || agent == ".."
            || agent.contains(['/', '\\']);
        if unsafe_name {
            return Err(StateStoreError::InvalidAgent(agent));
        }
        let dir = root.as_ref().join(&agent);
        Ok(Self { agent, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StateStoreError> {
        let path = self.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(StateStoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StateStoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    async fn write<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateStoreError::io(&self.dir, e))?;

        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StateStoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateStoreError::io(&path, e))?;
        tracing::trace!(agent = %self.agent, file = name, "Saved state");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn agent(&self) -> &str {
        &self.agent
    }

    async fn load_offsets(&self) -> Result<Offsets, StateStoreError> {
        self.read(OFFSETS_FILE).await
    }

    async fn save_offsets(&self, offsets: &Offsets) -> Result<(), StateStoreError> {
        self.write(OFFSETS_FILE, offsets).await
    }

    async fn load_active_tasks(&self) -> Result<ActiveTasks, StateStoreError> {
        self.read(ACTIVE_TASKS_FILE).await
    }

    async fn save_active_tasks(&self, tasks: &ActiveTasks) -> Result<(), StateStoreError> {
        self.write(ACTIVE_TASKS_FILE, tasks).await
    }

    async fn load_metadata(&self) -> Result<Option<AgentMetadata>, StateStoreError> {
        self.read(METADATA_FILE).await
    }

    async fn save_metadata(&self, metadata: &AgentMetadata) -> Result<(), StateStoreError> {
        self.write(METADATA_FILE, metadata).await
    }

    async fn clear(&self) -> Result<(), StateStoreError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateStoreError::io(&self.dir, e)),
        }
    }
}
