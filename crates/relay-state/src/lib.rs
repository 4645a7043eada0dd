//! Relay State - what an agent needs to survive a restart
//!
//! Each agent persists three things under its own namespace: the last
//! processed offset of every stream it reads, the records of tasks it has
//! delegated and not yet purged, and a small metadata document describing
//! itself. `MemoryStateStore` keeps them in process; `FileStateStore`
//! writes one JSON document per concern under `<root>/<agent>/`.

pub mod error;
pub mod file;
pub mod memory;
pub mod record;
pub mod store;

pub use error::StateStoreError;
pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use record::{ActiveTaskRecord, AgentMetadata, AgentRole};
pub use store::{ActiveTasks, AgentSnapshot, Offsets, StateStore};
