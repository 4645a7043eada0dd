//! The stream transport abstraction.
//!
//! Models an append-only, per-name log service with blocking range reads
//! and consumer groups: a named cursor over a stream whose members claim
//! entries and acknowledge them once processed. Entries that are claimed
//! but never acknowledged stay in the group's pending list and can be
//! re-claimed after an idle timeout, which is how crashed consumers are
//! recovered and how poison messages are detected.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use relay_protocol::Fields;

use crate::{StreamId, TransportError};

/// A single log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

/// An entry delivered through a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub entry: StreamEntry,
    /// How many times this entry has been handed to a consumer, this
    /// delivery included.
    pub delivery_count: u32,
}

/// A claimed-but-unacknowledged entry in a group's pending list.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Every entry currently in the stream.
    Beginning,
    /// Only entries appended after the group is created.
    Latest,
    /// Entries strictly after the given id.
    After(StreamId),
}

/// Operations of a persistent append-only log service.
///
/// Implementations must tolerate concurrent callers; one transport handle
/// is shared by every component in a process.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry and return its id. With `max_len`, the oldest
    /// entries beyond that length are dropped afterwards.
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError>;

    /// Read entries appended after the given per-stream offsets.
    ///
    /// Blocks up to `block` when nothing is available and returns an empty
    /// map on timeout. A zero `block` never waits.
    async fn read_blocking(
        &self,
        offsets: &BTreeMap<String, StreamId>,
        block: Duration,
        count: usize,
    ) -> Result<BTreeMap<String, Vec<StreamEntry>>, TransportError>;

    /// Create a consumer group, creating the stream if needed.
    /// Returns `false` when the group already existed.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, TransportError>;

    /// Claim entries never delivered to this group, blocking up to `block`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<GroupEntry>, TransportError>;

    /// Re-claim pending entries idle for at least `min_idle`, regardless of
    /// which consumer held them. Each claim increments the delivery count.
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<GroupEntry>, TransportError>;

    /// Reset the idle time of pending entries `consumer` still holds,
    /// without counting a delivery. A consumer touches the entries it is
    /// working on so that no other consumer re-claims them. Returns how many
    /// entries were touched; ids held by another consumer are ignored.
    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError>;

    /// Acknowledge a processed entry. Returns `false` if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError>;

    /// The group's pending-entries list, oldest first.
    async fn pending(&self, stream: &str, group: &str)
        -> Result<Vec<PendingEntry>, TransportError>;

    /// Drop the oldest entries beyond `max_len`; returns how many were removed.
    ///
    /// This is lossy: entries never delivered to a group are discarded too.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, TransportError>;

    async fn len(&self, stream: &str) -> Result<usize, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;

    /// Release the connection. Later calls fail with `TransportError::Closed`.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
