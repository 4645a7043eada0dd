//! In-process stream log.
//!
//! `MemoryTransport` implements the full `StreamTransport` contract inside
//! the current process: monotonic ids, blocking reads woken by appends,
//! consumer groups with pending-entries lists and delivery counts, and
//! length-capped trimming. Clones share the same log, so a test can drop a
//! delegator or delegate and "restart" it against the surviving streams.
//!
//! Connectivity loss can be simulated with `set_online(false)` or
//! `fail_next_calls(n)`; affected calls return `TransportError::Connection`.
//! `destroy_group` drops a consumer group the way a wiped service would.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use relay_protocol::Fields;

use crate::transport::*;
use crate::{StreamId, TransportError};

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<StreamEntry>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingState>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
    closed: AtomicBool,
    offline: AtomicBool,
    failures_left: AtomicU32,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the log service.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::Release);
    }

    /// Make the next `n` calls fail with a connection error.
    pub fn fail_next_calls(&self, n: u32) {
        self.inner.failures_left.store(n, Ordering::Release);
    }

    /// Delete a consumer group and its pending list, as if the log service
    /// had lost it. Returns `false` if there was no such group.
    pub fn destroy_group(&self, stream: &str, group: &str) -> bool {
        let mut streams = self
            .inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        streams
            .get_mut(stream)
            .is_some_and(|log| log.groups.remove(group).is_some())
    }

    fn connect(&self) -> Result<MutexGuard<'_, HashMap<String, StreamLog>>, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.inner.offline.load(Ordering::Acquire) {
            return Err(TransportError::Connection("log service unreachable".into()));
        }
        let injected = self
            .inner
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::Connection("injected failure".into()));
        }
        Ok(self
            .inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Poll `scan` until it yields a value or `block` elapses.
    ///
    /// The append notification is armed before each scan so an append
    /// racing with the scan still wakes the waiter.
    async fn wait_for<T, F>(&self, block: Duration, mut scan: F) -> Result<Option<T>, TransportError>
    where
        F: FnMut(&mut HashMap<String, StreamLog>) -> Result<Option<T>, TransportError> + Send,
        T: Send,
    {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut streams = self.connect()?;
                if let Some(found) = scan(&mut streams)? {
                    return Ok(Some(found));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn no_group(stream: &str, group: &str) -> TransportError {
    TransportError::NoSuchGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn trim_log(log: &mut StreamLog, max_len: usize) -> usize {
    let excess = log.entries.len().saturating_sub(max_len);
    log.entries.drain(..excess);
    excess
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError> {
        let id = {
            let mut streams = self.connect()?;
            let log = streams.entry(stream.to_string()).or_default();
            let id = log.last_id.next_after(now_millis());
            log.last_id = id;
            log.entries.push_back(StreamEntry { id, fields });
            if let Some(max_len) = max_len {
                trim_log(log, max_len);
            }
            id
        };
        self.inner.appended.notify_waiters();
        tracing::trace!(stream, id = %id, "Appended entry");
        Ok(id)
    }

    async fn read_blocking(
        &self,
        offsets: &BTreeMap<String, StreamId>,
        block: Duration,
        count: usize,
    ) -> Result<BTreeMap<String, Vec<StreamEntry>>, TransportError> {
        let found = self
            .wait_for(block, |streams| {
                let mut batch = BTreeMap::new();
                for (name, after) in offsets {
                    let Some(log) = streams.get(name) else { continue };
                    let start = log.entries.partition_point(|e| e.id <= *after);
                    let entries: Vec<StreamEntry> =
                        log.entries.range(start..).take(count).cloned().collect();
                    if !entries.is_empty() {
                        batch.insert(name.clone(), entries);
                    }
                }
                Ok((!batch.is_empty()).then_some(batch))
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, TransportError> {
        let mut streams = self.connect()?;
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start {
            GroupStart::Beginning => StreamId::ZERO,
            GroupStart::Latest => log.last_id,
            GroupStart::After(id) => id,
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        tracing::debug!(stream, group, start = %last_delivered, "Created consumer group");
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        let found = self
            .wait_for(block, |streams| {
                let log = streams
                    .get_mut(stream)
                    .ok_or_else(|| no_group(stream, group))?;
                let StreamLog { entries, groups, .. } = log;
                let state = groups
                    .get_mut(group)
                    .ok_or_else(|| no_group(stream, group))?;

                let start = entries.partition_point(|e| e.id <= state.last_delivered);
                let claimed: Vec<GroupEntry> = entries
                    .range(start..)
                    .take(count)
                    .map(|entry| GroupEntry {
                        entry: entry.clone(),
                        delivery_count: 1,
                    })
                    .collect();
                if claimed.is_empty() {
                    return Ok(None);
                }

                let now = Instant::now();
                for item in &claimed {
                    state.pending.insert(
                        item.entry.id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                    state.last_delivered = item.entry.id;
                }
                Ok(Some(claimed))
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        let mut streams = self.connect()?;
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamLog { entries, groups, .. } = log;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let stale: Vec<StreamId> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();

        let mut claimed = Vec::new();
        for id in stale {
            if claimed.len() >= count {
                break;
            }
            let Ok(pos) = entries.binary_search_by(|e| e.id.cmp(&id)) else {
                // The entry was trimmed away; nothing left to redeliver.
                state.pending.remove(&id);
                tracing::debug!(stream, group, id = %id, "Dropped pending entry lost to trimming");
                continue;
            };
            let Some(pending) = state.pending.get_mut(&id) else { continue };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(GroupEntry {
                entry: entries[pos].clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError> {
        let mut streams = self.connect()?;
        let state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        let mut touched = 0;
        for id in ids {
            if let Some(pending) = state.pending.get_mut(id) {
                if pending.consumer == consumer {
                    pending.delivered_at = now;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError> {
        let mut streams = self.connect()?;
        let state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(state.pending.remove(&id).is_some())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<PendingEntry>, TransportError> {
        let streams = self.connect()?;
        let state = streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, TransportError> {
        let mut streams = self.connect()?;
        Ok(streams
            .get_mut(stream)
            .map(|log| trim_log(log, max_len))
            .unwrap_or(0))
    }

    async fn len(&self, stream: &str) -> Result<usize, TransportError> {
        let streams = self.connect()?;
        Ok(streams.get(stream).map(|log| log.entries.len()).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.connect().map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.appended.notify_waiters();
        Ok(())
    }
}
