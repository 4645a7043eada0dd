//! The executing side of a delegation.
//!
//! A delegate claims envelopes from its command stream through a consumer
//! group and runs each on the handler registered for its `task_type`. Every
//! claimed entry ends in exactly one of three ways:
//!
//! - handled (successfully or not): the final response is appended and the
//!   entry acknowledged;
//! - poisoned: delivered more than `max_delivery_attempts` times, it is
//!   copied to the dead-letter stream and acknowledged;
//! - interrupted (transport failure, crash, shutdown): it stays pending and
//!   is re-claimed once idle for `claim_idle_timeout`.
//!
//! While a handler runs, a heartbeat keeps its entry from looking idle so
//! other consumers of the group leave it alone.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

use relay_protocol::{
    TaskEnvelope, TaskError, TaskProgress, CANCEL_TASK_TYPE, ERROR_CANCELLED, ERROR_HANDLER_PANICKED,
    ERROR_MAX_DELIVERIES_EXCEEDED, ERROR_UNKNOWN_TASK_TYPE,
};
use relay_state::{AgentMetadata, AgentRole, Offsets, StateStore};
use relay_transport::{DeadLetter, GroupEntry, GroupStart, StreamId, TransportError};

use crate::background::{self, Background};
use crate::{
    AgentContext, DelegationError, HandlerRegistry, ProgressReporter, Responder, TaskHandler,
};

/// A dispatch currently holding a claimed entry.
struct Running {
    task_id: String,
    thread_id: String,
    source_agent: String,
    abort: Option<AbortHandle>,
}

struct Shared {
    agent: String,
    consumer: String,
    command_stream: String,
    group: String,
    dead_letter_stream: String,
    context: AgentContext,
    store: Arc<dyn StateStore>,
    handlers: HandlerRegistry,
    running: StdMutex<HashMap<StreamId, Running>>,
    permits: Arc<Semaphore>,
    watermark: StdMutex<Watermark>,
}

/// The command-stream offset below which every entry this delegate claimed
/// has been acknowledged.
///
/// Acks arrive out of order, so an acked id only moves the offset once no
/// earlier claimed entry is still outstanding.
#[derive(Debug, Default)]
struct Watermark {
    offset: Option<StreamId>,
    outstanding: BTreeSet<StreamId>,
    acked: BTreeSet<StreamId>,
}

impl Watermark {
    fn resume_from(offset: Option<StreamId>) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    fn claimed(&mut self, id: StreamId) {
        if !self.acked.contains(&id) {
            self.outstanding.insert(id);
        }
    }

    fn acked(&mut self, id: StreamId) {
        self.outstanding.remove(&id);
        self.acked.insert(id);
        let settled = match self.outstanding.first() {
            Some(floor) => {
                let rest = self.acked.split_off(floor);
                std::mem::replace(&mut self.acked, rest)
            }
            None => std::mem::take(&mut self.acked),
        };
        if let Some(&last) = settled.last() {
            if self.offset.map_or(true, |o| last > o) {
                self.offset = Some(last);
            }
        }
    }

    fn group_start(&self) -> GroupStart {
        self.offset.map_or(GroupStart::Beginning, GroupStart::After)
    }
}

/// How often running entries are touched: well inside the idle timeout
/// after which another consumer may re-claim them.
fn heartbeat_interval(claim_idle: Duration) -> Duration {
    (claim_idle / 3).max(Duration::from_millis(50))
}

pub struct Delegate {
    shared: Arc<Shared>,
    processor: Mutex<Option<Background>>,
}

impl Delegate {
    /// Open the delegate for `agent`. A state store failure here is fatal.
    pub async fn open(
        agent: impl Into<String>,
        context: AgentContext,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, DelegationError> {
        let agent = agent.into();
        let naming = context.naming();
        let command_stream = naming.command_stream(&agent);
        let resumed = store.load_offsets().await?.get(&command_stream).copied();

        let shared = Arc::new(Shared {
            consumer: format!("{agent}-{}", Uuid::new_v4().simple()),
            group: naming.consumer_group(&agent),
            dead_letter_stream: naming.dead_letter_stream(&agent),
            command_stream,
            permits: Arc::new(Semaphore::new(context.config().max_concurrent_tasks)),
            context,
            store,
            handlers: HandlerRegistry::new(),
            running: StdMutex::new(HashMap::new()),
            watermark: StdMutex::new(Watermark::resume_from(resumed)),
            agent,
        });
        tracing::info!(
            agent = %shared.agent,
            stream = %shared.command_stream,
            group = %shared.group,
            consumer = %shared.consumer,
            "Opened delegate"
        );
        Ok(Self {
            shared,
            processor: Mutex::new(None),
        })
    }

    pub fn agent(&self) -> &str {
        &self.shared.agent
    }

    /// Register `handler` for envelopes of `task_type`; a later
    /// registration for the same type replaces it.
    pub fn register_handler(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.shared.handlers.register(task_type, Arc::new(handler));
    }

    pub fn registered_task_types(&self) -> Vec<String> {
        self.shared.handlers.task_types()
    }

    pub async fn is_processing(&self) -> bool {
        self.processor
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    /// Create the consumer group if needed and start the processing loop.
    pub async fn start_processing(&self) -> Result<(), DelegationError> {
        let mut processor = self.processor.lock().await;
        if processor.as_ref().is_some_and(|p| !p.is_finished()) {
            return Err(DelegationError::AlreadyRunning("delegate processor"));
        }
        self.shared.ensure_group().await?;
        self.shared.save_metadata().await;

        let shared = Arc::clone(&self.shared);
        *processor = Some(Background::spawn("delegate processor", move |shutdown| {
            shared.process(shutdown)
        }));
        Ok(())
    }

    /// Stop claiming new entries, give in-flight dispatches up to
    /// `shutdown_timeout` to finish, then persist offsets and metadata.
    pub async fn stop_processing(&self) -> Result<(), DelegationError> {
        if let Some(processor) = self.processor.lock().await.take() {
            processor
                .stop(self.shared.context.config().shutdown_window())
                .await;
        }
        self.shared.store.save_offsets(&self.shared.offsets()).await?;
        self.shared.save_metadata().await;
        Ok(())
    }

    /// Append an `acknowledged` response for a task received out of band.
    pub async fn acknowledge_task(
        &self,
        task_id: &str,
        thread_id: &str,
        source_agent: &str,
        message: &str,
    ) -> Result<StreamId, DelegationError> {
        self.shared
            .responder(task_id, thread_id, source_agent)
            .acknowledged(message)
            .await
    }

    pub async fn update_task_progress(
        &self,
        task_id: &str,
        thread_id: &str,
        source_agent: &str,
        message: &str,
        progress: Option<TaskProgress>,
    ) -> Result<StreamId, DelegationError> {
        self.shared
            .responder(task_id, thread_id, source_agent)
            .in_progress(message, progress)
            .await
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        thread_id: &str,
        source_agent: &str,
        message: &str,
        results: Option<serde_json::Map<String, Value>>,
    ) -> Result<StreamId, DelegationError> {
        self.shared
            .responder(task_id, thread_id, source_agent)
            .completed(message, results)
            .await
    }

    pub async fn fail_task(
        &self,
        task_id: &str,
        thread_id: &str,
        source_agent: &str,
        message: &str,
        error: TaskError,
    ) -> Result<StreamId, DelegationError> {
        self.shared
            .responder(task_id, thread_id, source_agent)
            .failed(message, error)
            .await
    }
}

/// Removes a dispatch from the running table when it ends, including when
/// it is aborted.
struct RunningGuard {
    shared: Arc<Shared>,
    entry_id: StreamId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.running().remove(&self.entry_id);
    }
}

/// Aborts the handler task if the dispatch awaiting it is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, HashMap<StreamId, Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watermark(&self) -> MutexGuard<'_, Watermark> {
        self.watermark.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offsets(&self) -> Offsets {
        let last = self.watermark().offset;
        last.map(|id| Offsets::from([(self.command_stream.clone(), id)]))
            .unwrap_or_default()
    }

    fn max_len(&self) -> usize {
        self.context.config().stream_max_length
    }

    fn responder(&self, task_id: &str, thread_id: &str, source_agent: &str) -> Responder {
        Responder::new(
            Arc::clone(self.context.transport()),
            self.context.naming(),
            self.max_len(),
            task_id,
            thread_id,
            source_agent,
        )
    }

    fn responder_for(&self, envelope: &TaskEnvelope) -> Responder {
        Responder::for_envelope(
            Arc::clone(self.context.transport()),
            self.context.naming(),
            self.max_len(),
            envelope,
        )
    }

    /// Create the consumer group if it is missing. A new group starts right
    /// after the last entry this delegate knows to be processed, so a group
    /// lost by the log service does not replay finished work.
    async fn ensure_group(&self) -> Result<(), DelegationError> {
        let start = self.watermark().group_start();
        let created = self
            .context
            .transport()
            .create_group(&self.command_stream, &self.group, start)
            .await?;
        if created {
            tracing::info!(
                stream = %self.command_stream,
                group = %self.group,
                start = ?start,
                "Created consumer group"
            );
        }
        Ok(())
    }

    async fn save_metadata(&self) {
        let mut metadata = AgentMetadata::new(&self.agent, AgentRole::Delegate);
        metadata.active_task_count = self.running().len();
        metadata.registered_handlers = self.handlers.task_types();
        if let Err(e) = self.store.save_metadata(&metadata).await {
            tracing::error!(agent = %self.agent, error = %e, "Failed to persist agent metadata");
        }
    }

    async fn checkpoint(&self) {
        if let Err(e) = self.store.save_offsets(&self.offsets()).await {
            tracing::error!(agent = %self.agent, error = %e, "Failed to persist offsets");
        }
        self.save_metadata().await;
    }

    async fn ack(&self, entry_id: StreamId) -> Result<(), DelegationError> {
        self.context
            .transport()
            .ack(&self.command_stream, &self.group, entry_id)
            .await?;
        self.watermark().acked(entry_id);
        Ok(())
    }

    /// Acknowledge, logging instead of failing; an unacknowledged entry is
    /// simply redelivered later.
    async fn ack_or_log(&self, entry_id: StreamId) {
        if let Err(e) = self.ack(entry_id).await {
            tracing::error!(entry = %entry_id, error = %e, "Failed to acknowledge command entry");
        }
    }

    /// Touch every entry a dispatch is still working on. Runs until the
    /// processing loop that spawned it is done draining.
    async fn heartbeat(self: Arc<Self>) {
        let mut tick = tokio::time::interval(heartbeat_interval(self.context.config().claim_idle()));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let ids: Vec<StreamId> = self.running().keys().copied().collect();
            if ids.is_empty() {
                continue;
            }
            match self
                .context
                .transport()
                .touch(&self.command_stream, &self.group, &self.consumer, &ids)
                .await
            {
                Ok(touched) if touched < ids.len() => tracing::warn!(
                    agent = %self.agent,
                    running = ids.len(),
                    touched,
                    "Running entries were re-claimed by another consumer"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(agent = %self.agent, error = %e, "Failed to refresh running entries"),
            }
        }
    }

    async fn process(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let config = self.context.config().clone();
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat());
        let _heartbeat = AbortOnDrop(heartbeat.abort_handle());
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut reclaim = tokio::time::interval(config.claim_idle());
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures = 0u32;
        tracing::info!(agent = %self.agent, stream = %self.command_stream, "Delegate processing");

        loop {
            if background::stopping(&shutdown) {
                break;
            }
            let capacity = self.permits.available_permits().min(config.read_batch_size);

            let claimed = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Dispatch task panicked");
                        }
                    }
                    continue;
                }
                _ = reclaim.tick(), if capacity > 0 => {
                    let claimed = self
                        .context
                        .transport()
                        .claim_pending(
                            &self.command_stream,
                            &self.group,
                            &self.consumer,
                            config.claim_idle(),
                            capacity,
                        )
                        .await;
                    self.checkpoint().await;
                    claimed
                }
                read = self.context.transport().read_group(
                    &self.command_stream,
                    &self.group,
                    &self.consumer,
                    capacity,
                    config.read_block(),
                ), if capacity > 0 => read,
            };

            match claimed {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        self.accept(entry, &mut tasks).await;
                    }
                }
                Err(TransportError::Closed) => {
                    tracing::error!(agent = %self.agent, "Transport closed, delegate processor halting");
                    break;
                }
                Err(TransportError::NoSuchGroup { .. }) => {
                    tracing::warn!(stream = %self.command_stream, group = %self.group, "Consumer group missing, recreating");
                    if let Err(e) = self.ensure_group().await {
                        tracing::error!(error = %e, "Failed to recreate consumer group");
                    }
                }
                Err(e) => {
                    let delay = background::read_retry_delay(&config, failures, &e);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        agent = %self.agent,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Command read failed"
                    );
                    if background::pause(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        let drained = tokio::time::timeout(config.shutdown_window(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                agent = %self.agent,
                abandoned = tasks.len(),
                "Shutdown window elapsed, abandoning in-flight tasks"
            );
            tasks.abort_all();
        }
        self.checkpoint().await;
        tracing::info!(agent = %self.agent, "Delegate stopped processing");
    }

    /// Route one claimed entry.
    async fn accept(self: &Arc<Self>, claimed: GroupEntry, tasks: &mut JoinSet<()>) {
        let GroupEntry {
            entry,
            delivery_count,
        } = claimed;
        if self.running().contains_key(&entry.id) {
            tracing::debug!(entry = %entry.id, "Entry still being handled, skipping re-claim");
            return;
        }
        self.watermark().claimed(entry.id);

        let decoded = TaskEnvelope::from_fields(&entry.fields);
        let max_attempts = self.context.config().max_delivery_attempts;
        if delivery_count > max_attempts {
            let reason = match &decoded {
                Ok(_) => format!("not completed after {delivery_count} deliveries"),
                Err(e) => format!("undecodable envelope: {e}"),
            };
            self.dead_letter(entry.id, delivery_count, reason, entry.fields, decoded.ok())
                .await;
            return;
        }

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                // Left pending: redelivered until it is dead-lettered.
                tracing::error!(
                    entry = %entry.id,
                    deliveries = delivery_count,
                    error = %e,
                    "Rejected malformed task envelope"
                );
                return;
            }
        };
        if envelope.assigned_to != self.agent {
            tracing::warn!(
                task_id = %envelope.id,
                assigned_to = %envelope.assigned_to,
                "Envelope addressed to another agent"
            );
        }

        let Some(handler) = self.handlers.get(&envelope.task_type) else {
            if envelope.task_type == CANCEL_TASK_TYPE {
                self.cancel(entry.id, &envelope).await;
            } else {
                self.reject_unknown(entry.id, &envelope).await;
            }
            return;
        };

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch permits closed");
                return;
            }
        };
        self.running().insert(
            entry.id,
            Running {
                task_id: envelope.id.clone(),
                thread_id: envelope.thread_id.clone(),
                source_agent: envelope.source_agent.clone(),
                abort: None,
            },
        );
        let guard = RunningGuard {
            shared: Arc::clone(self),
            entry_id: entry.id,
        };
        let shared = Arc::clone(self);
        let abort = tasks.spawn(shared.dispatch(handler, envelope, entry.id, permit, guard));
        if let Some(running) = self.running().get_mut(&entry.id) {
            running.abort = Some(abort);
        }
    }

    /// Run `handler` and append the lifecycle responses. The entry is
    /// acknowledged only once the final response is appended.
    async fn dispatch(
        self: Arc<Self>,
        handler: Arc<dyn TaskHandler>,
        envelope: TaskEnvelope,
        entry_id: StreamId,
        _permit: OwnedSemaphorePermit,
        _guard: RunningGuard,
    ) {
        let task_id = envelope.id.clone();
        let responder = self.responder_for(&envelope);
        if let Err(e) = responder.acknowledged("Task received and will be processed").await {
            tracing::error!(task_id = %task_id, error = %e, "Failed to acknowledge task");
            return;
        }
        tracing::info!(task_id = %task_id, task_type = %envelope.task_type, "Dispatching task");

        let reporter = ProgressReporter::new(responder.clone());
        let run = tokio::spawn(async move { handler.handle(&envelope, reporter).await });
        let _abort = AbortOnDrop(run.abort_handle());

        let sent = match run.await {
            Ok(Ok(results)) => {
                tracing::info!(task_id = %task_id, "Task completed");
                responder.completed("Task completed successfully", results).await
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    task_id = %task_id,
                    error_code = %error.error_code,
                    error = %error.error_message,
                    "Task failed"
                );
                let message = format!("Task failed: {}", error.error_message);
                responder.failed(&message, error).await
            }
            Err(e) if e.is_panic() => {
                tracing::error!(task_id = %task_id, error = %e, "Task handler panicked");
                responder
                    .failed(
                        "Task handler panicked",
                        TaskError::new(ERROR_HANDLER_PANICKED, e.to_string()),
                    )
                    .await
            }
            Err(_) => return,
        };

        match sent {
            Ok(_) => self.ack_or_log(entry_id).await,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to send final response, leaving entry pending");
            }
        }
    }

    async fn reject_unknown(&self, entry_id: StreamId, envelope: &TaskEnvelope) {
        tracing::warn!(
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            "No handler registered for task type"
        );
        let error = TaskError::new(
            ERROR_UNKNOWN_TASK_TYPE,
            format!("no handler registered for task type '{}'", envelope.task_type),
        )
        .with_context("task_type", json!(envelope.task_type));
        match self
            .responder_for(envelope)
            .failed("Unknown task type", error)
            .await
        {
            Ok(_) => self.ack_or_log(entry_id).await,
            Err(e) => tracing::error!(task_id = %envelope.id, error = %e, "Failed to reject task"),
        }
    }

    /// Built-in handling of `cancel` tasks when the application registered
    /// no handler for them: abort the named task if it runs here.
    async fn cancel(&self, entry_id: StreamId, envelope: &TaskEnvelope) {
        let responder = self.responder_for(envelope);
        if let Err(e) = responder.acknowledged("Cancellation received").await {
            tracing::error!(task_id = %envelope.id, error = %e, "Failed to acknowledge cancellation");
            return;
        }

        let target = envelope
            .context_value("cancel_task_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let victim = {
            let mut running = self.running();
            let found = running
                .iter()
                .find(|(_, r)| r.task_id == target)
                .map(|(id, _)| *id);
            found.and_then(|id| running.remove(&id).map(|r| (id, r)))
        };

        let cancelled = match victim {
            Some((victim_entry, running)) => {
                if let Some(abort) = &running.abort {
                    abort.abort();
                }
                tracing::info!(task_id = %target, "Cancelled running task");
                let sent = self
                    .responder(&running.task_id, &running.thread_id, &running.source_agent)
                    .failed(
                        "Task cancelled",
                        TaskError::new(ERROR_CANCELLED, format!("cancelled by task {}", envelope.id)),
                    )
                    .await;
                if sent.is_ok() {
                    self.ack_or_log(victim_entry).await;
                }
                true
            }
            None => {
                tracing::info!(task_id = %target, "Cancellation target not running here");
                false
            }
        };

        let results = json!({ "cancel_task_id": target, "cancelled": cancelled });
        match responder
            .completed("Cancellation processed", results.as_object().cloned())
            .await
        {
            Ok(_) => self.ack_or_log(entry_id).await,
            Err(e) => tracing::error!(task_id = %envelope.id, error = %e, "Failed to complete cancellation"),
        }
    }

    async fn dead_letter(
        &self,
        entry_id: StreamId,
        delivery_count: u32,
        reason: String,
        fields: relay_protocol::Fields,
        envelope: Option<TaskEnvelope>,
    ) {
        let letter = DeadLetter::new(
            &self.command_stream,
            &self.group,
            entry_id,
            delivery_count,
            reason.clone(),
            fields,
        );
        if let Err(e) = letter
            .redirect(
                self.context.transport().as_ref(),
                &self.dead_letter_stream,
                Some(self.max_len()),
            )
            .await
        {
            tracing::error!(entry = %entry_id, error = %e, "Failed to dead-letter entry");
            return;
        }

        if let Some(envelope) = envelope {
            let error = TaskError::new(ERROR_MAX_DELIVERIES_EXCEEDED, reason)
                .with_context("deliveries", json!(delivery_count))
                .with_context("dead_letter_stream", json!(self.dead_letter_stream));
            if let Err(e) = self
                .responder_for(&envelope)
                .failed("Task moved to dead-letter stream", error)
                .await
            {
                tracing::error!(task_id = %envelope.id, error = %e, "Failed to report dead-lettered task");
            }
        }
        self.ack_or_log(entry_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ms: u64) -> StreamId {
        StreamId::new(ms, 0)
    }

    #[test]
    fn test_watermark_waits_for_earlier_outstanding_entries() {
        let mut mark = Watermark::default();
        assert_eq!(mark.group_start(), GroupStart::Beginning);
        for ms in 1..=3 {
            mark.claimed(id(ms));
        }

        mark.acked(id(3));
        assert_eq!(mark.offset, None);
        mark.acked(id(2));
        assert_eq!(mark.offset, None);
        mark.acked(id(1));
        assert_eq!(mark.offset, Some(id(3)));
        assert_eq!(mark.group_start(), GroupStart::After(id(3)));
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let mut mark = Watermark::resume_from(Some(id(10)));
        mark.claimed(id(4));
        mark.acked(id(4));
        assert_eq!(mark.offset, Some(id(10)));

        mark.claimed(id(11));
        mark.claimed(id(12));
        mark.acked(id(12));
        assert_eq!(mark.offset, Some(id(10)));
        mark.acked(id(11));
        assert_eq!(mark.offset, Some(id(12)));
    }

    #[test]
    fn test_heartbeat_runs_well_inside_idle_timeout() {
        assert_eq!(heartbeat_interval(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(heartbeat_interval(Duration::ZERO), Duration::from_millis(50));
    }
}
