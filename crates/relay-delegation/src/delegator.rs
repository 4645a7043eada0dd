//! The originating side of a delegation.
//!
//! The delegator owns the active-task table. It is mutated only by
//! `delegate_task`, by response ingestion (the background listener or an
//! explicit `get_task_responses`) and by cleanup, always under one lock
//! held across the read-modify-persist sequence.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Mutex, Notify};

use relay_protocol::{
    ProtocolError, TaskRequest, TaskResponse, ValidationError, CANCEL_TASK_TYPE, MAX_PRIORITY,
};
use relay_state::{ActiveTaskRecord, AgentMetadata, AgentRole, Offsets, StateStore};
use relay_transport::{StreamEntry, StreamId, TransportError};

use crate::background::{self, Background};
use crate::{AgentContext, DelegationError};

/// Invoked with every response applied to a task delegated with it.
pub type ResponseCallback =
    Arc<dyn Fn(TaskResponse) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a `ResponseCallback`.
pub fn response_callback<F, Fut>(f: F) -> ResponseCallback
where
    F: Fn(TaskResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |response| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(f(response))
    })
}

struct TaskTable {
    tasks: BTreeMap<String, ActiveTaskRecord>,
    /// Last response-stream entry consumed.
    offset: StreamId,
}

struct Shared {
    agent: String,
    context: AgentContext,
    store: Arc<dyn StateStore>,
    response_stream: String,
    table: Mutex<TaskTable>,
    callbacks: StdMutex<HashMap<String, ResponseCallback>>,
    /// Responses applied by `get_task_responses` for another target, kept
    /// until that target is asked for.
    unreturned: StdMutex<HashMap<String, Vec<TaskResponse>>>,
    changed: Notify,
}

pub struct Delegator {
    shared: Arc<Shared>,
    listener: Mutex<Option<Background>>,
}

impl Delegator {
    /// Open the delegator for `agent`, restoring its offsets and
    /// active-task table. A state store failure here is fatal.
    pub async fn open(
        agent: impl Into<String>,
        context: AgentContext,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, DelegationError> {
        let agent = agent.into();
        let response_stream = context.naming().response_stream(&agent);

        let offsets = store.load_offsets().await?;
        let tasks = store.load_active_tasks().await?;
        let offset = offsets.get(&response_stream).copied().unwrap_or(StreamId::ZERO);
        tracing::info!(
            agent = %agent,
            stream = %response_stream,
            offset = %offset,
            restored_tasks = tasks.len(),
            "Opened delegator"
        );

        let shared = Arc::new(Shared {
            agent,
            context,
            store,
            response_stream,
            table: Mutex::new(TaskTable { tasks, offset }),
            callbacks: StdMutex::new(HashMap::new()),
            unreturned: StdMutex::new(HashMap::new()),
            changed: Notify::new(),
        });
        shared.save_metadata().await;

        Ok(Self {
            shared,
            listener: Mutex::new(None),
        })
    }

    pub fn agent(&self) -> &str {
        &self.shared.agent
    }

    /// Validate `request`, append it to `target`'s command stream and start
    /// tracking it. Returns the task id.
    ///
    /// The record is only created once the append has succeeded, so a
    /// transport failure leaves no trace of the task.
    pub async fn delegate_task(
        &self,
        target: &str,
        request: TaskRequest,
        callback: Option<ResponseCallback>,
    ) -> Result<String, DelegationError> {
        let shared = &self.shared;
        let envelope = request.into_envelope(&shared.agent, target)?;
        let stream = shared.context.naming().command_stream(target);
        let fields = envelope.to_fields()?;

        let mut table = shared.table.lock().await;
        if table.tasks.contains_key(&envelope.id) {
            return Err(ValidationError::InvalidValue {
                field: "id".into(),
                reason: format!("task id {} is already tracked", envelope.id),
            }
            .into());
        }

        let entry = shared
            .context
            .transport()
            .append(&stream, fields, Some(shared.context.config().stream_max_length))
            .await?;

        let task_id = envelope.id.clone();
        tracing::info!(
            task_id = %task_id,
            target = %target,
            task_type = %envelope.task_type,
            stream = %stream,
            entry = %entry,
            "Delegated task"
        );
        if let Some(callback) = callback {
            shared.callbacks().insert(task_id.clone(), callback);
        }
        table.tasks.insert(task_id.clone(), ActiveTaskRecord::new(envelope));
        shared.persist_tasks(&table).await;
        Ok(task_id)
    }

    /// Consume new entries from this delegator's response stream, apply
    /// them, and return every response for tasks delegated to `target` not
    /// returned before.
    ///
    /// Entries for other targets are applied as well and held back for a
    /// later call naming their target. Responses ingested by the background
    /// listener are not returned here; use a callback for those.
    pub async fn get_task_responses(
        &self,
        target: &str,
    ) -> Result<Vec<TaskResponse>, DelegationError> {
        let applied = self.shared.poll(Duration::ZERO).await?;
        let mut unreturned = self.shared.unreturned();
        for (record_target, response) in applied {
            unreturned.entry(record_target).or_default().push(response);
        }
        Ok(unreturned.remove(target).unwrap_or_default())
    }

    pub async fn get_task_status(&self, task_id: &str) -> Option<ActiveTaskRecord> {
        self.shared.table.lock().await.tasks.get(task_id).cloned()
    }

    /// Tracked tasks that have not reached a terminal status.
    pub async fn get_active_tasks(&self) -> Vec<ActiveTaskRecord> {
        let table = self.shared.table.lock().await;
        table
            .tasks
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect()
    }

    /// Non-terminal tasks created more than `timeout` ago.
    pub async fn get_timed_out_tasks(&self, timeout: chrono::Duration) -> Vec<ActiveTaskRecord> {
        self.shared.timed_out(timeout).await
    }

    /// Tasks still without any response after `acknowledgment_timeout`.
    pub async fn get_unacknowledged_tasks(&self) -> Vec<ActiveTaskRecord> {
        self.shared.unacknowledged().await
    }

    /// Wait until `task_id` reaches a terminal status.
    ///
    /// Progress is only observed while responses are being ingested, by
    /// the listener or by concurrent `get_task_responses` calls.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<ActiveTaskRecord, DelegationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_task_status(task_id).await {
                None => return Err(DelegationError::UnknownTask(task_id.to_string())),
                Some(record) if record.is_terminal() => return Ok(record),
                Some(_) => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DelegationError::Timeout {
                    task_id: task_id.to_string(),
                    waited: timeout,
                });
            }
        }
    }

    /// Ask the delegate running `task_id` to cancel it by delegating a
    /// `cancel` task to the same target. Returns the id of the cancel task,
    /// or `None` when the task already finished.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Option<String>, DelegationError> {
        let record = self
            .get_task_status(task_id)
            .await
            .ok_or_else(|| DelegationError::UnknownTask(task_id.to_string()))?;
        if record.is_terminal() {
            return Ok(None);
        }

        let request = TaskRequest::new(CANCEL_TASK_TYPE, format!("Cancel task {task_id}"))
            .with_priority(MAX_PRIORITY)
            .with_estimates(0.1, 0.1)
            .with_success_metric("Task cancelled successfully")
            .with_context("cancel_task_id", json!(task_id))
            .with_context("action", json!("cancel"));
        let cancel_id = self
            .delegate_task(&record.target_agent, request, None)
            .await?;
        tracing::info!(task_id = %task_id, cancel_task_id = %cancel_id, "Requested cancellation");
        Ok(Some(cancel_id))
    }

    /// Drop terminal records last updated more than `max_age` ago.
    /// Returns how many were removed.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> usize {
        self.shared.cleanup(max_age).await
    }

    pub async fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_finished())
    }

    /// Start the background loop that ingests responses and runs
    /// housekeeping every `cleanup_interval`.
    pub async fn start_listening(&self) -> Result<(), DelegationError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|l| !l.is_finished()) {
            return Err(DelegationError::AlreadyRunning("delegator listener"));
        }
        let shared = Arc::clone(&self.shared);
        *listener = Some(Background::spawn("delegator listener", move |shutdown| {
            shared.listen(shutdown)
        }));
        Ok(())
    }

    /// Stop the listener, letting an in-progress ingest finish, then flush
    /// the table, offsets and metadata.
    pub async fn stop_listening(&self) -> Result<(), DelegationError> {
        if let Some(listener) = self.listener.lock().await.take() {
            listener
                .stop(self.shared.context.config().shutdown_window())
                .await;
        }
        self.shared.flush().await
    }
}

impl Shared {
    fn callbacks(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResponseCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unreturned(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<TaskResponse>>> {
        self.unreturned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offsets(&self, table: &TaskTable) -> Offsets {
        BTreeMap::from([(self.response_stream.clone(), table.offset)])
    }

    /// Read, apply and persist one batch of responses. Returns
    /// `(target_agent, response)` for every response that was applied.
    async fn poll(&self, block: Duration) -> Result<Vec<(String, TaskResponse)>, DelegationError> {
        let config = self.context.config();
        let offsets = {
            let table = self.table.lock().await;
            self.offsets(&table)
        };
        let mut batch = self
            .context
            .transport()
            .read_blocking(&offsets, block, config.read_batch_size)
            .await?;
        let entries = batch.remove(&self.response_stream).unwrap_or_default();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.ingest(entries).await)
    }

    async fn ingest(&self, entries: Vec<StreamEntry>) -> Vec<(String, TaskResponse)> {
        let mut applied = Vec::new();
        {
            let mut table = self.table.lock().await;
            let start = table.offset;
            for entry in entries {
                // A concurrent reader may already have consumed this entry.
                if entry.id <= table.offset {
                    continue;
                }
                table.offset = entry.id;
                match self.apply(&mut table, &entry) {
                    Ok(applied_to) => applied.push(applied_to),
                    Err(ProtocolError::DuplicateResponse { task_id, entry_id }) => {
                        tracing::debug!(task_id = %task_id, entry = %entry_id, "Skipped replayed response");
                    }
                    Err(e) => {
                        tracing::warn!(entry = %entry.id, error = %e, "Discarded response");
                    }
                }
            }
            if table.offset != start {
                self.persist_tasks(&table).await;
                self.persist_offsets(&table).await;
            }
        }

        if !applied.is_empty() {
            self.changed.notify_waiters();
            self.run_callbacks(&applied).await;
        }
        applied
    }

    fn apply(
        &self,
        table: &mut TaskTable,
        entry: &StreamEntry,
    ) -> Result<(String, TaskResponse), ProtocolError> {
        let response = TaskResponse::from_fields(&entry.fields)?;
        let record = table
            .tasks
            .get_mut(&response.task_id)
            .ok_or_else(|| ProtocolError::UnknownTask(response.task_id.clone()))?;
        record.apply(&response, entry.id)?;
        tracing::info!(
            task_id = %response.task_id,
            status = %response.status,
            entry = %entry.id,
            "Applied task response"
        );
        Ok((record.target_agent.clone(), response))
    }

    async fn run_callbacks(&self, applied: &[(String, TaskResponse)]) {
        for (_, response) in applied {
            let callback = {
                let mut callbacks = self.callbacks();
                if response.status.is_terminal() {
                    callbacks.remove(&response.task_id)
                } else {
                    callbacks.get(&response.task_id).cloned()
                }
            };
            if let Some(callback) = callback {
                callback(response.clone()).await;
            }
        }
    }

    async fn persist_tasks(&self, table: &TaskTable) {
        if let Err(e) = self.store.save_active_tasks(&table.tasks).await {
            tracing::error!(agent = %self.agent, error = %e, "Failed to persist active tasks");
        }
    }

    async fn persist_offsets(&self, table: &TaskTable) {
        if let Err(e) = self.store.save_offsets(&self.offsets(table)).await {
            tracing::error!(agent = %self.agent, error = %e, "Failed to persist offsets");
        }
    }

    async fn save_metadata(&self) {
        let active = {
            let table = self.table.lock().await;
            table.tasks.values().filter(|r| !r.is_terminal()).count()
        };
        let mut metadata = AgentMetadata::new(&self.agent, AgentRole::Delegator);
        metadata.active_task_count = active;
        if let Err(e) = self.store.save_metadata(&metadata).await {
            tracing::error!(agent = %self.agent, error = %e, "Failed to persist agent metadata");
        }
    }

    async fn flush(&self) -> Result<(), DelegationError> {
        {
            let table = self.table.lock().await;
            self.store.save_active_tasks(&table.tasks).await?;
            self.store.save_offsets(&self.offsets(&table)).await?;
        }
        self.save_metadata().await;
        tracing::debug!(agent = %self.agent, "Flushed delegator state");
        Ok(())
    }

    async fn timed_out(&self, timeout: chrono::Duration) -> Vec<ActiveTaskRecord> {
        let now = Utc::now();
        let table = self.table.lock().await;
        table
            .tasks
            .values()
            .filter(|r| r.is_timed_out(now, timeout))
            .cloned()
            .collect()
    }

    async fn unacknowledged(&self) -> Vec<ActiveTaskRecord> {
        let now = Utc::now();
        let deadline = self.context.config().ack_deadline();
        let table = self.table.lock().await;
        table
            .tasks
            .values()
            .filter(|r| r.is_unacknowledged(now, deadline))
            .cloned()
            .collect()
    }

    async fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut table = self.table.lock().await;
        let expired: Vec<String> = table
            .tasks
            .values()
            .filter(|r| r.is_terminal() && r.last_updated < cutoff)
            .map(|r| r.task_id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        {
            let mut callbacks = self.callbacks();
            for task_id in &expired {
                table.tasks.remove(task_id);
                callbacks.remove(task_id);
            }
            let mut unreturned = self.unreturned();
            for responses in unreturned.values_mut() {
                responses.retain(|r| !expired.contains(&r.task_id));
            }
            unreturned.retain(|_, responses| !responses.is_empty());
        }
        self.persist_tasks(&table).await;
        tracing::info!(agent = %self.agent, purged = expired.len(), "Purged finished tasks");
        expired.len()
    }

    async fn housekeeping(&self) {
        let config = self.context.config();
        self.cleanup(config.max_age()).await;
        for record in self.timed_out(config.task_deadline()).await {
            tracing::warn!(
                task_id = %record.task_id,
                target = %record.target_agent,
                status = %record.status,
                "Task timed out"
            );
        }
        for record in self.unacknowledged().await {
            tracing::warn!(
                task_id = %record.task_id,
                target = %record.target_agent,
                "Task not acknowledged"
            );
        }
        self.save_metadata().await;
    }

    async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let config = self.context.config().clone();
        let mut housekeeping = tokio::time::interval(config.housekeeping_interval());
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures = 0u32;
        tracing::info!(agent = %self.agent, stream = %self.response_stream, "Delegator listening");

        loop {
            if background::stopping(&shutdown) {
                break;
            }
            let offsets = {
                let table = self.table.lock().await;
                self.offsets(&table)
            };
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                _ = housekeeping.tick() => {
                    self.housekeeping().await;
                    continue;
                }
                read = self.context.transport().read_blocking(
                    &offsets,
                    config.read_block(),
                    config.read_batch_size,
                ) => read,
            };

            match read {
                Ok(mut batch) => {
                    failures = 0;
                    if let Some(entries) = batch.remove(&self.response_stream) {
                        self.ingest(entries).await;
                    }
                }
                Err(TransportError::Closed) => {
                    tracing::error!(agent = %self.agent, "Transport closed, delegator listener halting");
                    break;
                }
                Err(e) => {
                    let delay = background::read_retry_delay(&config, failures, &e);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        agent = %self.agent,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Response read failed"
                    );
                    if background::pause(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(agent = %self.agent, "Delegator stopped listening");
    }
}
