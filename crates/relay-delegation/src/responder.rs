use std::sync::Arc;

use serde_json::{Map, Value};

use relay_protocol::{StreamNaming, TaskEnvelope, TaskError, TaskProgress, TaskResponse};
use relay_transport::{StreamId, StreamTransport};

use crate::DelegationError;

/// Appends lifecycle responses for one task to its delegator's response
/// stream.
#[derive(Clone)]
pub struct Responder {
    transport: Arc<dyn StreamTransport>,
    stream: String,
    max_len: usize,
    task_id: String,
    thread_id: String,
}

impl Responder {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        naming: &StreamNaming,
        max_len: usize,
        task_id: impl Into<String>,
        thread_id: impl Into<String>,
        source_agent: &str,
    ) -> Self {
        Self {
            transport,
            stream: naming.response_stream(source_agent),
            max_len,
            task_id: task_id.into(),
            thread_id: thread_id.into(),
        }
    }

    pub fn for_envelope(
        transport: Arc<dyn StreamTransport>,
        naming: &StreamNaming,
        max_len: usize,
        envelope: &TaskEnvelope,
    ) -> Self {
        Self::new(
            transport,
            naming,
            max_len,
            envelope.id.clone(),
            envelope.thread_id.clone(),
            &envelope.source_agent,
        )
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Validate and append a response. Invalid responses never reach the
    /// stream.
    pub async fn send(&self, response: TaskResponse) -> Result<StreamId, DelegationError> {
        let fields = response.to_fields()?;
        let id = self
            .transport
            .append(&self.stream, fields, Some(self.max_len))
            .await?;
        tracing::debug!(
            task_id = %self.task_id,
            status = %response.status,
            stream = %self.stream,
            entry = %id,
            "Sent task response"
        );
        Ok(id)
    }

    pub async fn acknowledged(&self, message: &str) -> Result<StreamId, DelegationError> {
        self.send(TaskResponse::acknowledged(&self.task_id, &self.thread_id, message))
            .await
    }

    pub async fn in_progress(
        &self,
        message: &str,
        progress: Option<TaskProgress>,
    ) -> Result<StreamId, DelegationError> {
        self.send(TaskResponse::in_progress(
            &self.task_id,
            &self.thread_id,
            message,
            progress,
        ))
        .await
    }

    pub async fn completed(
        &self,
        message: &str,
        results: Option<Map<String, Value>>,
    ) -> Result<StreamId, DelegationError> {
        self.send(TaskResponse::completed(
            &self.task_id,
            &self.thread_id,
            message,
            results,
        ))
        .await
    }

    pub async fn failed(&self, message: &str, error: TaskError) -> Result<StreamId, DelegationError> {
        self.send(TaskResponse::failed(&self.task_id, &self.thread_id, message, error))
            .await
    }
}

/// Handed to a running handler so it can report intermediate progress.
///
/// Reports are appended in call order, between the task's acknowledgment
/// and its final response.
#[derive(Clone)]
pub struct ProgressReporter {
    responder: Responder,
}

impl ProgressReporter {
    pub(crate) fn new(responder: Responder) -> Self {
        Self { responder }
    }

    pub fn task_id(&self) -> &str {
        self.responder.task_id()
    }

    pub async fn report(
        &self,
        message: &str,
        progress: Option<TaskProgress>,
    ) -> Result<(), DelegationError> {
        self.responder.in_progress(message, progress).await.map(|_| ())
    }

    /// Report `completed` of `total` steps done, currently at `step`.
    pub async fn step(&self, step: &str, completed: u32, total: u32) -> Result<(), DelegationError> {
        let progress = TaskProgress::new(step, completed).with_total_steps(total);
        self.report(step, Some(progress)).await
    }
}
