//! Run a single agent against the configured log service.
//!
//! `serve` keeps a delegate with the echo handler running until interrupted;
//! `send` delegates one task and waits for its final response. Both reach
//! the log service named by `communication.transport_url`, so a delegate and
//! a delegator in separate processes meet on the same Redis server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use relay_delegation::{handler_fn, AgentContext, Delegate, Delegator};
use relay_protocol::{TaskRequest, TaskResponse};
use relay_state::FileStateStore;

use crate::config::ConnectorConfig;
use crate::demo::{echo, ECHO_TASK_TYPE};

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub target: String,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct SendReport {
    pub task_id: String,
    /// Responses in the order they were read.
    pub responses: Vec<TaskResponse>,
}

pub async fn connect(config: &ConnectorConfig) -> anyhow::Result<AgentContext> {
    if config.communication.transport_url.starts_with("memory://") {
        tracing::warn!("In-memory transport is private to this process; no other agent can reach it");
    }
    AgentContext::connect(config.communication.clone())
        .await
        .context("connecting to the log service")
}

/// Process tasks addressed to `agent` until `shutdown` resolves.
pub async fn serve(
    config: &ConnectorConfig,
    context: AgentContext,
    agent: &str,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let store = FileStateStore::new(&config.state.dir, agent)?;
    let delegate = Delegate::open(agent, context, Arc::new(store)).await?;
    delegate.register_handler(ECHO_TASK_TYPE, handler_fn(echo));
    delegate.start_processing().await?;
    tracing::info!(agent, task_types = ?delegate.registered_task_types(), "Serving");

    shutdown.await;
    tracing::info!(agent, "Shutting down");
    delegate.stop_processing().await?;
    Ok(())
}

/// Delegate one task as the configured agent and collect its responses
/// until one is final.
pub async fn send(
    config: &ConnectorConfig,
    context: AgentContext,
    options: &SendOptions,
) -> anyhow::Result<SendReport> {
    let agent = &config.agent.name;
    anyhow::ensure!(
        agent != &options.target,
        "target must differ from the delegating agent '{agent}'"
    );
    let request = TaskRequest::new(&options.task_type, &options.description)
        .with_priority(options.priority);

    let store = FileStateStore::new(&config.state.dir, agent)?;
    let delegator = Delegator::open(agent, context, Arc::new(store)).await?;
    let task_id = delegator
        .delegate_task(&options.target, request, None)
        .await?;
    tracing::info!(task_id = %task_id, target = %options.target, "Task delegated");

    let deadline = tokio::time::Instant::now() + options.timeout;
    let mut responses = Vec::new();
    loop {
        responses.extend(delegator.get_task_responses(&options.target).await?);
        let finished = delegator
            .get_task_status(&task_id)
            .await
            .is_some_and(|record| record.is_terminal());
        if finished {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "task {task_id} not finished after {}s",
                options.timeout.as_secs()
            );
        }
        tokio::time::sleep(config.communication.read_block().min(Duration::from_millis(250))).await;
    }
    Ok(SendReport { task_id, responses })
}
