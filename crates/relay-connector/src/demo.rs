//! One-process demonstration: a delegator hands a task to a delegate over
//! an in-memory log service, with both sides persisting to the configured
//! state directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::sync::mpsc;

use relay_delegation::{
    handler_fn, response_callback, AgentContext, Delegate, Delegator, HandlerOutcome,
    ProgressReporter,
};
use relay_protocol::{TaskEnvelope, TaskRequest, TaskResponse, TaskStatus};
use relay_state::FileStateStore;
use relay_transport::MemoryTransport;

use crate::config::ConnectorConfig;

pub const ECHO_TASK_TYPE: &str = "echo";

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub target: String,
    pub description: String,
    pub priority: i32,
}

#[derive(Debug)]
pub struct DemoReport {
    pub task_id: String,
    pub final_status: TaskStatus,
    /// Responses in the order the delegator applied them.
    pub responses: Vec<TaskResponse>,
}

/// Handler behind `ECHO_TASK_TYPE`: returns the description it was given.
pub async fn echo(task: TaskEnvelope, progress: ProgressReporter) -> HandlerOutcome {
    if let Err(e) = progress.step("echoing", 1, 1).await {
        tracing::warn!(task_id = %task.id, error = %e, "Progress report failed");
    }
    Ok(json!({
        "echo": task.description,
        "priority": task.priority,
        "from": task.source_agent,
    })
    .as_object()
    .cloned())
}

pub async fn run(config: &ConnectorConfig, options: &DemoOptions) -> anyhow::Result<DemoReport> {
    let agent = &config.agent.name;
    anyhow::ensure!(
        agent != &options.target,
        "target must differ from the delegating agent '{agent}'"
    );

    let request = TaskRequest::new(ECHO_TASK_TYPE, &options.description)
        .with_priority(options.priority)
        .with_success_metric("Description echoed back");
    request
        .clone()
        .into_envelope(agent, &options.target)
        .context("invalid demo task")?;

    let transport = Arc::new(MemoryTransport::new());
    let context = AgentContext::open(config.communication.clone(), transport)
        .await
        .context("opening transport")?;

    let delegate_store = FileStateStore::new(&config.state.dir, &options.target)?;
    let delegate = Delegate::open(&options.target, context.clone(), Arc::new(delegate_store)).await?;
    delegate.register_handler(ECHO_TASK_TYPE, handler_fn(echo));
    delegate.start_processing().await?;

    let delegator_store = FileStateStore::new(&config.state.dir, agent)?;
    let delegator = Delegator::open(agent, context.clone(), Arc::new(delegator_store)).await?;
    delegator.start_listening().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = response_callback(move |response: TaskResponse| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(response);
        }
    });
    let task_id = delegator
        .delegate_task(&options.target, request, Some(callback))
        .await?;
    tracing::info!(task_id = %task_id, target = %options.target, "Demo task delegated");

    let outcome = delegator
        .wait_for_completion(&task_id, COMPLETION_TIMEOUT)
        .await;

    delegator.stop_listening().await?;
    delegate.stop_processing().await?;
    context.close().await?;

    let record = outcome?;
    let mut responses = Vec::new();
    while let Ok(response) = rx.try_recv() {
        responses.push(response);
    }
    Ok(DemoReport {
        task_id,
        final_status: record.status,
        responses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_delegation::CommunicationConfig;
    use relay_state::StateStore;

    fn quick_config(dir: &std::path::Path) -> ConnectorConfig {
        ConnectorConfig {
            communication: CommunicationConfig {
                read_block_timeout: 50,
                ..Default::default()
            },
            state: crate::config::StateSection {
                dir: dir.to_path_buf(),
            },
            ..Default::default()
        }
    }

    fn options() -> DemoOptions {
        DemoOptions {
            target: "bear".to_string(),
            description: "hello".to_string(),
            priority: 7,
        }
    }

    #[tokio::test]
    async fn test_demo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path());

        let report = run(&config, &options()).await.unwrap();
        assert_eq!(report.final_status, TaskStatus::Completed);
        let statuses: Vec<TaskStatus> = report.responses.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Acknowledged, TaskStatus::InProgress, TaskStatus::Completed]
        );
        let results = report.responses[2].results.as_ref().unwrap();
        assert_eq!(results["echo"], json!("hello"));
        assert_eq!(results["priority"], json!(7));

        let store = FileStateStore::new(dir.path(), "colonel").unwrap();
        let snapshot = store.load_snapshot().await.unwrap();
        assert_eq!(
            snapshot.active_tasks[&report.task_id].status,
            TaskStatus::Completed
        );
        assert!(snapshot.metadata.is_some());
        let bear = FileStateStore::new(dir.path(), "bear").unwrap();
        assert!(bear.load_offsets().await.unwrap().contains_key("bear:commands"));
    }

    #[tokio::test]
    async fn test_demo_rejects_self_delegation() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path());
        let options = DemoOptions {
            target: "colonel".to_string(),
            ..options()
        };
        assert!(run(&config, &options).await.is_err());
    }

    #[tokio::test]
    async fn test_demo_rejects_invalid_priority() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path());
        let options = DemoOptions {
            priority: 0,
            ..options()
        };
        assert!(run(&config, &options).await.is_err());
    }
}
