#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_delegation::*;
use relay_protocol::{TaskResponse, TaskStatus};
use relay_state::MemoryStateStore;
use relay_transport::MemoryTransport;

pub const DELEGATOR: &str = "colonel";
pub const TARGET: &str = "bear";

pub fn fast_config() -> CommunicationConfig {
    CommunicationConfig {
        read_block_timeout: 50,
        max_retries: 2,
        retry_base_delay: 1,
        max_retry_delay: 1,
        retry_jitter: false,
        circuit_cooldown: 1,
        claim_idle_timeout: 1,
        shutdown_timeout: 2,
        ..Default::default()
    }
}

pub async fn open_context(memory: &MemoryTransport, config: CommunicationConfig) -> AgentContext {
    AgentContext::open(config, Arc::new(memory.clone()))
        .await
        .unwrap()
}

pub struct Pair {
    pub memory: MemoryTransport,
    pub store: MemoryStateStore,
    pub delegator: Delegator,
    pub delegate: Delegate,
}

pub async fn pair_with(config: CommunicationConfig) -> Pair {
    let memory = MemoryTransport::new();
    let store = MemoryStateStore::new(DELEGATOR);
    let context = open_context(&memory, config).await;
    let delegator = Delegator::open(DELEGATOR, context.clone(), Arc::new(store.clone()))
        .await
        .unwrap();
    let delegate = Delegate::open(TARGET, context, Arc::new(store.namespace(TARGET)))
        .await
        .unwrap();
    Pair {
        memory,
        store,
        delegator,
        delegate,
    }
}

pub async fn pair() -> Pair {
    pair_with(fast_config()).await
}

/// Poll `check` every 20ms until it yields a value or `limit` elapses.
pub async fn eventually<T, F, Fut>(limit: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Collect responses for `target` until one with a terminal status arrives.
pub async fn collect_until_terminal(delegator: &Delegator, target: &str) -> Vec<TaskResponse> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !seen.iter().any(|r: &TaskResponse| r.status.is_terminal()) {
        assert!(tokio::time::Instant::now() < deadline, "no terminal response");
        seen.extend(delegator.get_task_responses(target).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    seen
}

pub fn statuses(responses: &[TaskResponse]) -> Vec<TaskStatus> {
    responses.iter().map(|r| r.status).collect()
}
