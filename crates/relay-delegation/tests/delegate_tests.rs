mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use relay_delegation::*;
use relay_protocol::*;
use relay_state::{AgentRole, StateStore};
use relay_transport::{DeadLetter, Fields, GroupStart, StreamId, StreamTransport};

async fn echo(task: TaskEnvelope, _progress: ProgressReporter) -> HandlerOutcome {
    Ok(json!({ "echo": task.description }).as_object().cloned())
}

async fn explode(_task: TaskEnvelope, _progress: ProgressReporter) -> HandlerOutcome {
    panic!("handler blew up")
}

async fn stall(_task: TaskEnvelope, _progress: ProgressReporter) -> HandlerOutcome {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(None)
}

async fn pending_count(memory: &relay_transport::MemoryTransport) -> usize {
    memory
        .pending("bear:commands", "bear-workers")
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_double_start_rejected_and_metadata_recorded() {
    let p = pair().await;
    p.delegate.register_handler("research", handler_fn(echo));
    p.delegate.register_handler("default", handler_fn(echo));
    assert_eq!(p.delegate.registered_task_types(), vec!["default", "research"]);

    p.delegate.start_processing().await.unwrap();
    assert!(p.delegate.is_processing().await);
    assert!(matches!(
        p.delegate.start_processing().await,
        Err(DelegationError::AlreadyRunning(_))
    ));
    p.delegate.stop_processing().await.unwrap();
    assert!(!p.delegate.is_processing().await);

    let metadata = p.store.namespace(TARGET).load_metadata().await.unwrap().unwrap();
    assert_eq!(metadata.role, AgentRole::Delegate);
    assert_eq!(metadata.agent_name, TARGET);
    assert_eq!(metadata.registered_handlers, vec!["default", "research"]);
}

#[tokio::test]
async fn test_panicking_handler_reports_failure() {
    let p = pair().await;
    p.delegate.register_handler("default", handler_fn(explode));
    p.delegate.start_processing().await.unwrap();

    p.delegator
        .delegate_task(TARGET, TaskRequest::new("default", "x"), None)
        .await
        .unwrap();
    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(
        statuses(&responses),
        vec![TaskStatus::Acknowledged, TaskStatus::Failed]
    );
    assert_eq!(responses[1].error_code(), Some(ERROR_HANDLER_PANICKED));

    // The processor survives and keeps serving.
    p.delegate.register_handler("default", handler_fn(echo));
    p.delegator
        .delegate_task(TARGET, TaskRequest::new("default", "again"), None)
        .await
        .unwrap();
    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(responses.last().unwrap().status, TaskStatus::Completed);
    p.delegate.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_malformed_envelope_is_dead_lettered() {
    let p = pair_with(CommunicationConfig {
        max_delivery_attempts: 1,
        ..fast_config()
    })
    .await;
    p.delegate.register_handler("default", handler_fn(echo));
    p.delegate.start_processing().await.unwrap();

    let garbage = Fields::from([("priority".to_string(), "\"very\"".to_string())]);
    let original = p.memory.append("bear:commands", garbage, None).await.unwrap();

    eventually(Duration::from_secs(6), || {
        let memory = p.memory.clone();
        async move { (memory.len("bear:dead_letter").await.unwrap() == 1).then_some(()) }
    })
    .await;
    eventually(Duration::from_secs(2), || {
        let memory = p.memory.clone();
        async move { (pending_count(&memory).await == 0).then_some(()) }
    })
    .await;

    let letters = p
        .memory
        .read_blocking(
            &[("bear:dead_letter".to_string(), StreamId::ZERO)].into(),
            Duration::ZERO,
            10,
        )
        .await
        .unwrap();
    let letter = DeadLetter::from_fields(&letters["bear:dead_letter"][0].fields).unwrap();
    assert_eq!(letter.original_id, original);
    assert_eq!(letter.source_stream, "bear:commands");
    assert_eq!(letter.delivery_count, 2);
    assert_eq!(letter.payload["priority"], "\"very\"");

    // Nothing could be reported for an undecodable envelope.
    assert!(p.delegator.get_task_responses(TARGET).await.unwrap().is_empty());
    p.delegate.stop_processing().await.unwrap();
}

/// Claim every command entry for a consumer that then disappears.
async fn claim_as_crashed_consumer(p: &Pair) {
    p.memory
        .create_group("bear:commands", "bear-workers", GroupStart::Beginning)
        .await
        .unwrap();
    let claimed = p
        .memory
        .read_group("bear:commands", "bear-workers", "bear-crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
}

#[tokio::test]
async fn test_entry_abandoned_by_crashed_consumer_is_recovered() {
    let p = pair().await;
    let task_id = p
        .delegator
        .delegate_task(TARGET, TaskRequest::new("default", "orphan"), None)
        .await
        .unwrap();
    claim_as_crashed_consumer(&p).await;

    p.delegate.register_handler("default", handler_fn(echo));
    p.delegate.start_processing().await.unwrap();

    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    let last = responses.last().unwrap();
    assert_eq!(last.task_id, task_id);
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.results.as_ref().unwrap()["echo"], json!("orphan"));
    p.delegate.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_deliveries_reported_as_failure() {
    let p = pair_with(CommunicationConfig {
        max_delivery_attempts: 1,
        ..fast_config()
    })
    .await;
    let task_id = p
        .delegator
        .delegate_task(TARGET, TaskRequest::new("default", "doomed"), None)
        .await
        .unwrap();
    claim_as_crashed_consumer(&p).await;

    p.delegate.register_handler("default", handler_fn(echo));
    p.delegate.start_processing().await.unwrap();

    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(statuses(&responses), vec![TaskStatus::Failed]);
    assert_eq!(responses[0].error_code(), Some(ERROR_MAX_DELIVERIES_EXCEEDED));
    assert_eq!(
        p.delegator.get_task_status(&task_id).await.unwrap().status,
        TaskStatus::Failed
    );
    assert_eq!(p.memory.len("bear:dead_letter").await.unwrap(), 1);
    p.delegate.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_task_resumes_on_restarted_delegate() {
    let config = CommunicationConfig {
        shutdown_timeout: 1,
        ..fast_config()
    };
    let p = pair_with(config.clone()).await;
    p.delegate.register_handler("default", handler_fn(stall));
    p.delegate.start_processing().await.unwrap();

    let task_id = p
        .delegator
        .delegate_task(TARGET, TaskRequest::new("default", "slow"), None)
        .await
        .unwrap();
    eventually(Duration::from_secs(5), || {
        let delegator = &p.delegator;
        let task_id = &task_id;
        async move {
            delegator.get_task_responses(TARGET).await.unwrap();
            let record = delegator.get_task_status(task_id).await?;
            (record.status == TaskStatus::Acknowledged).then_some(())
        }
    })
    .await;

    // The stalled handler outlives the shutdown window and is abandoned.
    p.delegate.stop_processing().await.unwrap();
    assert_eq!(pending_count(&p.memory).await, 1);

    let context = open_context(&p.memory, config).await;
    let restarted = Delegate::open(TARGET, context, Arc::new(p.store.namespace(TARGET)))
        .await
        .unwrap();
    restarted.register_handler("default", handler_fn(echo));
    restarted.start_processing().await.unwrap();

    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(responses.last().unwrap().status, TaskStatus::Completed);
    restarted.stop_processing().await.unwrap();

    let offsets = p.store.namespace(TARGET).load_offsets().await.unwrap();
    assert!(offsets.contains_key("bear:commands"));
}

#[tokio::test]
async fn test_cancel_aborts_running_task() {
    let p = pair().await;
    p.delegate.register_handler("default", handler_fn(stall));
    p.delegate.start_processing().await.unwrap();

    let task_id = p
        .delegator
        .delegate_task(TARGET, TaskRequest::new("default", "forever"), None)
        .await
        .unwrap();
    eventually(Duration::from_secs(5), || {
        let delegator = &p.delegator;
        let task_id = &task_id;
        async move {
            delegator.get_task_responses(TARGET).await.unwrap();
            let record = delegator.get_task_status(task_id).await?;
            (record.status == TaskStatus::Acknowledged).then_some(())
        }
    })
    .await;

    let cancel_id = p.delegator.cancel_task(&task_id).await.unwrap().unwrap();
    let cancel = p.delegator.get_task_status(&cancel_id).await.unwrap();
    assert_eq!(cancel.envelope.task_type, CANCEL_TASK_TYPE);
    assert_eq!(cancel.envelope.priority, MAX_PRIORITY);
    assert_eq!(cancel.envelope.context_value("cancel_task_id"), Some(&json!(task_id)));

    let (victim, cancel) = eventually(Duration::from_secs(5), || {
        let delegator = &p.delegator;
        let (task_id, cancel_id) = (&task_id, &cancel_id);
        async move {
            delegator.get_task_responses(TARGET).await.unwrap();
            let victim = delegator.get_task_status(task_id).await?;
            let cancel = delegator.get_task_status(cancel_id).await?;
            (victim.is_terminal() && cancel.is_terminal()).then_some((victim, cancel))
        }
    })
    .await;
    assert_eq!(victim.status, TaskStatus::Failed);
    assert_eq!(victim.last_response.unwrap().error_code(), Some(ERROR_CANCELLED));
    assert_eq!(cancel.status, TaskStatus::Completed);
    assert_eq!(
        cancel.last_response.unwrap().results.unwrap()["cancelled"],
        json!(true)
    );

    // Both entries are settled, so nothing is redelivered.
    eventually(Duration::from_secs(2), || {
        let memory = p.memory.clone();
        async move { (pending_count(&memory).await == 0).then_some(()) }
    })
    .await;
    assert_eq!(p.delegator.cancel_task(&task_id).await.unwrap(), None);
    assert!(matches!(
        p.delegator.cancel_task("nope").await,
        Err(DelegationError::UnknownTask(_))
    ));
    p.delegate.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_dispatch_is_bounded() {
    let p = pair_with(CommunicationConfig {
        max_concurrent_tasks: 2,
        ..fast_config()
    })
    .await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, m) = (Arc::clone(&current), Arc::clone(&peak));
    p.delegate.register_handler(
        "default",
        handler_fn(move |_task, _progress| {
            let (current, peak) = (Arc::clone(&c), Arc::clone(&m));
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                HandlerOutcome::Ok(None)
            }
        }),
    );

    let mut ids = Vec::new();
    for i in 0..6 {
        let request = TaskRequest::new("default", format!("job {i}"));
        ids.push(p.delegator.delegate_task(TARGET, request, None).await.unwrap());
    }
    p.delegate.start_processing().await.unwrap();

    eventually(Duration::from_secs(10), || {
        let delegator = &p.delegator;
        async move {
            delegator.get_task_responses(TARGET).await.unwrap();
            delegator.get_active_tasks().await.is_empty().then_some(())
        }
    })
    .await;
    for id in &ids {
        let record = p.delegator.get_task_status(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    p.delegate.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_response_helpers_validate_progress() {
    let p = pair().await;
    let bad = TaskProgress {
        total_steps: Some(1),
        ..TaskProgress::new("step", 5)
    };
    let err = p
        .delegate
        .update_task_progress("t-1", "th-1", DELEGATOR, "working", Some(bad))
        .await
        .unwrap_err();
    assert!(matches!(err, DelegationError::Protocol(_) | DelegationError::Validation(_)));
    assert_eq!(p.memory.len("colonel:responses").await.unwrap(), 0);

    let entry = p
        .delegate
        .update_task_progress(
            "t-1",
            "th-1",
            DELEGATOR,
            "working",
            Some(TaskProgress::new("step", 1).with_total_steps(3)),
        )
        .await
        .unwrap();
    assert!(entry > StreamId::ZERO);
}

async fn linger(_task: TaskEnvelope, _progress: ProgressReporter) -> HandlerOutcome {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Ok(None)
}

#[tokio::test]
async fn test_running_task_is_not_stolen_by_second_consumer() {
    let config = CommunicationConfig {
        max_delivery_attempts: 2,
        ..fast_config()
    };
    let p = pair_with(config.clone()).await;
    let context = open_context(&p.memory, config).await;
    let sibling = Delegate::open(TARGET, context, Arc::new(p.store.namespace(TARGET)))
        .await
        .unwrap();
    for delegate in [&p.delegate, &sibling] {
        delegate.register_handler("default", handler_fn(linger));
        delegate.start_processing().await.unwrap();
    }

    // The handler outlives three idle timeouts.
    p.delegator
        .delegate_task(TARGET, TaskRequest::new("default", "slow"), None)
        .await
        .unwrap();
    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(
        statuses(&responses),
        vec![TaskStatus::Acknowledged, TaskStatus::Completed]
    );
    assert_eq!(p.memory.len("bear:dead_letter").await.unwrap(), 0);
    eventually(Duration::from_secs(2), || {
        let memory = p.memory.clone();
        async move { (pending_count(&memory).await == 0).then_some(()) }
    })
    .await;

    p.delegate.stop_processing().await.unwrap();
    sibling.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_lost_group_resumes_after_processed_entries() {
    let p = pair().await;
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    p.delegate.register_handler(
        "default",
        handler_fn(move |_task, _progress| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Ok(None)
            }
        }),
    );
    p.delegate.start_processing().await.unwrap();

    p.delegator
        .delegate_task(TARGET, TaskRequest::new("default", "first"), None)
        .await
        .unwrap();
    collect_until_terminal(&p.delegator, TARGET).await;
    eventually(Duration::from_secs(2), || {
        let memory = p.memory.clone();
        async move { (pending_count(&memory).await == 0).then_some(()) }
    })
    .await;

    assert!(p.memory.destroy_group("bear:commands", "bear-workers"));
    let second = p
        .delegator
        .delegate_task(TARGET, TaskRequest::new("default", "second"), None)
        .await
        .unwrap();
    let responses = collect_until_terminal(&p.delegator, TARGET).await;
    assert_eq!(responses.last().unwrap().task_id, second);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    p.delegate.stop_processing().await.unwrap();
}
