use std::sync::Arc;
use std::time::Duration;

use relay_transport::*;

fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

fn resilient(memory: &MemoryTransport, max_retries: u32, cooldown: Duration) -> ResilientTransport {
    ResilientTransport::new(Arc::new(memory.clone()), quick_policy(max_retries), cooldown)
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let memory = MemoryTransport::new();
    let t = resilient(&memory, 3, Duration::from_secs(30));
    memory.fail_next_calls(2);

    let id = t.append("s", Fields::new(), None).await.unwrap();
    assert!(id > StreamId::ZERO);
    assert_eq!(memory.len("s").await.unwrap(), 1);
    assert_eq!(t.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_exhausted_retries_open_circuit() {
    let memory = MemoryTransport::new();
    let t = resilient(&memory, 2, Duration::from_secs(30));
    memory.set_online(false);

    let err = t.ping().await.unwrap_err();
    match &err {
        TransportError::RetriesExhausted { op, attempts, .. } => {
            assert_eq!(*op, "ping");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_unavailable());

    // Service is back, but the circuit fails fast until the cooldown ends.
    memory.set_online(true);
    let err = t.ping().await.unwrap_err();
    assert!(matches!(err, TransportError::CircuitOpen { .. }));
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_circuit_recovers_after_cooldown() {
    let memory = MemoryTransport::new();
    let t = resilient(&memory, 0, Duration::from_millis(20));
    memory.set_online(false);
    assert!(t.ping().await.is_err());
    memory.set_online(true);

    tokio::time::sleep(Duration::from_millis(30)).await;
    t.ping().await.unwrap();
    assert_eq!(t.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let memory = MemoryTransport::new();
    let t = resilient(&memory, 5, Duration::from_secs(30));
    memory.append("s", Fields::new(), None).await.unwrap();

    let err = t
        .read_group("s", "missing", "c", 1, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSuchGroup { .. }));
    assert_eq!(t.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_lets_one_trial_call_through() {
    let memory = MemoryTransport::new();
    let t = Arc::new(resilient(&memory, 0, Duration::from_millis(20)));
    memory.set_online(false);
    assert!(t.ping().await.is_err());
    memory.set_online(true);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // A blocking read becomes the trial call and holds the half-open slot.
    let trial_transport = Arc::clone(&t);
    let trial = tokio::spawn(async move {
        let offsets = std::collections::BTreeMap::from([("s".to_string(), StreamId::ZERO)]);
        trial_transport
            .read_blocking(&offsets, Duration::from_millis(300), 10)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.circuit_state(), CircuitState::HalfOpen);
    let err = t.ping().await.unwrap_err();
    assert!(matches!(err, TransportError::CircuitOpen { .. }));

    assert!(trial.await.unwrap().unwrap().is_empty());
    assert_eq!(t.circuit_state(), CircuitState::Closed);
    t.ping().await.unwrap();
}
