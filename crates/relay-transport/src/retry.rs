//! Retry/backoff and circuit breaking for transport calls.
//!
//! `ResilientTransport` wraps any `StreamTransport`. Transient failures
//! (connection loss, timeouts) are retried with exponential backoff up to
//! `max_retries` times. When an operation exhausts its retries the breaker
//! opens and every call fails fast with `TransportError::CircuitOpen` until
//! the cooldown has passed; the next call then tries the service
//! (half-open) and closes the circuit on success. While that trial call is in
//! flight every other call still fails fast.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use relay_protocol::Fields;

use crate::transport::*;
use crate::{StreamId, TransportError};

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Randomize each delay within `[d/2, d]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all; every failure surfaces immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(millis as u64);
        if self.jitter && !delay.is_zero() {
            let low = delay / 2;
            rand::thread_rng().gen_range(low..=delay)
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Failing fast until the given instant.
    Open { until: Instant },
    /// Cooldown elapsed; the next call decides.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    failures: u32,
    cooldown: Duration,
    /// A half-open trial call is running.
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_threshold: failure_threshold.max(1),
            failures: 0,
            cooldown,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed. `Ok(true)` admits the single trial call of
    /// the half-open state; `Err` carries the remaining cooldown, zero while
    /// another caller's trial call is in flight.
    pub fn check(&mut self) -> Result<bool, Duration> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if self.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(until - now)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("Transport recovered, closing circuit");
        }
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.trial_in_flight = false;
        let reopen = matches!(self.state, CircuitState::HalfOpen);
        if reopen || self.failures >= self.failure_threshold {
            self.trip();
        }
    }

    /// The trial call was abandoned before the service answered; the next call
    /// becomes the trial instead.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn trip(&mut self) {
        tracing::warn!(cooldown = ?self.cooldown, "Opening transport circuit");
        self.trial_in_flight = false;
        self.state = CircuitState::Open {
            until: Instant::now() + self.cooldown,
        };
    }
}

/// Releases the half-open trial slot if the calling future is dropped
/// mid-flight, e.g. by a `select!` losing the race.
struct TrialSlot<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release_trial();
        }
    }
}

/// A `StreamTransport` decorator adding retries and a circuit breaker.
pub struct ResilientTransport {
    inner: Arc<dyn StreamTransport>,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientTransport {
    pub fn new(inner: Arc<dyn StreamTransport>, policy: RetryPolicy, cooldown: Duration) -> Self {
        Self {
            inner,
            policy,
            breaker: Mutex::new(CircuitBreaker::new(1, cooldown)),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker().state()
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, TransportError>> + Send,
        T: Send,
    {
        let trial = self
            .breaker()
            .check()
            .map_err(|retry_in| TransportError::CircuitOpen { retry_in })?;
        let mut slot = TrialSlot {
            breaker: &self.breaker,
            held: trial,
        };

        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => {
                    slot.held = false;
                    self.breaker().record_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retries < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retries);
                    retries += 1;
                    tracing::warn!(
                        op,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    slot.held = false;
                    self.breaker().record_failure();
                    tracing::error!(op, attempts = retries + 1, error = %e, "Transport retries exhausted");
                    return Err(TransportError::RetriesExhausted {
                        op,
                        attempts: retries + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    // The service answered, so the trial has done its job.
                    if slot.held {
                        slot.held = false;
                        self.breaker().record_success();
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl StreamTransport for ResilientTransport {
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError> {
        self.call("append", || self.inner.append(stream, fields.clone(), max_len))
            .await
    }

    async fn read_blocking(
        &self,
        offsets: &BTreeMap<String, StreamId>,
        block: Duration,
        count: usize,
    ) -> Result<BTreeMap<String, Vec<StreamEntry>>, TransportError> {
        self.call("read", || self.inner.read_blocking(offsets, block, count))
            .await
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, TransportError> {
        self.call("create_group", || self.inner.create_group(stream, group, start))
            .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        self.call("read_group", || {
            self.inner.read_group(stream, group, consumer, count, block)
        })
        .await
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        self.call("claim_pending", || {
            self.inner.claim_pending(stream, group, consumer, min_idle, count)
        })
        .await
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError> {
        self.call("touch", || self.inner.touch(stream, group, consumer, ids))
            .await
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError> {
        self.call("ack", || self.inner.ack(stream, group, id)).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<PendingEntry>, TransportError> {
        self.call("pending", || self.inner.pending(stream, group)).await
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, TransportError> {
        self.call("trim", || self.inner.trim(stream, max_len)).await
    }

    async fn len(&self, stream: &str) -> Result<usize, TransportError> {
        self.call("len", || self.inner.len(stream)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.call("ping", || self.inner.ping()).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(max_ms),
            jitter: false,
        }
    }

    #[test]
    fn test_delays_grow_exponentially_and_cap() {
        let policy = fixed(100, 1000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..fixed(200, 10_000)
        };
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_breaker_opens_and_half_opens_after_cooldown() {
        let mut breaker = CircuitBreaker::new(2, Duration::ZERO);
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));

        // Zero cooldown: the next check moves to half-open.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.trip();
        assert!(breaker.check().is_err());

        let mut breaker = CircuitBreaker::new(3, Duration::ZERO);
        breaker.trip();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn test_half_open_admits_a_single_trial_call() {
        let mut breaker = CircuitBreaker::new(1, Duration::ZERO);
        assert_eq!(breaker.check(), Ok(false));
        breaker.trip();

        assert_eq!(breaker.check(), Ok(true));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.check(), Err(Duration::ZERO));

        // An abandoned trial hands the slot to the next caller.
        breaker.release_trial();
        assert_eq!(breaker.check(), Ok(true));
        breaker.record_success();
        assert_eq!(breaker.check(), Ok(false));
    }
}
