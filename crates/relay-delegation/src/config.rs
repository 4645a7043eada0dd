//! Communication settings shared by delegators and delegates.
//!
//! Every field has a default, so an empty `[communication]` table (or no
//! table at all) yields a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_protocol::StreamNaming;
use relay_transport::RetryPolicy;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    /// Connection target of the log service.
    pub transport_url: String,
    /// Retention cap applied on every append.
    pub stream_max_length: usize,
    /// Upper bound of a single blocking read, in milliseconds.
    pub read_block_timeout: u64,
    pub read_batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
    /// Milliseconds.
    pub retry_base_delay: u64,
    /// Seconds.
    pub max_retry_delay: u64,
    pub retry_jitter: bool,
    /// Seconds the circuit stays open after retries are exhausted.
    pub circuit_cooldown: u64,
    /// Seconds a task may wait for its first response before being reported.
    pub acknowledgment_timeout: u64,
    /// Seconds before a non-terminal task counts as timed out.
    pub task_timeout: u64,
    /// Seconds between housekeeping sweeps.
    pub cleanup_interval: u64,
    /// Seconds a terminal task record is retained.
    pub max_task_age: u64,
    /// Deliveries after which a command entry is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Seconds a claimed entry may stay unacknowledged before another
    /// consumer re-claims it.
    pub claim_idle_timeout: u64,
    pub max_concurrent_tasks: usize,
    /// Seconds `stop_*` waits for in-flight work.
    pub shutdown_timeout: u64,
    pub streams: StreamNaming,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            transport_url: "memory://local".to_string(),
            stream_max_length: 10_000,
            read_block_timeout: 1_000,
            read_batch_size: 100,
            max_retries: 3,
            retry_backoff_factor: 2.0,
            retry_base_delay: 500,
            max_retry_delay: 300,
            retry_jitter: true,
            circuit_cooldown: 30,
            acknowledgment_timeout: 30,
            task_timeout: 3_600,
            cleanup_interval: 3_600,
            max_task_age: 86_400,
            max_delivery_attempts: 3,
            claim_idle_timeout: 30,
            max_concurrent_tasks: 4,
            shutdown_timeout: 10,
            streams: StreamNaming::default(),
        }
    }
}

impl CommunicationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.transport_url.trim().is_empty() {
            return invalid("transport_url", "must not be empty");
        }
        for (field, value) in [
            ("stream_max_length", self.stream_max_length as u64),
            ("read_block_timeout", self.read_block_timeout),
            ("read_batch_size", self.read_batch_size as u64),
            ("cleanup_interval", self.cleanup_interval),
            ("max_delivery_attempts", u64::from(self.max_delivery_attempts)),
            ("claim_idle_timeout", self.claim_idle_timeout),
            ("max_concurrent_tasks", self.max_concurrent_tasks as u64),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value == 0 {
                return invalid(field, "must be greater than zero");
            }
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return invalid("retry_backoff_factor", "must be a finite value >= 1.0");
        }
        if self.max_retry_delay.saturating_mul(1_000) < self.retry_base_delay {
            return invalid("max_retry_delay", "must not be shorter than retry_base_delay");
        }
        self.streams.validate()?;
        Ok(())
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay),
            multiplier: self.retry_backoff_factor,
            max_delay: Duration::from_secs(self.max_retry_delay),
            jitter: self.retry_jitter,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_secs(self.claim_idle_timeout)
    }

    pub fn shutdown_window(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn ack_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.acknowledgment_timeout as i64)
    }

    pub fn task_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_timeout as i64)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_task_age as i64)
    }
}
