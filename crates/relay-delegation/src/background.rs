use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use relay_transport::TransportError;

use crate::CommunicationConfig;

/// Extra time `stop` grants a loop beyond the configured window, so the
/// loop's own drain can finish first.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// A spawned loop together with its shutdown signal.
pub(crate) struct Background {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Background {
    pub(crate) fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(rx));
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait up to `window` for it to return; a loop
    /// still running after that is aborted.
    pub(crate) async fn stop(mut self, window: Duration) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(window + STOP_GRACE, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = self.name, error = %e, "Background loop failed"),
            Err(_) => {
                tracing::warn!(
                    task = self.name,
                    window_secs = window.as_secs(),
                    "Background loop did not stop in time, abandoning in-flight work"
                );
                self.handle.abort();
            }
        }
    }
}

/// Floor for loop pauses, so a zero cooldown cannot spin.
const MIN_PAUSE: Duration = Duration::from_millis(10);

/// How long a read loop waits after its `failures`-th consecutive failed
/// read. While the circuit is open the loop waits until it half-opens, but
/// never longer than one read window; otherwise it backs off, but never
/// longer than the circuit cooldown.
pub(crate) fn read_retry_delay(
    config: &CommunicationConfig,
    failures: u32,
    error: &TransportError,
) -> Duration {
    let delay = match error {
        TransportError::CircuitOpen { retry_in } => (*retry_in).min(config.read_block()),
        _ => config.retry_policy().delay_for(failures).min(config.cooldown()),
    };
    delay.max(MIN_PAUSE)
}

/// Sleep for `delay` unless shutdown is requested first. Returns `true`
/// when the caller should stop.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

/// True once shutdown has been requested or the controlling handle dropped.
pub(crate) fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_backoff() -> CommunicationConfig {
        CommunicationConfig {
            retry_base_delay: 60_000,
            max_retry_delay: 300,
            retry_jitter: false,
            circuit_cooldown: 2,
            read_block_timeout: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_is_capped_by_cooldown() {
        let config = slow_backoff();
        let e = TransportError::Connection("down".into());
        assert_eq!(read_retry_delay(&config, 0, &e), Duration::from_secs(2));
        assert_eq!(read_retry_delay(&config, 7, &e), Duration::from_secs(2));
    }

    #[test]
    fn test_open_circuit_waits_at_most_one_read_window() {
        let config = slow_backoff();
        let open = TransportError::CircuitOpen {
            retry_in: Duration::from_secs(25),
        };
        assert_eq!(read_retry_delay(&config, 3, &open), Duration::from_millis(500));

        let trial_running = TransportError::CircuitOpen {
            retry_in: Duration::ZERO,
        };
        assert_eq!(read_retry_delay(&config, 3, &trial_running), MIN_PAUSE);
    }
}
