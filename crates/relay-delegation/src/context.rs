use std::sync::Arc;

use relay_protocol::StreamNaming;
use relay_transport::{ResilientTransport, StreamTransport, TransportError};

use crate::{CommunicationConfig, DelegationError};

/// Process-wide handle shared by every delegator and delegate.
///
/// Owns the validated configuration and the transport connection. The raw
/// transport is wrapped in a `ResilientTransport` built from the retry
/// settings, so every component sees the same retry budget and circuit.
#[derive(Clone)]
pub struct AgentContext {
    config: Arc<CommunicationConfig>,
    transport: Arc<dyn StreamTransport>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    /// Connect to the log service named by `config.transport_url`, retrying
    /// the initial connection on the configured backoff schedule.
    pub async fn connect(config: CommunicationConfig) -> Result<Self, DelegationError> {
        config.validate()?;
        let policy = config.retry_policy();
        let mut attempt = 0;
        let transport = loop {
            match relay_transport::connect(&config.transport_url).await {
                Ok(transport) => break transport,
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Log service connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(TransportError::RetriesExhausted {
                        op: "connect",
                        attempts: attempt + 1,
                        source: Box::new(e),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        };
        Self::open(config, transport).await
    }

    /// Validate `config`, wrap `transport` and check that it answers.
    pub async fn open(
        config: CommunicationConfig,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, DelegationError> {
        config.validate()?;
        let transport: Arc<dyn StreamTransport> = Arc::new(ResilientTransport::new(
            transport,
            config.retry_policy(),
            config.cooldown(),
        ));
        transport.ping().await?;
        tracing::info!(
            transport = %relay_transport::redact_url(&config.transport_url),
            "Opened agent context"
        );
        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    /// Close the transport connection. Background loops still using it
    /// halt on their next call.
    pub async fn close(&self) -> Result<(), DelegationError> {
        self.transport.close().await?;
        tracing::info!(
            transport = %relay_transport::redact_url(&self.config.transport_url),
            "Closed agent context"
        );
        Ok(())
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.config
    }

    pub fn naming(&self) -> &StreamNaming {
        &self.config.streams
    }

    pub fn transport(&self) -> &Arc<dyn StreamTransport> {
        &self.transport
    }
}
