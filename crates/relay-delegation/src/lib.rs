//! Relay Delegation - reliable task hand-off between intermittently
//! running agents
//!
//! A `Delegator` validates task envelopes, appends them to the target's
//! command stream and tracks each task through
//! `created -> acknowledged -> in_progress* -> {completed | failed}` by
//! consuming its own response stream. A `Delegate` consumes its command
//! stream through a consumer group, dispatches each envelope to the handler
//! registered for its `task_type` and appends the lifecycle responses.
//!
//! Both sides persist their offsets and tables through a `StateStore`, so a
//! restart resumes where the previous run stopped. Delivery is
//! at-least-once; responses are merged idempotently.

mod background;
pub mod config;
pub mod context;
pub mod delegate;
pub mod delegator;
pub mod error;
pub mod handler;
pub mod responder;

pub use config::CommunicationConfig;
pub use context::AgentContext;
pub use delegate::Delegate;
pub use delegator::{response_callback, Delegator, ResponseCallback};
pub use error::{ConfigError, DelegationError};
pub use handler::{handler_fn, FnHandler, HandlerOutcome, HandlerRegistry, TaskHandler};
pub use responder::{ProgressReporter, Responder};
