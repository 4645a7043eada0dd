//! Relay Protocol - task envelopes and status responses
//!
//! Defines the validated message vocabulary exchanged between a delegator
//! and a delegate over append-only streams: task envelopes, lifecycle
//! responses, structured errors and progress reports, plus the flat
//! key-value wire codec and the configurable stream naming scheme.

pub mod codec;
pub mod constants;
pub mod error;
pub mod messages;
pub mod naming;
pub mod types;

pub use codec::Fields;
pub use constants::*;
pub use error::*;
pub use messages::*;
pub use naming::StreamNaming;
pub use types::*;
