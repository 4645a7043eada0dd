/// Version tag stamped into agent metadata.
pub const PROTOCOL_VERSION: &str = "1.0";

pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;

/// Neutral impact/effort estimate used when a request omits one.
pub const DEFAULT_ESTIMATE: f64 = 0.5;

/// Dispatch key used when a request names no task type.
pub const DEFAULT_TASK_TYPE: &str = "default";

/// Task type of the cancellation request sent by `Delegator::cancel_task`.
pub const CANCEL_TASK_TYPE: &str = "cancel";

/// Placeholder substituted with an agent name in stream templates.
pub const AGENT_PLACEHOLDER: &str = "{agent}";

pub const DEFAULT_COMMAND_STREAM_TEMPLATE: &str = "{agent}:commands";
pub const DEFAULT_RESPONSE_STREAM_TEMPLATE: &str = "{agent}:responses";
pub const DEFAULT_DEAD_LETTER_STREAM_TEMPLATE: &str = "{agent}:dead_letter";
pub const DEFAULT_CONSUMER_GROUP_TEMPLATE: &str = "{agent}-workers";

// Machine-readable error codes carried in `TaskError::error_code`.
pub const ERROR_UNKNOWN_TASK_TYPE: &str = "UNKNOWN_TASK_TYPE";
pub const ERROR_HANDLER_PANICKED: &str = "HANDLER_PANICKED";
pub const ERROR_MAX_DELIVERIES_EXCEEDED: &str = "MAX_DELIVERIES_EXCEEDED";
pub const ERROR_CANCELLED: &str = "CANCELLED";
