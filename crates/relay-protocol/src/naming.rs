//! Stream naming.
//!
//! Every stream and consumer group name is derived from a template holding
//! an `{agent}` placeholder, so deployments can pick `{agent}:responses`,
//! `responses:{agent}` or any other convention without code changes.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamNaming {
    /// Per-target stream carrying task envelopes.
    pub command_stream: String,
    /// Per-delegator stream carrying lifecycle responses.
    pub response_stream: String,
    /// Per-target side stream holding poison messages.
    pub dead_letter_stream: String,
    /// Consumer group a delegate uses on its command stream.
    pub consumer_group: String,
}

impl Default for StreamNaming {
    fn default() -> Self {
        Self {
            command_stream: DEFAULT_COMMAND_STREAM_TEMPLATE.to_string(),
            response_stream: DEFAULT_RESPONSE_STREAM_TEMPLATE.to_string(),
            dead_letter_stream: DEFAULT_DEAD_LETTER_STREAM_TEMPLATE.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP_TEMPLATE.to_string(),
        }
    }
}

impl StreamNaming {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, template) in [
            ("streams.command_stream", &self.command_stream),
            ("streams.response_stream", &self.response_stream),
            ("streams.dead_letter_stream", &self.dead_letter_stream),
            ("streams.consumer_group", &self.consumer_group),
        ] {
            if !template.contains(AGENT_PLACEHOLDER) {
                return Err(ValidationError::invalid(
                    field,
                    format!("template '{template}' lacks the {AGENT_PLACEHOLDER} placeholder"),
                ));
            }
        }
        if self.command_stream == self.response_stream {
            return Err(ValidationError::invalid(
                "streams.response_stream",
                "command and response streams must differ",
            ));
        }
        Ok(())
    }

    pub fn command_stream(&self, agent: &str) -> String {
        render(&self.command_stream, agent)
    }

    pub fn response_stream(&self, agent: &str) -> String {
        render(&self.response_stream, agent)
    }

    pub fn dead_letter_stream(&self, agent: &str) -> String {
        render(&self.dead_letter_stream, agent)
    }

    pub fn consumer_group(&self, agent: &str) -> String {
        render(&self.consumer_group, agent)
    }
}

fn render(template: &str, agent: &str) -> String {
    template.replace(AGENT_PLACEHOLDER, agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let naming = StreamNaming::default();
        assert_eq!(naming.command_stream("bear"), "bear:commands");
        assert_eq!(naming.response_stream("colonel"), "colonel:responses");
        assert_eq!(naming.dead_letter_stream("bear"), "bear:dead_letter");
        assert_eq!(naming.consumer_group("bear"), "bear-workers");
        assert!(naming.validate().is_ok());
    }

    #[test]
    fn test_prefix_convention() {
        let naming = StreamNaming {
            response_stream: "responses:{agent}".into(),
            ..Default::default()
        };
        assert!(naming.validate().is_ok());
        assert_eq!(naming.response_stream("colonel"), "responses:colonel");
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let naming = StreamNaming {
            command_stream: "agent:tasks".into(),
            ..Default::default()
        };
        assert!(naming.validate().is_err());
    }

    #[test]
    fn test_identical_command_and_response_rejected() {
        let naming = StreamNaming {
            response_stream: DEFAULT_COMMAND_STREAM_TEMPLATE.into(),
            ..Default::default()
        };
        assert!(naming.validate().is_err());
    }
}
