//! Events flowing through the engine

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::context::{descend, split_root};
use crate::error::{ActionError, CoreError};
use crate::types::{EventId, InvocationId, Payload, TimerId};

/// Completion of an action invocation
pub const ACTION_RESULT: &str = "action-result";
/// Notification that a competing emission won over this instance's
pub const EMISSION_OVERRIDDEN: &str = "emission-overridden";
/// Delivery of an engine-owned timer
pub const TIMER_FIRED: &str = "timer-fired";
/// A flow instance finished normally
pub const FLOW_FINISHED: &str = "flow-finished";
/// A flow instance aborted
pub const FLOW_ABORTED: &str = "flow-aborted";

/// Status value of a successful action result
pub const STATUS_COMPLETED: &str = "completed";
/// Status value of a failed action result
pub const STATUS_FAILED: &str = "failed";

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    /// Supplied by the caller of the engine
    External,
    /// Emitted by a flow or synthesized by the engine
    Internal,
    /// Produced by the action dispatcher
    ActionResult,
}

/// A named payload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identity
    pub id: EventId,
    /// Event type
    pub name: String,
    /// Event data
    #[serde(default)]
    pub payload: Payload,
    /// Origin of the event
    pub source: EventSource,
}

/// Outcome of one action invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The action returned a value
    Completed {
        /// Returned value
        value: Value,
    },
    /// The action failed
    Failed {
        /// Classified failure
        error: ActionError,
    },
}

impl ActionOutcome {
    /// Whether the invocation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Completed { .. })
    }
}

impl From<Result<Value, ActionError>> for ActionOutcome {
    fn from(result: Result<Value, ActionError>) -> Self {
        match result {
            Ok(value) => ActionOutcome::Completed { value },
            Err(error) => ActionOutcome::Failed { error },
        }
    }
}

impl Event {
    /// Create an event
    pub fn new(id: EventId, name: impl Into<String>, payload: Payload, source: EventSource) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            source,
        }
    }

    /// Result event for an invocation.
    ///
    /// The id is derived from the invocation id, so the same completion
    /// always produces the same event and redelivery is deduplicated.
    pub fn action_result(invocation_id: &InvocationId, action: &str, outcome: &ActionOutcome) -> Self {
        let mut payload = Payload::new();
        payload.insert("invocation_id".to_string(), json!(invocation_id.as_str()));
        payload.insert("action".to_string(), json!(action));
        match outcome {
            ActionOutcome::Completed { value } => {
                payload.insert("status".to_string(), json!(STATUS_COMPLETED));
                payload.insert("value".to_string(), value.clone());
            }
            ActionOutcome::Failed { error } => {
                payload.insert("status".to_string(), json!(STATUS_FAILED));
                payload.insert("reason".to_string(), json!(error.kind.as_str()));
                payload.insert(
                    "error".to_string(),
                    json!({ "kind": error.kind.as_str(), "message": error.message }),
                );
            }
        }
        Self::new(
            EventId(format!("{}:result", invocation_id)),
            ACTION_RESULT,
            payload,
            EventSource::ActionResult,
        )
    }

    /// Delivery event for a timer
    pub fn timer_fired(timer_id: &TimerId) -> Self {
        let mut payload = Payload::new();
        payload.insert("timer_id".to_string(), json!(timer_id.as_str()));
        Self::new(
            EventId(format!("{}:fired", timer_id)),
            TIMER_FIRED,
            payload,
            EventSource::Internal,
        )
    }

    /// Look up a payload field by dotted path
    pub fn field(&self, path: &str) -> Option<&Value> {
        let (root, rest) = split_root(path);
        descend(self.payload.get(root)?, rest)
    }

    /// Invocation this result event belongs to
    pub fn invocation_id(&self) -> Option<InvocationId> {
        if self.name != ACTION_RESULT {
            return None;
        }
        self.field("invocation_id")
            .and_then(Value::as_str)
            .map(InvocationId::from)
    }

    /// Timer this event was fired by
    pub fn timer_id(&self) -> Option<TimerId> {
        if self.name != TIMER_FIRED {
            return None;
        }
        self.field("timer_id").and_then(Value::as_str).map(TimerId::from)
    }

    /// Structural validation of reserved events
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError("event name must not be empty".to_string()));
        }
        if self.id.as_str().is_empty() {
            return Err(CoreError::ValidationError(format!(
                "event '{}' has an empty id",
                self.name
            )));
        }

        match self.name.as_str() {
            ACTION_RESULT => {
                if self.field("invocation_id").and_then(Value::as_str).is_none() {
                    return Err(CoreError::ValidationError(
                        "action-result requires a string invocation_id".to_string(),
                    ));
                }
                match self.field("status").and_then(Value::as_str) {
                    Some(STATUS_COMPLETED) => {}
                    Some(STATUS_FAILED) => {
                        if self.field("reason").is_none() {
                            return Err(CoreError::ValidationError(
                                "failed action-result requires a reason".to_string(),
                            ));
                        }
                    }
                    other => {
                        return Err(CoreError::ValidationError(format!(
                            "action-result has invalid status: {:?}",
                            other
                        )))
                    }
                }
            }
            TIMER_FIRED => {
                if self.field("timer_id").and_then(Value::as_str).is_none() {
                    return Err(CoreError::ValidationError(
                        "timer-fired requires a string timer_id".to_string(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_field_walks_dotted_paths() {
        let event = Event::new(
            EventId::from("e1"),
            "bot-said",
            payload(json!({"message": {"text": "hi", "tags": ["a", "b"]}})),
            EventSource::Internal,
        );

        assert_eq!(event.field("message.text"), Some(&json!("hi")));
        assert_eq!(event.field("message.tags.1"), Some(&json!("b")));
        assert_eq!(event.field("message.missing"), None);
    }

    #[test]
    fn test_failed_action_result_carries_reason() {
        let inv = InvocationId::from("inv-1");
        let outcome = ActionOutcome::Failed {
            error: ActionError::transient("timed out"),
        };
        let event = Event::action_result(&inv, "check_facts", &outcome);

        assert_eq!(event.id.as_str(), "inv-1:result");
        assert_eq!(event.source, EventSource::ActionResult);
        assert_eq!(event.field("status"), Some(&json!("failed")));
        assert_eq!(event.field("reason"), Some(&json!("transient")));
        assert_eq!(event.field("error.message"), Some(&json!("timed out")));
        assert_eq!(event.invocation_id(), Some(inv));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_results() {
        let missing_reason = Event::new(
            EventId::from("e1"),
            ACTION_RESULT,
            payload(json!({"invocation_id": "x", "status": "failed"})),
            EventSource::ActionResult,
        );
        assert!(missing_reason.validate().is_err());

        let bad_status = Event::new(
            EventId::from("e2"),
            ACTION_RESULT,
            payload(json!({"invocation_id": "x", "status": "maybe"})),
            EventSource::ActionResult,
        );
        assert!(bad_status.validate().is_err());

        let unnamed = Event::new(EventId::from("e3"), " ", Payload::new(), EventSource::External);
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_timer_fired_event() {
        let event = Event::timer_fired(&TimerId::from("t1"));
        assert_eq!(event.timer_id(), Some(TimerId::from("t1")));
        assert!(event.validate().is_ok());
    }
}
