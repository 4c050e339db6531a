use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core error type for the Railflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(String),

    /// A flow with the same name is already registered
    #[error("Duplicate flow definition: {0}")]
    DuplicateDefinition(String),

    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    FlowInstanceNotFound(String),

    /// Malformed pattern, definition or event
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Variable reference that cannot be resolved
    #[error("Reference error: {0}")]
    ReferenceError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Condition evaluation error
    #[error("Condition evaluation error: {0}")]
    ConditionEvaluationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The completion channel was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

/// Classification of a failed action invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionErrorKind {
    /// The call may succeed if retried
    Transient,
    /// The arguments were rejected by the action
    InvalidArguments,
    /// The action does not exist or cannot be reached
    Unavailable,
    /// The call lost conflict resolution and was never dispatched
    Overridden,
}

impl ActionErrorKind {
    /// Wire name of the classification
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionErrorKind::Transient => "transient",
            ActionErrorKind::InvalidArguments => "invalid-arguments",
            ActionErrorKind::Unavailable => "unavailable",
            ActionErrorKind::Overridden => "overridden",
        }
    }
}

impl fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an action invocation.
///
/// Never returned from the engine loop; it only travels inside an
/// `action-result` event.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActionError {
    /// Failure classification
    pub kind: ActionErrorKind,
    /// Human readable detail
    pub message: String,
}

impl ActionError {
    /// Create an action error
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Transient, message)
    }

    /// Rejected arguments
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::InvalidArguments, message)
    }

    /// Unknown or unreachable action
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Unavailable, message)
    }

    /// Call suppressed by a competing instance
    pub fn overridden(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Overridden, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::DefinitionNotFound("flow1".to_string()), "Flow definition not found: flow1"),
            (CoreError::DuplicateDefinition("flow1".to_string()), "Duplicate flow definition: flow1"),
            (CoreError::FlowInstanceNotFound("i1".to_string()), "Flow instance not found: i1"),
            (CoreError::ValidationError("bad".to_string()), "Validation error: bad"),
            (CoreError::ReferenceError("x".to_string()), "Reference error: x"),
            (CoreError::ExpressionError("e".to_string()), "Expression evaluation error: e"),
            (CoreError::ConditionEvaluationError("c".to_string()), "Condition evaluation error: c"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::SerializationError("ser".to_string()), "Serialization error: ser"),
            (CoreError::ChannelClosed("rx".to_string()), "Channel closed: rx"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => assert!(msg.contains("expected value")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_serde_yaml_error() {
        let yaml_error = serde_yaml::from_str::<u32>("[not, a, number]").unwrap_err();
        let error: CoreError = yaml_error.into();
        assert!(matches!(error, CoreError::ConfigurationError(_)));
    }

    #[test]
    fn test_action_error_kind_wire_names() {
        let json = serde_json::to_value(ActionErrorKind::InvalidArguments).unwrap();
        assert_eq!(json, serde_json::json!("invalid-arguments"));

        let err = ActionError::transient("timeout");
        assert_eq!(err.to_string(), "transient: timeout");

        let json = serde_json::to_value(ActionErrorKind::Overridden).unwrap();
        assert_eq!(json, serde_json::json!("overridden"));
    }
}
