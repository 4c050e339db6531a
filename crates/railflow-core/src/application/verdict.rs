//! Built-in `evaluate_verdicts` action
//!
//! Aggregates the per-evaluator results of a guardrail evaluation response
//! into a single pass/fail verdict.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::dispatcher::Action;
use crate::error::ActionError;
use crate::types::Payload;

/// Registered name of the action
pub const EVALUATE_VERDICTS: &str = "evaluate_verdicts";

/// How evaluator results combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessStrategy {
    /// Every evaluator must pass
    #[default]
    AllPass,
    /// One passing evaluator is enough
    AnyPass,
}

impl SuccessStrategy {
    fn parse(value: Option<&Value>) -> Result<Self, ActionError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                ActionError::invalid_arguments(format!(
                    "success_strategy must be 'all_pass' or 'any_pass', got {}",
                    value
                ))
            }),
        }
    }
}

/// Decide whether an evaluation response passes.
///
/// A missing response or one without a `results` list fails. An empty list
/// passes under `all_pass` and fails under `any_pass`.
pub fn check_verdicts(response: &Value, strategy: SuccessStrategy) -> bool {
    let Some(results) = response.get("results").and_then(Value::as_array) else {
        return false;
    };
    let passed = |result: &Value| {
        result
            .get("evaluation_result")
            .and_then(Value::as_object)
            .and_then(|verdict| verdict.get("pass"))
            .map(truthy)
            .unwrap_or(false)
    };
    match strategy {
        SuccessStrategy::AllPass => results.iter().all(passed),
        SuccessStrategy::AnyPass => results.iter().any(passed),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Action form of [`check_verdicts`].
///
/// Arguments: `response` (required) and `success_strategy` (optional).
/// Returns `{ "pass": bool }`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvaluateVerdicts;

#[async_trait]
impl Action for EvaluateVerdicts {
    fn name(&self) -> &str {
        EVALUATE_VERDICTS
    }

    fn required_arguments(&self) -> Vec<String> {
        vec!["response".to_string()]
    }

    async fn invoke(&self, arguments: Payload) -> Result<Value, ActionError> {
        let strategy = SuccessStrategy::parse(arguments.get("success_strategy"))?;
        let response = arguments.get("response").unwrap_or(&Value::Null);
        Ok(json!({ "pass": check_verdicts(response, strategy) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(passes: &[bool]) -> Value {
        json!({
            "results": passes
                .iter()
                .map(|p| json!({ "evaluator": "judge", "evaluation_result": { "pass": p } }))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn test_all_pass_and_any_pass() {
        let mixed = response(&[true, false]);
        assert!(!check_verdicts(&mixed, SuccessStrategy::AllPass));
        assert!(check_verdicts(&mixed, SuccessStrategy::AnyPass));

        let clean = response(&[true, true]);
        assert!(check_verdicts(&clean, SuccessStrategy::AllPass));
    }

    #[test]
    fn test_missing_or_malformed_results_fail() {
        assert!(!check_verdicts(&Value::Null, SuccessStrategy::AnyPass));
        assert!(!check_verdicts(&json!({}), SuccessStrategy::AllPass));
        assert!(!check_verdicts(
            &json!({ "results": [ { "evaluation_result": "pass" } ] }),
            SuccessStrategy::AnyPass
        ));
        assert!(!check_verdicts(
            &json!({ "results": [ { "evaluation_result": {} } ] }),
            SuccessStrategy::AllPass
        ));
    }

    #[test]
    fn test_empty_results_follow_strategy() {
        let empty = json!({ "results": [] });
        assert!(check_verdicts(&empty, SuccessStrategy::AllPass));
        assert!(!check_verdicts(&empty, SuccessStrategy::AnyPass));
    }

    #[tokio::test]
    async fn test_invoke() {
        let mut args = Payload::new();
        args.insert("response".to_string(), response(&[false, true]));
        args.insert("success_strategy".to_string(), json!("any_pass"));
        let result = EvaluateVerdicts.invoke(args.clone()).await.unwrap();
        assert_eq!(result, json!({ "pass": true }));

        args.insert("success_strategy".to_string(), json!("majority"));
        let err = EvaluateVerdicts.invoke(args).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ActionErrorKind::InvalidArguments);
    }
}
