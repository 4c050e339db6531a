//! Pure event matching

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::event::Event;
use crate::domain::pattern::{EventPattern, FieldConstraint};

/// Variable bindings of a head
pub type Bindings = BTreeMap<String, Value>;

/// Match an event against a pattern.
///
/// Returns the extended bindings on success. A variable that is already
/// bound must equal the event's field; an unbound one captures it. A variable
/// used twice in one pattern must see equal values at both fields.
pub fn match_event(pattern: &EventPattern, event: &Event, bindings: &Bindings) -> Option<Bindings> {
    if pattern.name != event.name {
        return None;
    }

    let mut extended = bindings.clone();
    for (path, constraint) in &pattern.fields {
        let actual = event.field(path)?;
        match constraint {
            FieldConstraint::Any => {}
            FieldConstraint::Literal(expected) => {
                if expected != actual {
                    return None;
                }
            }
            FieldConstraint::Var(var) => match extended.get(var) {
                Some(bound) if bound != actual => return None,
                Some(_) => {}
                None => {
                    extended.insert(var.clone(), actual.clone());
                }
            },
        }
    }
    Some(extended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventSource;
    use crate::types::EventId;
    use serde_json::json;

    fn event(name: &str, payload: Value) -> Event {
        Event::new(
            EventId::from("e"),
            name,
            payload.as_object().cloned().unwrap_or_default(),
            EventSource::External,
        )
    }

    #[test]
    fn test_name_mismatch() {
        let pattern = EventPattern::new("greeting");
        assert!(match_event(&pattern, &event("farewell", json!({})), &Bindings::new()).is_none());
    }

    #[test]
    fn test_literal_and_wildcard() {
        let pattern = EventPattern::new("user-said")
            .with_literal("text", "hi")
            .with_any("lang");

        let hit = event("user-said", json!({"text": "hi", "lang": "en", "extra": 1}));
        let wrong_text = event("user-said", json!({"text": "bye", "lang": "en"}));
        let no_lang = event("user-said", json!({"text": "hi"}));

        assert!(match_event(&pattern, &hit, &Bindings::new()).is_some());
        assert!(match_event(&pattern, &wrong_text, &Bindings::new()).is_none());
        assert!(match_event(&pattern, &no_lang, &Bindings::new()).is_none());
    }

    #[test]
    fn test_unbound_variable_captures() {
        let pattern = EventPattern::new("user-said").with_var("text", "utterance");
        let bindings = match_event(&pattern, &event("user-said", json!({"text": "hi"})), &Bindings::new())
            .unwrap();
        assert_eq!(bindings.get("utterance"), Some(&json!("hi")));
    }

    #[test]
    fn test_bound_variable_correlates() {
        let pattern = EventPattern::new("action-result").with_var("invocation_id", "inv");
        let mut bindings = Bindings::new();
        bindings.insert("inv".to_string(), json!("X"));

        let other = event("action-result", json!({"invocation_id": "Y"}));
        let mine = event("action-result", json!({"invocation_id": "X"}));

        assert!(match_event(&pattern, &other, &bindings).is_none());
        assert_eq!(match_event(&pattern, &mine, &bindings), Some(bindings.clone()));
    }

    #[test]
    fn test_repeated_variable_requires_equal_fields() {
        let pattern = EventPattern::new("pair").with_var("a", "x").with_var("b", "x");
        assert!(match_event(&pattern, &event("pair", json!({"a": 1, "b": 1})), &Bindings::new()).is_some());
        assert!(match_event(&pattern, &event("pair", json!({"a": 1, "b": 2})), &Bindings::new()).is_none());
    }
}
