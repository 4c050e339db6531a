//! Event patterns

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CoreError;

/// Constraint on one payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldConstraint {
    /// The field must be present, any value
    Any,
    /// The field must equal this value
    Literal(Value),
    /// The field must equal the bound variable, or binds it when unbound
    Var(String),
}

impl FieldConstraint {
    fn is_bound_constraint(&self) -> bool {
        !matches!(self, FieldConstraint::Any)
    }
}

impl fmt::Display for FieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldConstraint::Any => f.write_str("*"),
            FieldConstraint::Literal(value) => write!(f, "={}", value),
            FieldConstraint::Var(name) => write!(f, "=${}", name),
        }
    }
}

/// An event name plus constraints on payload fields.
///
/// Field paths are dotted (`value.pass`). Variable names are local to the
/// head that owns the pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    /// Event name to match
    pub name: String,
    /// Field path to constraint
    #[serde(default)]
    pub fields: BTreeMap<String, FieldConstraint>,
}

impl EventPattern {
    /// Pattern matching any event with this name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Require a field to equal a literal
    pub fn with_literal(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(path.into(), FieldConstraint::Literal(value.into()));
        self
    }

    /// Correlate a field with a variable
    pub fn with_var(mut self, path: impl Into<String>, var: impl Into<String>) -> Self {
        self.fields.insert(path.into(), FieldConstraint::Var(var.into()));
        self
    }

    /// Require a field to be present
    pub fn with_any(mut self, path: impl Into<String>) -> Self {
        self.fields.insert(path.into(), FieldConstraint::Any);
        self
    }

    /// Number of constraints that restrict a value
    pub fn specificity(&self) -> u32 {
        self.fields
            .values()
            .filter(|c| c.is_bound_constraint())
            .count() as u32
    }

    /// Canonical text form, stable across runs
    pub fn key(&self) -> String {
        let mut key = self.name.clone();
        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|(path, constraint)| format!("{}{}", path, constraint))
                .collect();
            key.push('{');
            key.push_str(&fields.join(","));
            key.push('}');
        }
        key
    }

    /// Reject malformed patterns before they reach the engine
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "pattern event name must not be empty".to_string(),
            ));
        }
        for (path, constraint) in &self.fields {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(CoreError::ValidationError(format!(
                    "pattern '{}' has malformed field path '{}'",
                    self.name, path
                )));
            }
            if let FieldConstraint::Var(var) = constraint {
                if var.is_empty() || var.contains('.') {
                    return Err(CoreError::ValidationError(format!(
                        "pattern '{}' binds invalid variable name '{}'",
                        self.name, var
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
