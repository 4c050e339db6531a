//! Variable scopes and expression evaluation
//!
//! Each head carries its own local bindings. The conversation-wide global
//! scope is an explicit [`ContextStore`] passed into every advance call, with
//! last-writer-wins semantics in processing order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::matcher::Bindings;
use crate::error::CoreError;
use crate::types::{FlowId, InstanceId};

const GLOBAL_PREFIX: &str = "global.";

/// Names that the evaluation context reserves
pub const RESERVED_NAMES: [&str; 3] = ["global", "instance_id", "flow"];

/// Scope of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Bindings of the current head
    Local,
    /// The shared conversation scope
    Global,
}

/// Reference to a variable, written `name.path` or `global.name.path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VarRef {
    /// Scope the variable lives in
    pub scope: Scope,
    /// Dotted path within the scope
    pub name: String,
}

impl VarRef {
    /// Local variable
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Local,
            name: name.into(),
        }
    }

    /// Global variable
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Global,
            name: name.into(),
        }
    }

    /// First path segment
    pub fn root(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    /// Reject empty or reserved names
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() || self.name.split('.').any(str::is_empty) {
            return Err(CoreError::ValidationError(format!(
                "malformed variable reference '{}'",
                self
            )));
        }
        if self.scope == Scope::Local && RESERVED_NAMES.contains(&self.root()) {
            return Err(CoreError::ValidationError(format!(
                "'{}' is reserved and cannot be used as a local variable",
                self.root()
            )));
        }
        Ok(())
    }
}

impl From<String> for VarRef {
    fn from(value: String) -> Self {
        match value.strip_prefix(GLOBAL_PREFIX) {
            Some(name) => VarRef::global(name),
            None => VarRef::local(value),
        }
    }
}

impl From<&str> for VarRef {
    fn from(value: &str) -> Self {
        VarRef::from(value.to_string())
    }
}

impl From<VarRef> for String {
    fn from(value: VarRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Local => f.write_str(&self.name),
            Scope::Global => write!(f, "{}{}", GLOBAL_PREFIX, self.name),
        }
    }
}

/// The global conversation scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextStore {
    values: BTreeMap<String, Value>,
}

impl ContextStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a dotted path
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.values, path)
    }

    /// Write a dotted path, creating intermediate objects; last writer wins
    pub fn set(&mut self, path: &str, value: Value) {
        assign_path(&mut self.values, path, value);
    }

    /// Remove a top-level variable
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Number of top-level variables
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The store as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect::<Map<String, Value>>())
    }
}

/// Read a dotted path from a map of bindings
pub(crate) fn lookup_path<'a>(values: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let (root, rest) = split_root(path);
    descend(values.get(root)?, rest)
}

/// Split a dotted path into its root key and the remaining segments
pub(crate) fn split_root(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    }
}

/// Follow dotted segments below a value; numeric segments index arrays
pub(crate) fn descend<'a>(value: &'a Value, rest: Option<&str>) -> Option<&'a Value> {
    let Some(rest) = rest else {
        return Some(value);
    };
    rest.split('.').try_fold(value, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write a dotted path into a map of bindings
pub(crate) fn assign_path(values: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };
    if segments.is_empty() {
        values.insert(leaf.to_string(), value);
        return;
    }

    let root = values
        .entry(segments[0].to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let mut cursor = root;
    for segment in &segments[1..] {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        cursor = match cursor {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(leaf.to_string(), value);
    }
}

/// A value to be computed when an element fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Template {
    /// Constant value
    Literal(Value),
    /// Value of a variable
    Var(VarRef),
    /// JMESPath expression over the evaluation context
    Expr(String),
}

impl Template {
    /// Constant template
    pub fn literal(value: impl Into<Value>) -> Self {
        Template::Literal(value.into())
    }

    /// Variable template
    pub fn var(var: impl Into<VarRef>) -> Self {
        Template::Var(var.into())
    }

    /// Expression template
    pub fn expr(expression: impl Into<String>) -> Self {
        Template::Expr(expression.into())
    }

    /// Load-time checks
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Template::Literal(_) => Ok(()),
            Template::Var(var) => {
                if var.name.is_empty() {
                    return Err(CoreError::ValidationError("empty variable reference".to_string()));
                }
                Ok(())
            }
            Template::Expr(expression) => compile_expression(expression).map(|_| ()),
        }
    }
}

/// Compile a JMESPath expression
pub fn compile_expression(expression: &str) -> Result<jmespath::Expression<'static>, CoreError> {
    jmespath::compile(expression).map_err(|e| {
        CoreError::ExpressionError(format!(
            "Failed to compile JMESPath expression: {}: {}",
            expression, e
        ))
    })
}

/// Read access to everything a head can see
#[derive(Debug, Clone, Copy)]
pub struct ScopeView<'a> {
    /// Bindings of the head
    pub locals: &'a Bindings,
    /// Global scope
    pub global: &'a ContextStore,
    /// Owning instance
    pub instance_id: &'a InstanceId,
    /// Flow of the owning instance
    pub flow: &'a FlowId,
}

impl<'a> ScopeView<'a> {
    /// Look up a variable
    pub fn lookup(&self, var: &VarRef) -> Option<Value> {
        match var.scope {
            Scope::Local => lookup_path(self.locals, &var.name).cloned(),
            Scope::Global => self.global.get(&var.name).cloned(),
        }
    }

    /// Build the JSON context expressions are evaluated against
    pub fn to_value(&self) -> Value {
        let mut context: Map<String, Value> = self
            .locals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        context.insert("global".to_string(), self.global.to_value());
        context.insert(
            "instance_id".to_string(),
            Value::String(self.instance_id.to_string()),
        );
        context.insert("flow".to_string(), Value::String(self.flow.to_string()));
        Value::Object(context)
    }

    /// Evaluate a JMESPath expression
    pub fn evaluate(&self, expression: &str) -> Result<Value, CoreError> {
        let compiled = compile_expression(expression)?;
        let context = self.to_value();
        let result = compiled.search(&context).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                expression, e
            ))
        })?;
        Ok(serde_json::to_value(&*result)?)
    }

    /// Evaluate a condition with JMESPath truthiness
    pub fn evaluate_condition(&self, expression: &str) -> Result<bool, CoreError> {
        let compiled = compile_expression(expression)?;
        let context = self.to_value();
        let result = compiled.search(&context).map_err(|e| {
            CoreError::ConditionEvaluationError(format!("{}: {}", expression, e))
        })?;
        Ok(result.is_truthy())
    }

    /// Compute a template
    pub fn resolve(&self, template: &Template) -> Result<Value, CoreError> {
        match template {
            Template::Literal(value) => Ok(value.clone()),
            Template::Var(var) => self
                .lookup(var)
                .ok_or_else(|| CoreError::ReferenceError(format!("Variable not bound: {}", var))),
            Template::Expr(expression) => self.evaluate(expression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (Bindings, ContextStore, InstanceId, FlowId) {
        let mut locals = Bindings::new();
        locals.insert("result".to_string(), json!({"status": "failed", "reason": "transient"}));
        locals.insert("n".to_string(), json!(3));
        let mut global = ContextStore::new();
        global.set("user.name", json!("Ada"));
        (locals, global, InstanceId::from("i1"), FlowId::from("f"))
    }

    #[test]
    fn test_var_ref_parsing() {
        assert_eq!(VarRef::from("global.user"), VarRef::global("user"));
        assert_eq!(VarRef::from("result.value"), VarRef::local("result.value"));
        assert_eq!(VarRef::global("x").to_string(), "global.x");

        let json = serde_json::to_value(VarRef::global("x")).unwrap();
        assert_eq!(json, json!("global.x"));
    }

    #[test]
    fn test_reserved_local_names_rejected() {
        assert!(VarRef::local("flow").validate().is_err());
        assert!(VarRef::global("flow").validate().is_ok());
        assert!(VarRef::local("a..b").validate().is_err());
    }

    #[test]
    fn test_context_store_paths() {
        let mut store = ContextStore::new();
        store.set("a.b.c", json!(1));
        store.set("a.b.d", json!(2));
        store.set("a.b.c", json!(5));

        assert_eq!(store.get("a.b.c"), Some(&json!(5)));
        assert_eq!(store.get("a.b.d"), Some(&json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lookup_and_resolve() {
        let (locals, global, id, flow) = fixture();
        let view = ScopeView {
            locals: &locals,
            global: &global,
            instance_id: &id,
            flow: &flow,
        };

        assert_eq!(view.lookup(&VarRef::from("result.reason")), Some(json!("transient")));
        assert_eq!(view.lookup(&VarRef::from("global.user.name")), Some(json!("Ada")));
        assert_eq!(view.resolve(&Template::expr("n")).unwrap(), json!(3));

        let err = view.resolve(&Template::var("missing")).unwrap_err();
        assert!(matches!(err, CoreError::ReferenceError(_)));
    }

    #[test]
    fn test_conditions() {
        let (locals, global, id, flow) = fixture();
        let view = ScopeView {
            locals: &locals,
            global: &global,
            instance_id: &id,
            flow: &flow,
        };

        assert!(view.evaluate_condition("result.status == 'failed'").unwrap());
        assert!(!view.evaluate_condition("result.status == 'completed'").unwrap());
        assert!(view.evaluate_condition("global.user.name").unwrap());
        assert!(!view.evaluate_condition("missing").unwrap());
        assert!(view.evaluate_condition("flow == 'f'").unwrap());
    }

    #[test]
    fn test_bad_expression_is_rejected() {
        assert!(Template::expr("a ==").validate().is_err());
        assert!(Template::expr("a == `1`").validate().is_ok());
    }
}
