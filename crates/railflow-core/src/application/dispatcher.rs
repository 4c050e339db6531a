//! Action dispatch
//!
//! Flows never call actions directly. A head's action request becomes a
//! [`PendingAction`] and an [`ActionInvocation`] handed to an
//! [`ActionBackend`]. The backend runs the call wherever it likes and reports
//! completion only as an `action-result` event on the completion channel.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::domain::event::{ActionOutcome, Event};
use crate::domain::flow_instance::ActionRequest;
use crate::error::ActionError;
use crate::types::{HeadId, InstanceId, InvocationId, Payload};

/// An external capability flows can invoke
#[async_trait]
pub trait Action: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Arguments that must be present
    fn required_arguments(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the action
    async fn invoke(&self, arguments: Payload) -> Result<Value, ActionError>;
}

/// Action backed by an async closure
pub struct FnAction<F> {
    name: String,
    required: Vec<String>,
    handler: F,
}

impl<F> FnAction<F> {
    /// Wrap a closure
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            handler,
        }
    }

    /// Declare required arguments
    pub fn requires<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = arguments.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn required_arguments(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn invoke(&self, arguments: Payload) -> Result<Value, ActionError> {
        (self.handler)(arguments).await
    }
}

/// Name to capability mapping
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in actions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::verdict::EvaluateVerdicts);
        registry
    }

    /// Add an action, replacing one with the same name
    pub fn register(&mut self, action: impl Action + 'static) -> &mut Self {
        self.actions.insert(action.name().to_string(), Arc::new(action));
        self
    }

    /// Action by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Whether an action is registered
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Resolve an action and check its declared arguments
    pub fn prepare(&self, name: &str, arguments: &Payload) -> Result<Arc<dyn Action>, ActionError> {
        let action = self
            .get(name)
            .ok_or_else(|| ActionError::unavailable(format!("no action registered as '{}'", name)))?;
        let missing: Vec<String> = action
            .required_arguments()
            .into_iter()
            .filter(|arg| !arguments.contains_key(arg))
            .collect();
        if !missing.is_empty() {
            return Err(ActionError::invalid_arguments(format!(
                "'{}' is missing arguments: {}",
                name,
                missing.join(", ")
            )));
        }
        Ok(action)
    }
}

/// Lifecycle of a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PendingStatus {
    /// Dispatched, no result yet
    InFlight,
    /// Result arrived, success
    Completed,
    /// Result arrived, failure
    Failed,
}

/// An invocation the engine is tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Correlation token
    pub invocation_id: InvocationId,
    /// Action name
    pub action: String,
    /// Bound arguments
    pub arguments: Payload,
    /// Requesting instance
    pub instance_id: InstanceId,
    /// Requesting head
    pub head: HeadId,
    /// Status
    pub status: PendingStatus,
    /// Outcome once known
    pub result: Option<ActionOutcome>,
}

/// Table of pending actions, part of the engine snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingActions {
    entries: BTreeMap<InvocationId, PendingAction>,
}

impl PendingActions {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry by invocation id
    pub fn get(&self, invocation_id: &InvocationId) -> Option<&PendingAction> {
        self.entries.get(invocation_id)
    }

    /// Remove an entry
    pub fn remove(&mut self, invocation_id: &InvocationId) -> Option<PendingAction> {
        self.entries.remove(invocation_id)
    }

    /// In-flight invocations of an instance
    pub fn in_flight_for(&self, instance_id: &InstanceId) -> Vec<InvocationId> {
        self.entries
            .values()
            .filter(|p| &p.instance_id == instance_id && p.status == PendingStatus::InFlight)
            .map(|p| p.invocation_id.clone())
            .collect()
    }

    /// Number of in-flight invocations
    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|p| p.status == PendingStatus::InFlight)
            .count()
    }

    /// Number of tracked invocations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, pending: PendingAction) {
        self.entries.insert(pending.invocation_id.clone(), pending);
    }
}

/// What a backend is asked to run
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    /// Correlation token
    pub invocation_id: InvocationId,
    /// Action name
    pub action: String,
    /// Bound arguments
    pub arguments: Payload,
}

/// Executes invocations outside the engine loop
pub trait ActionBackend: Send + Sync {
    /// Start an invocation; must not block
    fn dispatch(&self, invocation: ActionInvocation);

    /// Stop an invocation if it is still running
    fn cancel(&self, invocation_id: &InvocationId);
}

/// How the engine should treat an incoming result event
#[derive(Debug, Clone, PartialEq)]
pub enum ResultDisposition {
    /// Deliver to the waiting head
    Deliver,
    /// Unknown, cancelled or already delivered; ignore
    Late,
}

/// Turns action requests into tracked invocations
#[derive(Clone)]
pub struct ActionDispatcher {
    backend: Arc<dyn ActionBackend>,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher").finish_non_exhaustive()
    }
}

impl ActionDispatcher {
    /// Dispatcher over a backend
    pub fn new(backend: Arc<dyn ActionBackend>) -> Self {
        Self { backend }
    }

    /// Track and start an invocation; returns its id immediately
    pub fn invoke(
        &self,
        pending: &mut PendingActions,
        instance_id: &InstanceId,
        request: ActionRequest,
    ) -> InvocationId {
        let invocation_id = request.invocation_id.clone();
        pending.insert(PendingAction {
            invocation_id: invocation_id.clone(),
            action: request.action.clone(),
            arguments: request.arguments.clone(),
            instance_id: instance_id.clone(),
            head: request.head,
            status: PendingStatus::InFlight,
            result: None,
        });
        debug!(%instance_id, %invocation_id, action = %request.action, "Dispatching action");
        self.backend.dispatch(ActionInvocation {
            invocation_id: invocation_id.clone(),
            action: request.action,
            arguments: request.arguments,
        });
        invocation_id
    }

    /// Cancel an invocation; later results for it are ignored
    pub fn cancel(&self, pending: &mut PendingActions, invocation_id: &InvocationId) -> Option<PendingAction> {
        let removed = pending.remove(invocation_id)?;
        if removed.status == PendingStatus::InFlight {
            self.backend.cancel(invocation_id);
        }
        Some(removed)
    }

    /// Record an incoming result
    pub fn accept_result(&self, pending: &mut PendingActions, event: &Event) -> ResultDisposition {
        let Some(invocation_id) = event.invocation_id() else {
            return ResultDisposition::Late;
        };
        let Some(entry) = pending.entries.get_mut(&invocation_id) else {
            return ResultDisposition::Late;
        };
        if entry.status != PendingStatus::InFlight {
            return ResultDisposition::Late;
        }

        let outcome = outcome_from_event(event);
        entry.status = if outcome.is_success() {
            PendingStatus::Completed
        } else {
            PendingStatus::Failed
        };
        entry.result = Some(outcome);
        ResultDisposition::Deliver
    }
}

fn outcome_from_event(event: &Event) -> ActionOutcome {
    match event.field("status").and_then(Value::as_str) {
        Some(crate::domain::event::STATUS_COMPLETED) => ActionOutcome::Completed {
            value: event.field("value").cloned().unwrap_or(Value::Null),
        },
        _ => {
            let error = event
                .field("error")
                .cloned()
                .and_then(|e| serde_json::from_value::<ActionError>(e).ok())
                .unwrap_or_else(|| {
                    let reason = event
                        .field("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("transient");
                    let kind = serde_json::from_value(Value::String(reason.to_string()))
                        .unwrap_or(crate::error::ActionErrorKind::Transient);
                    ActionError::new(kind, reason)
                });
            ActionOutcome::Failed { error }
        }
    }
}

/// Spawn `work` on `runtime`, tracking its abort handle under `key`.
///
/// The task does not start before its handle is registered and removes the
/// entry itself before sending the event `work` produced.
pub(crate) fn spawn_tracked<K, F>(
    runtime: &Handle,
    tasks: &Arc<DashMap<K, AbortHandle>>,
    key: K,
    completions: UnboundedSender<Event>,
    work: F,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Future<Output = Event> + Send + 'static,
{
    let (registered, armed) = oneshot::channel::<()>();
    let entries = Arc::clone(tasks);
    let id = key.clone();
    let handle = runtime.spawn(async move {
        let _ = armed.await;
        let event = work.await;
        entries.remove(&id);
        if let Err(unsent) = completions.send(event) {
            debug!(event_id = %unsent.0.id, "Completion channel closed");
        }
    });
    tasks.insert(key, handle.abort_handle());
    let _ = registered.send(());
}

/// Backend that runs each invocation as a tokio task
pub struct TokioActionBackend {
    registry: Arc<ActionRegistry>,
    completions: UnboundedSender<Event>,
    tasks: Arc<DashMap<InvocationId, AbortHandle>>,
}

impl TokioActionBackend {
    /// Backend sending results on `completions`
    pub fn new(registry: Arc<ActionRegistry>, completions: UnboundedSender<Event>) -> Self {
        Self {
            registry,
            completions,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Number of running invocations
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    fn complete_now(&self, invocation: &ActionInvocation, error: ActionError) {
        let outcome = ActionOutcome::Failed { error };
        let event = Event::action_result(&invocation.invocation_id, &invocation.action, &outcome);
        if self.completions.send(event).is_err() {
            debug!(invocation_id = %invocation.invocation_id, "Completion channel closed");
        }
    }
}

impl ActionBackend for TokioActionBackend {
    fn dispatch(&self, invocation: ActionInvocation) {
        let action = match self.registry.prepare(&invocation.action, &invocation.arguments) {
            Ok(action) => action,
            Err(error) => {
                warn!(invocation_id = %invocation.invocation_id, %error, "Action rejected");
                self.complete_now(&invocation, error);
                return;
            }
        };
        let Ok(runtime) = Handle::try_current() else {
            self.complete_now(&invocation, ActionError::unavailable("no async runtime"));
            return;
        };

        let name = invocation.action.clone();
        let invocation_id = invocation.invocation_id.clone();
        spawn_tracked(
            &runtime,
            &self.tasks,
            invocation_id.clone(),
            self.completions.clone(),
            async move {
                let outcome = match AssertUnwindSafe(action.invoke(invocation.arguments))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => ActionOutcome::from(result),
                    Err(_) => ActionOutcome::Failed {
                        error: ActionError::transient("action panicked"),
                    },
                };
                Event::action_result(&invocation_id, &name, &outcome)
            },
        );
    }

    fn cancel(&self, invocation_id: &InvocationId) {
        if let Some((_, handle)) = self.tasks.remove(invocation_id) {
            debug!(%invocation_id, "Aborting action task");
            handle.abort();
        }
    }
}

/// Backend that only records what it was asked to do
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingBackend {
    dispatched: std::sync::Mutex<Vec<ActionInvocation>>,
    cancelled: std::sync::Mutex<Vec<InvocationId>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingBackend {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation dispatched so far
    pub fn dispatched(&self) -> Vec<ActionInvocation> {
        self.dispatched.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Drain dispatched invocations
    pub fn take_dispatched(&self) -> Vec<ActionInvocation> {
        self.dispatched
            .lock()
            .map(|mut d| std::mem::take(&mut *d))
            .unwrap_or_default()
    }

    /// Every cancelled invocation so far
    pub fn cancelled(&self) -> Vec<InvocationId> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
impl ActionBackend for RecordingBackend {
    fn dispatch(&self, invocation: ActionInvocation) {
        if let Ok(mut dispatched) = self.dispatched.lock() {
            dispatched.push(invocation);
        }
    }

    fn cancel(&self, invocation_id: &InvocationId) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(invocation_id.clone());
        }
    }
}
