//!
//! Railflow Core - deterministic flow execution engine for conversational guardrails
//!
//! Flows are declarative scripts compiled into an instruction arena. Each
//! external event runs the engine to quiescence: matching heads advance,
//! activation patterns spawn instances, competing emissions are arbitrated,
//! and the events tagged for external delivery are returned to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - events, flows, instances and conflict resolution
pub mod domain;

/// Application services - dispatching, timers, the engine loop and runtime
pub mod application;

/// Identifiers and id generation
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

pub use application::dispatcher::{
    Action, ActionBackend, ActionDispatcher, ActionInvocation, ActionRegistry, FnAction,
    PendingAction, PendingActions, PendingStatus, TokioActionBackend,
};
pub use application::engine::{Engine, EngineState};
pub use application::runtime::Runtime;
pub use application::timers::{TimerService, TokioTimerService};
pub use application::verdict::{check_verdicts, EvaluateVerdicts, SuccessStrategy};
pub use config::{EngineConfig, TieBreak};
pub use domain::context::{ContextStore, Template, VarRef};
pub use domain::event::{ActionOutcome, Event, EventSource};
pub use domain::events::{EngineEvent, EngineObserver, TracingObserver};
pub use domain::flow_definition::{
    ActionMode, ConflictKey, Delivery, Element, FlowDefinition, SendTemplate, WhenArm,
};
pub use domain::flow_instance::{FlowInstance, InstanceStatus};
pub use domain::pattern::{EventPattern, FieldConstraint};
pub use domain::repository::{FlowRegistry, SnapshotRepository};
pub use error::{ActionError, ActionErrorKind, CoreError};
pub use types::{EventId, FlowId, HeadId, IdGenerator, InstanceId, InvocationId, Payload, TimerId};

#[cfg(any(test, feature = "testing"))]
pub use application::dispatcher::RecordingBackend;
#[cfg(any(test, feature = "testing"))]
pub use application::timers::RecordingTimers;
#[cfg(any(test, feature = "testing"))]
pub use domain::events::RecordingObserver;
