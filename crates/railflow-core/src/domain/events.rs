//! Observability events
//!
//! These never influence execution. The engine hands every one of them to an
//! [`EngineObserver`] after the step that produced it.

use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, warn};

use crate::types::{EventId, FlowId, HeadId, InstanceId, InvocationId};

/// Something worth reporting about engine execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A flow instance was created
    InstanceSpawned {
        /// New instance
        instance_id: InstanceId,
        /// Its flow
        flow: FlowId,
        /// Starting instance, for child flows
        parent: Option<InstanceId>,
    },
    /// All heads of an instance reached the end
    InstanceFinished {
        /// Instance
        instance_id: InstanceId,
        /// Its flow
        flow: FlowId,
    },
    /// An instance aborted
    InstanceAborted {
        /// Instance
        instance_id: InstanceId,
        /// Its flow
        flow: FlowId,
        /// First abort reason
        reason: String,
    },
    /// A terminal instance left the live set
    InstanceEvicted {
        /// Instance
        instance_id: InstanceId,
        /// Its flow
        flow: FlowId,
    },
    /// A single head aborted
    HeadAborted {
        /// Owning instance
        instance_id: InstanceId,
        /// Head
        head: HeadId,
        /// Why
        reason: String,
    },
    /// An emission lost conflict resolution
    EmissionOverridden {
        /// Losing instance
        instance_id: InstanceId,
        /// Suppressed event name
        event_name: String,
        /// Conflict group
        conflict_key: String,
        /// Winning instance
        winner: InstanceId,
    },
    /// Two candidates tied on priority and specificity
    ConflictTieBroken {
        /// Conflict group
        conflict_key: String,
        /// Winning instance
        winner: InstanceId,
        /// Runner-up instance
        runner_up: InstanceId,
        /// The stable instance-id fallback decided
        unresolvable: bool,
    },
    /// An activation pattern hit its per-step instance limit
    ActivationLimitReached {
        /// Flow that was not started
        flow: FlowId,
        /// Canonical activation pattern
        pattern: String,
        /// Configured limit
        limit: usize,
    },
    /// An action invocation was handed to the backend
    ActionDispatched {
        /// Requesting instance
        instance_id: InstanceId,
        /// Correlation token
        invocation_id: InvocationId,
        /// Action name
        action: String,
    },
    /// An in-flight invocation was cancelled
    ActionCancelled {
        /// Correlation token
        invocation_id: InvocationId,
        /// Action name
        action: String,
    },
    /// A result arrived for an unknown, cancelled or already completed invocation
    LateActionResult {
        /// Correlation token
        invocation_id: InvocationId,
    },
    /// An event id was seen twice within one step
    DuplicateEventDropped {
        /// Event id
        event_id: EventId,
        /// Event name
        event_name: String,
    },
    /// The per-step event budget ran out before quiescence
    StepBudgetExhausted {
        /// Step number
        step: u64,
        /// Events left in the queue
        dropped: usize,
    },
}

impl EngineEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::InstanceSpawned { .. } => "instance.spawned",
            EngineEvent::InstanceFinished { .. } => "instance.finished",
            EngineEvent::InstanceAborted { .. } => "instance.aborted",
            EngineEvent::InstanceEvicted { .. } => "instance.evicted",
            EngineEvent::HeadAborted { .. } => "head.aborted",
            EngineEvent::EmissionOverridden { .. } => "emission.overridden",
            EngineEvent::ConflictTieBroken { .. } => "conflict.tie_broken",
            EngineEvent::ActivationLimitReached { .. } => "activation.limit_reached",
            EngineEvent::ActionDispatched { .. } => "action.dispatched",
            EngineEvent::ActionCancelled { .. } => "action.cancelled",
            EngineEvent::LateActionResult { .. } => "action.late_result",
            EngineEvent::DuplicateEventDropped { .. } => "event.duplicate_dropped",
            EngineEvent::StepBudgetExhausted { .. } => "step.budget_exhausted",
        }
    }

    /// Instance the event concerns, if any
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            EngineEvent::InstanceSpawned { instance_id, .. }
            | EngineEvent::InstanceFinished { instance_id, .. }
            | EngineEvent::InstanceAborted { instance_id, .. }
            | EngineEvent::InstanceEvicted { instance_id, .. }
            | EngineEvent::HeadAborted { instance_id, .. }
            | EngineEvent::EmissionOverridden { instance_id, .. }
            | EngineEvent::ActionDispatched { instance_id, .. } => Some(instance_id),
            EngineEvent::ConflictTieBroken { winner, .. } => Some(winner),
            _ => None,
        }
    }
}

/// Receiver of engine observability events
pub trait EngineObserver: Debug + Send + Sync {
    /// Called once per event, in production order
    fn observe(&self, event: &EngineEvent);
}

/// Observer that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn observe(&self, event: &EngineEvent) {
        let event_type = event.event_type();
        match event {
            EngineEvent::ConflictTieBroken {
                unresolvable: true, ..
            }
            | EngineEvent::ActivationLimitReached { .. }
            | EngineEvent::StepBudgetExhausted { .. } => warn!(event_type, ?event, "Engine event"),
            EngineEvent::InstanceAborted { .. } | EngineEvent::EmissionOverridden { .. } => {
                info!(event_type, ?event, "Engine event")
            }
            _ => debug!(event_type, ?event, "Engine event"),
        }
    }
}

/// Observer that keeps every event, for tests
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingObserver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything observed so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Observed event types, in order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events().iter().map(EngineEvent::event_type).collect()
    }
}

#[cfg(any(test, feature = "testing"))]
impl EngineObserver for RecordingObserver {
    fn observe(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let event = EngineEvent::InstanceSpawned {
            instance_id: InstanceId::from("i1"),
            flow: FlowId::from("f"),
            parent: None,
        };
        assert_eq!(event.event_type(), "instance.spawned");
        assert_eq!(event.instance_id(), Some(&InstanceId::from("i1")));

        let event = EngineEvent::StepBudgetExhausted { step: 3, dropped: 10 };
        assert_eq!(event.event_type(), "step.budget_exhausted");
        assert_eq!(event.instance_id(), None);
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::new();
        observer.observe(&EngineEvent::LateActionResult {
            invocation_id: InvocationId::from("x"),
        });
        TracingObserver.observe(&EngineEvent::LateActionResult {
            invocation_id: InvocationId::from("x"),
        });

        assert_eq!(observer.event_types(), vec!["action.late_result"]);
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::ActionCancelled {
            invocation_id: InvocationId::from("x"),
            action: "check".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "action_cancelled");
    }
}
