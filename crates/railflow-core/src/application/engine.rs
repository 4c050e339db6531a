//! Engine loop
//!
//! One call to [`Engine::process_event`] is one processing step: the event is
//! queued, every matching head advances, activation patterns spawn new
//! instances, competing emissions are arbitrated, and the loop repeats until
//! the queue is empty. Action invocations and timers leave the step through
//! the dispatcher and timer service; their completions come back as new
//! external calls.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

use super::dispatcher::{ActionBackend, ActionDispatcher, PendingActions, ResultDisposition};
use super::timers::TimerService;
use crate::config::EngineConfig;
use crate::domain::conflict::{ConflictResolver, Intent, Overridden};
use crate::domain::context::ContextStore;
use crate::domain::event::{
    ActionOutcome, Event, EventSource, ACTION_RESULT, EMISSION_OVERRIDDEN, FLOW_ABORTED,
    FLOW_FINISHED, TIMER_FIRED,
};
use crate::domain::events::{EngineEvent, EngineObserver, TracingObserver};
use crate::domain::flow_definition::{CompiledFlow, Delivery};
use crate::domain::flow_instance::{
    ActionRequest, ExecutionEnv, FlowInstance, FlowStartRequest, InstanceStatus, StepEffects,
    TimerRequest,
};
use crate::domain::matcher::{match_event, Bindings};
use crate::domain::repository::FlowRegistry;
use crate::error::{ActionError, CoreError};
use crate::types::{IdGenerator, InstanceId, InvocationId, Payload, TimerId};

/// Everything the engine carries between steps.
///
/// This is the snapshot callers persist; restoring it into an engine with
/// the same flows continues execution exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Live instances in creation order
    pub instances: Vec<FlowInstance>,
    /// Global scope
    pub global: ContextStore,
    /// Invocations not yet delivered
    pub pending_actions: PendingActions,
    /// Scheduled timers and their owners
    pub timers: BTreeMap<TimerId, InstanceId>,
    /// Id source
    pub ids: IdGenerator,
    /// Number of steps processed
    pub step: u64,
    /// Next instance creation sequence number
    pub next_instance_seq: u64,
}

impl EngineState {
    fn new(ids: IdGenerator) -> Self {
        Self {
            instances: Vec::new(),
            global: ContextStore::new(),
            pending_actions: PendingActions::new(),
            timers: BTreeMap::new(),
            ids,
            step: 0,
            next_instance_seq: 0,
        }
    }
}

#[derive(Default)]
struct StepRun {
    queue: VecDeque<Event>,
    seen: HashSet<crate::types::EventId>,
    spawned: HashMap<String, usize>,
    outputs: Vec<Event>,
    processed: usize,
}

/// Deterministic flow execution engine
pub struct Engine {
    registry: Arc<FlowRegistry>,
    config: EngineConfig,
    dispatcher: ActionDispatcher,
    timers: Arc<dyn TimerService>,
    observer: Arc<dyn EngineObserver>,
    resolver: ConflictResolver,
    state: EngineState,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("flows", &self.registry.len())
            .field("config", &self.config)
            .field("step", &self.state.step)
            .field("instances", &self.state.instances.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over a set of flows
    pub fn new(
        registry: Arc<FlowRegistry>,
        config: EngineConfig,
        backend: Arc<dyn ActionBackend>,
        timers: Arc<dyn TimerService>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        registry.check_references()?;
        let ids = config.id_seed.map(IdGenerator::seeded).unwrap_or_default();
        info!(flows = registry.len(), seeded = config.id_seed.is_some(), "Engine created");
        Ok(Self {
            resolver: ConflictResolver::new(config.tie_break),
            registry,
            config,
            dispatcher: ActionDispatcher::new(backend),
            timers,
            observer: Arc::new(TracingObserver),
            state: EngineState::new(ids),
        })
    }

    /// Replace the observer
    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loaded flows
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Number of processed steps
    pub fn step(&self) -> u64 {
        self.state.step
    }

    /// Live instances in creation order, terminal ones included until evicted
    pub fn instances(&self) -> &[FlowInstance] {
        &self.state.instances
    }

    /// Instance by id
    pub fn instance(&self, id: &InstanceId) -> Option<&FlowInstance> {
        self.state.instances.iter().find(|i| &i.id == id)
    }

    /// Global scope
    pub fn global(&self) -> &ContextStore {
        &self.state.global
    }

    /// Write a global variable between steps
    pub fn set_global(&mut self, path: &str, value: Value) {
        self.state.global.set(path, value);
    }

    /// Tracked action invocations
    pub fn pending_actions(&self) -> &PendingActions {
        &self.state.pending_actions
    }

    /// Current state
    pub fn snapshot(&self) -> EngineState {
        self.state.clone()
    }

    /// Current state as JSON
    pub fn snapshot_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&self.state)?)
    }

    /// Replace the current state
    pub fn restore(&mut self, state: EngineState) -> Result<(), CoreError> {
        for instance in &state.instances {
            self.registry.require(&instance.flow)?;
        }
        debug!(step = state.step, instances = state.instances.len(), "Engine state restored");
        self.state = state;
        Ok(())
    }

    /// Replace the current state from JSON
    pub fn restore_json(&mut self, snapshot: &str) -> Result<(), CoreError> {
        let state: EngineState = serde_json::from_str(snapshot)?;
        self.restore(state)
    }

    /// Process an external event built from a name and payload
    pub fn process(&mut self, name: &str, payload: Payload) -> Result<Vec<Event>, CoreError> {
        let event = Event::new(self.state.ids.event_id(), name, payload, EventSource::External);
        self.process_event(event)
    }

    /// Run one processing step to quiescence and return the external output
    pub fn process_event(&mut self, event: Event) -> Result<Vec<Event>, CoreError> {
        event.validate()?;
        let step = self.begin_step();
        let span = info_span!("step", step, event = %event.name);
        let _enter = span.enter();

        let delivered = match event.name.as_str() {
            ACTION_RESULT => match self.dispatcher.accept_result(&mut self.state.pending_actions, &event) {
                ResultDisposition::Deliver => event.invocation_id(),
                ResultDisposition::Late => {
                    if let Some(invocation_id) = event.invocation_id() {
                        self.observe(EngineEvent::LateActionResult { invocation_id });
                    }
                    return Ok(Vec::new());
                }
            },
            TIMER_FIRED => {
                let known = event
                    .timer_id()
                    .map(|timer_id| self.state.timers.remove(&timer_id).is_some())
                    .unwrap_or(false);
                if !known {
                    debug!(event_id = %event.id, "Ignoring cancelled or unknown timer");
                    return Ok(Vec::new());
                }
                None
            }
            _ => None,
        };

        let mut run = StepRun::default();
        run.queue.push_back(event);
        self.run_queue(step, &mut run);

        if let Some(invocation_id) = delivered {
            self.state.pending_actions.remove(&invocation_id);
        }
        self.drain_instance_events();
        debug!(outputs = run.outputs.len(), processed = run.processed, "Step quiescent");
        Ok(run.outputs)
    }

    /// Abort a live instance from outside and propagate the consequences
    pub fn abort_instance(&mut self, id: &InstanceId, reason: &str) -> Result<Vec<Event>, CoreError> {
        if !self.is_live(id) {
            return Err(CoreError::FlowInstanceNotFound(id.to_string()));
        }
        let step = self.begin_step();
        let span = info_span!("step", step, abort = %id);
        let _enter = span.enter();

        if let Some(instance) = self.state.instances.iter_mut().find(|i| &i.id == id) {
            instance.abort(reason);
        }
        let mut run = StepRun::default();
        self.finalize_terminal(step, &mut run);
        self.run_queue(step, &mut run);
        self.drain_instance_events();
        Ok(run.outputs)
    }

    fn is_live(&self, id: &InstanceId) -> bool {
        self.instance(id)
            .map(|i| !i.status.is_terminal())
            .unwrap_or(false)
    }

    fn begin_step(&mut self) -> u64 {
        self.state.step += 1;
        let step = self.state.step;
        self.evict_terminal(step);
        step
    }

    fn observe(&self, event: EngineEvent) {
        self.observer.observe(&event);
    }

    fn drain_instance_events(&mut self) {
        let events: Vec<EngineEvent> = self
            .state
            .instances
            .iter_mut()
            .flat_map(FlowInstance::take_events)
            .collect();
        for event in &events {
            self.observer.observe(event);
        }
    }

    fn evict_terminal(&mut self, step: u64) {
        let grace = self.config.terminal_grace_steps;
        let (evicted, live): (Vec<FlowInstance>, Vec<FlowInstance>) =
            std::mem::take(&mut self.state.instances)
                .into_iter()
                .partition(|i| matches!(i.terminated_at_step, Some(at) if step - at > grace));
        self.state.instances = live;

        for instance in evicted {
            for invocation_id in self.pending_for(&instance.id) {
                self.cancel_action(&invocation_id);
            }
            debug!(instance_id = %instance.id, flow = %instance.flow, "Instance evicted");
            self.observe(EngineEvent::InstanceEvicted {
                instance_id: instance.id,
                flow: instance.flow,
            });
        }
    }

    fn pending_for(&self, instance_id: &InstanceId) -> Vec<InvocationId> {
        self.state.pending_actions.in_flight_for(instance_id)
    }

    fn cancel_action(&mut self, invocation_id: &InvocationId) {
        if let Some(pending) = self
            .dispatcher
            .cancel(&mut self.state.pending_actions, invocation_id)
        {
            self.observe(EngineEvent::ActionCancelled {
                invocation_id: pending.invocation_id,
                action: pending.action,
            });
        }
    }

    fn run_queue(&mut self, step: u64, run: &mut StepRun) {
        while let Some(event) = run.queue.pop_front() {
            if run.processed >= self.config.max_events_per_step {
                let dropped = run.queue.len() + 1;
                warn!(step, dropped, "Step event budget exhausted");
                self.observe(EngineEvent::StepBudgetExhausted { step, dropped });
                run.queue.clear();
                break;
            }
            if !run.seen.insert(event.id.clone()) {
                self.observe(EngineEvent::DuplicateEventDropped {
                    event_id: event.id.clone(),
                    event_name: event.name.clone(),
                });
                continue;
            }
            run.processed += 1;
            self.process_round(step, &event, run);
            self.drain_instance_events();
        }
    }

    fn process_round(&mut self, step: u64, event: &Event, run: &mut StepRun) {
        debug!(event_id = %event.id, event = %event.name, "Processing event");
        let mut round: Vec<(InstanceId, StepEffects)> = Vec::new();

        // Heads are collected before any of them moves, so an instance spawned
        // or a head forked in this round never sees the event that caused it.
        let matched: Vec<(usize, crate::types::HeadId)> = self
            .state
            .instances
            .iter()
            .enumerate()
            .flat_map(|(index, instance)| {
                instance
                    .matching_heads(event)
                    .into_iter()
                    .map(move |head| (index, head))
            })
            .collect();

        for (index, head) in matched {
            let instance = &mut self.state.instances[index];
            let Some(flow) = self.registry.get(&instance.flow).cloned() else {
                let reason = format!("flow '{}' is not loaded", instance.flow);
                instance.abort(reason);
                continue;
            };
            let mut env = ExecutionEnv {
                program: &flow.program,
                global: &mut self.state.global,
                ids: &mut self.state.ids,
            };
            let result = instance.advance(head, event, &mut env);
            round.push((instance.id.clone(), result.into_effects()));
        }

        self.activate(event, run, &mut round);
        self.start_children(run, &mut round);
        self.apply_round(round, run);
        self.finalize_terminal(step, run);
    }

    fn activate(&mut self, event: &Event, run: &mut StepRun, round: &mut Vec<(InstanceId, StepEffects)>) {
        let registry = Arc::clone(&self.registry);
        for flow in registry.flows() {
            let Some(pattern) = &flow.definition.activation else {
                continue;
            };
            let Some(bindings) = match_event(pattern, event, &Bindings::new()) else {
                continue;
            };
            let key = pattern.key();
            if !self.reserve_spawn(run, &key, flow) {
                continue;
            }
            let id = self.state.ids.instance_id();
            let effects = self.spawn_instance(flow, id.clone(), None, bindings, pattern.specificity());
            round.push((id, effects));
        }
    }

    fn reserve_spawn(&self, run: &mut StepRun, key: &str, flow: &CompiledFlow) -> bool {
        let limit = self.config.max_instances_per_pattern;
        let spawned = run.spawned.entry(key.to_string()).or_insert(0);
        if *spawned >= limit {
            self.observe(EngineEvent::ActivationLimitReached {
                flow: flow.id().clone(),
                pattern: key.to_string(),
                limit,
            });
            return false;
        }
        *spawned += 1;
        true
    }

    fn spawn_instance(
        &mut self,
        flow: &Arc<CompiledFlow>,
        id: InstanceId,
        parent: Option<InstanceId>,
        bindings: Bindings,
        specificity: u32,
    ) -> StepEffects {
        let priority = flow
            .definition
            .priority
            .unwrap_or(self.config.default_priority);
        let created_at = self.state.next_instance_seq;
        self.state.next_instance_seq += 1;

        let mut instance = FlowInstance::spawn(
            id.clone(),
            flow.id().clone(),
            priority,
            created_at,
            parent.clone(),
            bindings,
            specificity,
        );
        debug!(instance_id = %id, flow = %flow.id(), priority, "Spawning flow instance");
        instance.record_event(EngineEvent::InstanceSpawned {
            instance_id: id,
            flow: flow.id().clone(),
            parent,
        });

        let mut env = ExecutionEnv {
            program: &flow.program,
            global: &mut self.state.global,
            ids: &mut self.state.ids,
        };
        let effects = instance.start(&mut env).into_effects();
        self.state.instances.push(instance);
        effects
    }

    fn start_children(&mut self, run: &mut StepRun, round: &mut Vec<(InstanceId, StepEffects)>) {
        let mut requests: VecDeque<(InstanceId, FlowStartRequest)> = round
            .iter_mut()
            .flat_map(|(parent, effects)| {
                std::mem::take(&mut effects.flow_starts)
                    .into_iter()
                    .map(|request| (parent.clone(), request))
                    .collect::<Vec<_>>()
            })
            .collect();

        while let Some((parent, request)) = requests.pop_front() {
            let Some(flow) = self.registry.get(&request.flow).cloned() else {
                warn!(parent = %parent, flow = %request.flow, "Child flow is not loaded");
                continue;
            };
            let key = format!("start_flow:{}", request.flow);
            if !self.reserve_spawn(run, &key, &flow) {
                continue;
            }
            let mut effects = self.spawn_instance(
                &flow,
                request.instance_id.clone(),
                Some(parent),
                request.bindings,
                0,
            );
            for child in std::mem::take(&mut effects.flow_starts) {
                requests.push_back((request.instance_id.clone(), child));
            }
            round.push((request.instance_id, effects));
        }
    }

    fn apply_round(&mut self, round: Vec<(InstanceId, StepEffects)>, run: &mut StepRun) {
        let mut emissions = Vec::new();
        let mut timers: Vec<(InstanceId, TimerRequest)> = Vec::new();
        for (instance_id, effects) in round {
            emissions.extend(effects.emissions);
            timers.extend(effects.timers.into_iter().map(|t| (instance_id.clone(), t)));
        }

        let resolution = self.resolver.resolve(emissions);
        for tie in resolution.ties {
            self.observe(EngineEvent::ConflictTieBroken {
                conflict_key: tie.conflict_key,
                winner: tie.winner,
                runner_up: tie.runner_up,
                unresolvable: tie.unresolvable,
            });
        }
        for winner in resolution.winners {
            match winner.intent {
                Intent::Send {
                    event,
                    delivery: Delivery::Internal,
                } => run.queue.push_back(event),
                Intent::Send {
                    event,
                    delivery: Delivery::External,
                } => run.outputs.push(event),
                Intent::Execute(request) => self.dispatch_action(winner.instance_id, request),
            }
        }
        for lost in resolution.overridden {
            self.suppress(lost, run);
        }

        for (instance_id, request) in timers {
            debug!(%instance_id, timer_id = %request.timer_id, duration_ms = request.duration_ms, "Scheduling timer");
            self.state.timers.insert(request.timer_id.clone(), instance_id);
            self.timers
                .schedule(&request.timer_id, Duration::from_millis(request.duration_ms));
        }
    }

    fn dispatch_action(&mut self, instance_id: InstanceId, request: ActionRequest) {
        let action = request.action.clone();
        let invocation_id = self
            .dispatcher
            .invoke(&mut self.state.pending_actions, &instance_id, request);
        self.observe(EngineEvent::ActionDispatched {
            instance_id,
            invocation_id,
            action,
        });
    }

    // The loser is told through an emission-overridden notice. A suppressed
    // action call is never dispatched; its head receives a failed result with
    // reason `overridden` instead, ahead of the notice.
    fn suppress(&mut self, lost: Overridden, run: &mut StepRun) {
        let emission = &lost.emission;
        let conflict_key = emission.conflict_key.clone().unwrap_or_default();
        if let Some(instance) = self
            .state
            .instances
            .iter_mut()
            .find(|i| i.id == emission.instance_id)
        {
            instance.note_overridden(emission.id());
        }
        self.observe(EngineEvent::EmissionOverridden {
            instance_id: emission.instance_id.clone(),
            event_name: emission.name().to_string(),
            conflict_key: conflict_key.clone(),
            winner: lost.winner.clone(),
        });

        if let Intent::Execute(request) = &emission.intent {
            debug!(instance_id = %emission.instance_id, invocation_id = %request.invocation_id, action = %request.action, "Action call overridden");
            let outcome = ActionOutcome::Failed {
                error: ActionError::overridden(format!(
                    "instance '{}' won conflict group '{}'",
                    lost.winner, conflict_key
                )),
            };
            run.queue
                .push_back(Event::action_result(&request.invocation_id, &request.action, &outcome));
        }
        let notice = self.overridden_notice(&lost);
        run.queue.push_back(notice);
    }

    fn overridden_notice(&mut self, lost: &Overridden) -> Event {
        let emission = &lost.emission;
        let mut payload = Payload::new();
        payload.insert("instance_id".to_string(), json!(emission.instance_id.as_str()));
        payload.insert("flow".to_string(), json!(emission.flow.as_str()));
        payload.insert("head".to_string(), json!(emission.head.0));
        payload.insert("event_name".to_string(), json!(emission.name()));
        match &emission.intent {
            Intent::Send { event, .. } => {
                payload.insert("event_id".to_string(), json!(event.id.as_str()));
            }
            Intent::Execute(request) => {
                payload.insert("invocation_id".to_string(), json!(request.invocation_id.as_str()));
            }
        }
        payload.insert("conflict_key".to_string(), json!(emission.conflict_key));
        payload.insert("winner_instance_id".to_string(), json!(lost.winner.as_str()));
        Event::new(
            self.state.ids.event_id(),
            EMISSION_OVERRIDDEN,
            payload,
            EventSource::Internal,
        )
    }

    // Instances that became terminal this round release their resources and
    // announce the outcome to any flow that waits for it.
    fn finalize_terminal(&mut self, step: u64, run: &mut StepRun) {
        let newly_terminal: Vec<usize> = self
            .state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status.is_terminal() && i.terminated_at_step.is_none())
            .map(|(index, _)| index)
            .collect();

        for index in newly_terminal {
            self.state.instances[index].terminated_at_step = Some(step);
            let instance_id = self.state.instances[index].id.clone();
            let status = self.state.instances[index].status;

            if status == InstanceStatus::Aborted {
                for invocation_id in self.pending_for(&instance_id) {
                    self.cancel_action(&invocation_id);
                }
            }
            let owned: Vec<TimerId> = self
                .state
                .timers
                .iter()
                .filter(|(_, owner)| **owner == instance_id)
                .map(|(timer_id, _)| timer_id.clone())
                .collect();
            for timer_id in owned {
                self.state.timers.remove(&timer_id);
                self.timers.cancel(&timer_id);
            }

            let instance = &self.state.instances[index];
            let mut payload = Payload::new();
            payload.insert("instance_id".to_string(), json!(instance.id.as_str()));
            payload.insert("flow".to_string(), json!(instance.flow.as_str()));
            payload.insert(
                "parent_instance_id".to_string(),
                json!(instance.parent.as_ref().map(InstanceId::as_str)),
            );
            let name = if status == InstanceStatus::Aborted {
                payload.insert("reason".to_string(), json!(instance.abort_reason));
                info!(instance_id = %instance.id, flow = %instance.flow, reason = ?instance.abort_reason, "Flow instance aborted");
                FLOW_ABORTED
            } else {
                debug!(instance_id = %instance.id, flow = %instance.flow, "Flow instance finished");
                FLOW_FINISHED
            };
            let event = Event::new(self.state.ids.event_id(), name, payload, EventSource::Internal);
            run.queue.push_back(event);
        }
    }
}
