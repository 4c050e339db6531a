use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::domain::conflict::{Emission, Intent};
use crate::domain::context::{assign_path, ContextStore, Scope, ScopeView, VarRef};
use crate::domain::event::{Event, EventSource, ACTION_RESULT, EMISSION_OVERRIDDEN};
use crate::domain::events::EngineEvent;
use crate::domain::flow_definition::{
    ActionMode, ExecuteSpec, Instruction, Position, Program, SendTemplate,
};
use crate::domain::matcher::{match_event, Bindings};
use crate::domain::pattern::EventPattern;
use crate::error::CoreError;
use crate::types::{
    FlowId, HeadId, IdGenerator, InstanceId, InvocationId, Payload, TimerId,
};

/// Flow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// Spawned, initial eager steps not run yet
    Starting,
    /// At least one head is live
    Active,
    /// Every live head is stalled on an action result
    WaitingOnAction,
    /// All heads reached the end
    Finished,
    /// A head or the whole instance aborted
    Aborted,
}

impl InstanceStatus {
    /// Whether no head can progress anymore
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Finished | InstanceStatus::Aborted)
    }
}

/// A pattern a head waits for and where it continues afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    /// Awaited event
    pub pattern: EventPattern,
    /// Continuation
    pub resume: Position,
}

/// State of a head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HeadState {
    /// About to execute the instruction at its position
    Ready,
    /// Waiting for the first matching expectation
    Expecting {
        /// Alternatives, earlier ones win
        expectations: Vec<Expectation>,
    },
    /// Stalled on an action result
    WaitingOnAction {
        /// Correlation token
        invocation_id: InvocationId,
        /// Variable receiving the result payload
        result: Option<VarRef>,
        /// Continuation
        resume: Position,
    },
    /// Waiting for fork siblings
    AtJoin {
        /// Fork group being joined
        group: u32,
    },
    /// Reached the end
    Finished,
    /// Aborted
    Aborted {
        /// Why
        reason: String,
    },
}

/// Membership of a head in one fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkGroup {
    /// Group id, unique within the instance
    pub id: u32,
    /// Number of siblings
    pub size: u32,
    /// Branch index of this head
    pub index: u32,
}

/// Cursor into the program of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Head {
    /// Head id
    pub id: HeadId,
    /// Current instruction
    pub position: Position,
    /// Current state
    pub state: HeadState,
    /// Local variables
    pub bindings: Bindings,
    /// Enclosing forks, innermost last
    pub fork_stack: Vec<ForkGroup>,
    /// Specificity of the last match that advanced this head
    pub specificity: u32,
}

/// A successful match of an event against a head
#[derive(Debug, Clone, PartialEq)]
pub struct HeadMatch {
    /// Continuation
    pub resume: Position,
    /// Bindings including new captures
    pub bindings: Bindings,
    /// Specificity of the matched pattern
    pub specificity: u32,
    /// Variable receiving the event payload
    pub result: Option<VarRef>,
}

/// Pattern accepting only the result of one invocation
pub fn correlation_pattern(invocation_id: &InvocationId) -> EventPattern {
    EventPattern::new(ACTION_RESULT).with_literal("invocation_id", invocation_id.as_str())
}

impl Head {
    /// Whether the head is finished or aborted
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, HeadState::Finished | HeadState::Aborted { .. })
    }

    /// Patterns this head currently waits for
    pub fn expectations(&self) -> Vec<Expectation> {
        match &self.state {
            HeadState::Expecting { expectations } => expectations.clone(),
            HeadState::WaitingOnAction {
                invocation_id,
                resume,
                ..
            } => vec![Expectation {
                pattern: correlation_pattern(invocation_id),
                resume: *resume,
            }],
            _ => Vec::new(),
        }
    }

    /// Match an event against the head's expectations
    pub fn try_match(&self, event: &Event) -> Option<HeadMatch> {
        let result = match &self.state {
            HeadState::WaitingOnAction { result, .. } => result.clone(),
            HeadState::Expecting { .. } => None,
            _ => return None,
        };
        self.expectations().into_iter().find_map(|expectation| {
            match_event(&expectation.pattern, event, &self.bindings).map(|bindings| HeadMatch {
                resume: expectation.resume,
                bindings,
                specificity: expectation.pattern.specificity(),
                result: result.clone(),
            })
        })
    }
}

/// An action call requested by a head
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Correlation token
    pub invocation_id: InvocationId,
    /// Action name
    pub action: String,
    /// Resolved arguments
    pub arguments: Payload,
    /// Requesting head
    pub head: HeadId,
}

/// A timer requested by a head
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    /// Timer id
    pub timer_id: TimerId,
    /// Delay in milliseconds
    pub duration_ms: u64,
    /// Requesting head
    pub head: HeadId,
}

/// A child flow requested by a head
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStartRequest {
    /// Child flow
    pub flow: FlowId,
    /// Id reserved for the child instance
    pub instance_id: InstanceId,
    /// Snapshot of the requesting head's bindings
    pub bindings: Bindings,
    /// Requesting head
    pub head: HeadId,
}

/// Everything an advance produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepEffects {
    /// Sends and action calls to arbitrate, in execution order
    pub emissions: Vec<Emission>,
    /// Timers to schedule
    pub timers: Vec<TimerRequest>,
    /// Child flows to spawn
    pub flow_starts: Vec<FlowStartRequest>,
    /// Heads created by forks
    pub new_heads: Vec<HeadId>,
}

impl StepEffects {
    /// Append another set of effects
    pub fn merge(&mut self, other: StepEffects) {
        self.emissions.extend(other.emissions);
        self.timers.extend(other.timers);
        self.flow_starts.extend(other.flow_starts);
        self.new_heads.extend(other.new_heads);
    }

    /// Events requested for sending
    pub fn sends(&self) -> Vec<&Event> {
        self.emissions
            .iter()
            .filter_map(|e| match &e.intent {
                Intent::Send { event, .. } => Some(event),
                Intent::Execute(_) => None,
            })
            .collect()
    }

    /// Action calls requested
    pub fn actions(&self) -> Vec<&ActionRequest> {
        self.emissions
            .iter()
            .filter_map(|e| match &e.intent {
                Intent::Execute(request) => Some(request),
                Intent::Send { .. } => None,
            })
            .collect()
    }
}

/// Outcome of advancing a head
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceResult {
    /// The head moved; the instance is still live
    Progressed(StepEffects),
    /// The event is irrelevant to the head
    NoMatch,
    /// The instance finished
    Finished(StepEffects),
    /// The instance aborted
    Aborted {
        /// First abort reason
        reason: String,
        /// Effects produced before the abort
        effects: StepEffects,
    },
}

impl AdvanceResult {
    /// Effects carried by the result
    pub fn into_effects(self) -> StepEffects {
        match self {
            AdvanceResult::Progressed(effects)
            | AdvanceResult::Finished(effects)
            | AdvanceResult::Aborted { effects, .. } => effects,
            AdvanceResult::NoMatch => StepEffects::default(),
        }
    }
}

/// What a head needs from outside its instance while running
pub struct ExecutionEnv<'a> {
    /// Lowered program of the instance's flow
    pub program: &'a Program,
    /// Global scope
    pub global: &'a mut ContextStore,
    /// Id source
    pub ids: &'a mut IdGenerator,
}

/// Aggregate: one running execution of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: InstanceId,

    /// Flow definition ID
    pub flow: FlowId,

    /// Effective priority
    pub priority: i32,

    /// Current status
    pub status: InstanceStatus,

    /// Heads in creation order
    pub heads: Vec<Head>,

    /// Logical creation sequence number
    pub created_at: u64,

    /// Instance that started this one
    pub parent: Option<InstanceId>,

    /// Step in which the instance became terminal
    pub terminated_at_step: Option<u64>,

    /// First abort reason
    pub abort_reason: Option<String>,

    /// Ids of sends and action calls of this instance suppressed by the
    /// conflict resolver
    pub overridden: Vec<String>,

    next_head: u32,
    next_group: u32,

    // Bindings of the forking head, per open fork group
    #[serde(default)]
    fork_bases: BTreeMap<u32, Bindings>,

    /// Observability events
    #[serde(skip)]
    pub events: Vec<EngineEvent>,
}

impl FlowInstance {
    /// Create an instance with one head at the start of the program
    pub fn spawn(
        id: InstanceId,
        flow: FlowId,
        priority: i32,
        created_at: u64,
        parent: Option<InstanceId>,
        bindings: Bindings,
        specificity: u32,
    ) -> Self {
        Self {
            id,
            flow,
            priority,
            status: InstanceStatus::Starting,
            heads: vec![Head {
                id: HeadId(0),
                position: Position(0),
                state: HeadState::Ready,
                bindings,
                fork_stack: Vec::new(),
                specificity,
            }],
            created_at,
            parent,
            terminated_at_step: None,
            abort_reason: None,
            overridden: Vec::new(),
            next_head: 1,
            next_group: 0,
            fork_bases: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Run the eager prefix of a freshly spawned instance
    pub fn start(&mut self, env: &mut ExecutionEnv<'_>) -> AdvanceResult {
        let ready: VecDeque<HeadId> = self
            .heads
            .iter()
            .filter(|h| h.state == HeadState::Ready)
            .map(|h| h.id)
            .collect();
        let mut effects = StepEffects::default();
        self.run(ready, env, &mut effects);
        self.refresh_status();
        self.outcome(effects)
    }

    /// Heads whose expectations the event satisfies, in head order
    pub fn matching_heads(&self, event: &Event) -> Vec<HeadId> {
        if self.status.is_terminal() || self.addressed_elsewhere(event) {
            return Vec::new();
        }
        self.heads
            .iter()
            .filter(|h| h.try_match(event).is_some())
            .map(|h| h.id)
            .collect()
    }

    /// Advance one head with a matched event and run it until it stalls
    pub fn advance(&mut self, head_id: HeadId, event: &Event, env: &mut ExecutionEnv<'_>) -> AdvanceResult {
        if self.status.is_terminal() || self.addressed_elsewhere(event) {
            return AdvanceResult::NoMatch;
        }
        let Some(idx) = self.head_index(head_id) else {
            return AdvanceResult::NoMatch;
        };
        let Some(matched) = self.heads[idx].try_match(event) else {
            return AdvanceResult::NoMatch;
        };

        let head = &mut self.heads[idx];
        head.bindings = matched.bindings;
        head.position = matched.resume;
        head.specificity = matched.specificity;
        head.state = HeadState::Ready;
        if let Some(var) = &matched.result {
            bind(&mut head.bindings, env.global, var, Value::Object(event.payload.clone()));
        }

        let mut effects = StepEffects::default();
        self.run(VecDeque::from([head_id]), env, &mut effects);
        self.refresh_status();
        self.outcome(effects)
    }

    /// Abort every live head
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let reason = reason.into();
        for head in self.heads.iter_mut().filter(|h| !h.is_terminal()) {
            head.state = HeadState::Aborted {
                reason: reason.clone(),
            };
        }
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
        self.refresh_status();
    }

    /// Invocations the instance's heads are stalled on
    pub fn pending_invocations(&self) -> Vec<InvocationId> {
        self.heads
            .iter()
            .filter_map(|h| match &h.state {
                HeadState::WaitingOnAction { invocation_id, .. } => Some(invocation_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Head by id
    pub fn head(&self, head_id: HeadId) -> Option<&Head> {
        self.heads.iter().find(|h| h.id == head_id)
    }

    /// Union of all head bindings, later heads win
    pub fn local_context(&self) -> Bindings {
        let mut context = Bindings::new();
        for head in &self.heads {
            context.extend(head.bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        context
    }

    /// Remember that an emission of this instance lost
    pub fn note_overridden(&mut self, id: impl Into<String>) {
        self.overridden.push(id.into());
    }

    /// Record an observability event
    pub fn record_event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Drain recorded observability events
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    // Override notices belong to the instance that lost.
    fn addressed_elsewhere(&self, event: &Event) -> bool {
        event.name == EMISSION_OVERRIDDEN
            && event.field("instance_id").and_then(Value::as_str) != Some(self.id.as_str())
    }

    fn head_index(&self, head_id: HeadId) -> Option<usize> {
        self.heads.iter().position(|h| h.id == head_id)
    }

    fn allocate_head(&mut self) -> HeadId {
        let id = HeadId(self.next_head);
        self.next_head += 1;
        id
    }

    fn view<'s>(&'s self, idx: usize, global: &'s ContextStore) -> ScopeView<'s> {
        ScopeView {
            locals: &self.heads[idx].bindings,
            global,
            instance_id: &self.id,
            flow: &self.flow,
        }
    }

    fn outcome(&self, effects: StepEffects) -> AdvanceResult {
        match self.status {
            InstanceStatus::Finished => AdvanceResult::Finished(effects),
            InstanceStatus::Aborted => AdvanceResult::Aborted {
                reason: self.abort_reason.clone().unwrap_or_default(),
                effects,
            },
            _ => AdvanceResult::Progressed(effects),
        }
    }

    fn refresh_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let previous = self.status;
        self.status = if self.heads.iter().all(Head::is_terminal) {
            if self.abort_reason.is_some() {
                InstanceStatus::Aborted
            } else {
                InstanceStatus::Finished
            }
        } else if self
            .heads
            .iter()
            .filter(|h| !h.is_terminal())
            .all(|h| matches!(h.state, HeadState::WaitingOnAction { .. }))
        {
            InstanceStatus::WaitingOnAction
        } else {
            InstanceStatus::Active
        };

        if previous != self.status {
            match self.status {
                InstanceStatus::Finished => self.record_event(EngineEvent::InstanceFinished {
                    instance_id: self.id.clone(),
                    flow: self.flow.clone(),
                }),
                InstanceStatus::Aborted => self.record_event(EngineEvent::InstanceAborted {
                    instance_id: self.id.clone(),
                    flow: self.flow.clone(),
                    reason: self.abort_reason.clone().unwrap_or_default(),
                }),
                _ => {}
            }
        }
    }

    fn run(&mut self, mut ready: VecDeque<HeadId>, env: &mut ExecutionEnv<'_>, effects: &mut StepEffects) {
        let program = env.program;
        while let Some(head_id) = ready.pop_front() {
            while let Some(idx) = self.head_index(head_id) {
                if self.heads[idx].state != HeadState::Ready {
                    break;
                }
                let position = self.heads[idx].position;
                match program.get(position) {
                    Instruction::Match(pattern) => {
                        self.heads[idx].state = HeadState::Expecting {
                            expectations: vec![Expectation {
                                pattern: pattern.clone(),
                                resume: position.next(),
                            }],
                        };
                    }
                    Instruction::When { arms } => {
                        self.heads[idx].state = HeadState::Expecting {
                            expectations: arms
                                .iter()
                                .map(|(pattern, start)| Expectation {
                                    pattern: pattern.clone(),
                                    resume: *start,
                                })
                                .collect(),
                        };
                    }
                    Instruction::Send(template) => match self.build_emission(idx, template, env) {
                        Ok(emission) => {
                            effects.emissions.push(emission);
                            self.heads[idx].position = position.next();
                        }
                        Err(err) => {
                            self.abort_head(idx, format!("send '{}' failed: {}", template.name, err))
                        }
                    },
                    Instruction::Execute(spec) => match self.resolve_arguments(idx, spec, env) {
                        Ok(arguments) => {
                            let invocation_id = env.ids.invocation_id();
                            let request = ActionRequest {
                                invocation_id: invocation_id.clone(),
                                action: spec.action.clone(),
                                arguments,
                                head: head_id,
                            };
                            let conflict_key = spec.conflict.key_for(&spec.action);
                            effects
                                .emissions
                                .push(self.candidate(idx, Intent::Execute(request), conflict_key));
                            let head = &mut self.heads[idx];
                            if let Some(var) = &spec.invocation {
                                bind(&mut head.bindings, env.global, var, json!(invocation_id.as_str()));
                            }
                            match spec.mode {
                                ActionMode::Await => {
                                    head.state = HeadState::WaitingOnAction {
                                        invocation_id,
                                        result: spec.result.clone(),
                                        resume: position.next(),
                                    };
                                }
                                ActionMode::Start => head.position = position.next(),
                            }
                        }
                        Err(err) => {
                            self.abort_head(idx, format!("action '{}' not started: {}", spec.action, err))
                        }
                    },
                    Instruction::Branch {
                        condition,
                        otherwise,
                    } => {
                        let verdict = self.view(idx, &*env.global).evaluate_condition(condition);
                        match verdict {
                            Ok(true) => self.heads[idx].position = position.next(),
                            Ok(false) => self.heads[idx].position = *otherwise,
                            Err(err) => self.abort_head(idx, err.to_string()),
                        }
                    }
                    Instruction::Jump(target) => self.heads[idx].position = *target,
                    Instruction::Fork { branches } => {
                        let spawned = self.fork(idx, branches);
                        effects.new_heads.extend(spawned.iter().copied());
                        ready.extend(spawned);
                    }
                    Instruction::Join => {
                        if let Some(survivor) = self.arrive_at_join(idx) {
                            if survivor != head_id {
                                ready.push_back(survivor);
                            }
                        }
                    }
                    Instruction::Set { target, value } => {
                        let resolved = self.view(idx, &*env.global).resolve(value);
                        match resolved {
                            Ok(value) => {
                                let head = &mut self.heads[idx];
                                bind(&mut head.bindings, env.global, target, value);
                                head.position = position.next();
                            }
                            Err(err) => self.abort_head(idx, format!("set '{}' failed: {}", target, err)),
                        }
                    }
                    Instruction::StartTimer { duration_ms, timer } => {
                        let timer_id = env.ids.timer_id();
                        let head = &mut self.heads[idx];
                        if let Some(var) = timer {
                            bind(&mut head.bindings, env.global, var, json!(timer_id.as_str()));
                        }
                        effects.timers.push(TimerRequest {
                            timer_id,
                            duration_ms: *duration_ms,
                            head: head.id,
                        });
                        head.position = position.next();
                    }
                    Instruction::StartFlow { flow, child } => {
                        let instance_id = env.ids.instance_id();
                        let head = &mut self.heads[idx];
                        if let Some(var) = child {
                            bind(&mut head.bindings, env.global, var, json!(instance_id.as_str()));
                        }
                        effects.flow_starts.push(FlowStartRequest {
                            flow: flow.clone(),
                            instance_id,
                            bindings: head.bindings.clone(),
                            head: head.id,
                        });
                        head.position = position.next();
                    }
                    Instruction::Abort(reason) => self.abort_head(idx, reason.clone()),
                    Instruction::End => self.heads[idx].state = HeadState::Finished,
                }
            }
        }
    }

    fn build_emission(
        &self,
        idx: usize,
        template: &SendTemplate,
        env: &mut ExecutionEnv<'_>,
    ) -> Result<Emission, CoreError> {
        let payload = {
            let view = self.view(idx, &*env.global);
            template
                .payload
                .iter()
                .map(|(field, value)| Ok((field.clone(), view.resolve(value)?)))
                .collect::<Result<Payload, CoreError>>()?
        };
        let event = Event::new(
            env.ids.event_id(),
            template.name.clone(),
            payload,
            EventSource::Internal,
        );
        let intent = Intent::Send {
            event,
            delivery: template.delivery,
        };
        Ok(self.candidate(idx, intent, template.conflict.key_for(&template.name)))
    }

    fn candidate(&self, idx: usize, intent: Intent, conflict_key: Option<String>) -> Emission {
        let head = &self.heads[idx];
        Emission {
            intent,
            conflict_key,
            instance_id: self.id.clone(),
            flow: self.flow.clone(),
            head: head.id,
            priority: self.priority,
            specificity: head.specificity,
            created_at: self.created_at,
        }
    }

    fn resolve_arguments(
        &self,
        idx: usize,
        spec: &ExecuteSpec,
        env: &ExecutionEnv<'_>,
    ) -> Result<Payload, CoreError> {
        let view = self.view(idx, &*env.global);
        spec.args
            .iter()
            .map(|(name, template)| Ok((name.clone(), view.resolve(template)?)))
            .collect()
    }

    fn fork(&mut self, idx: usize, branches: &[Position]) -> Vec<HeadId> {
        let group = self.next_group;
        self.next_group += 1;
        let size = branches.len() as u32;
        let origin = self.heads[idx].clone();
        self.fork_bases.insert(group, origin.bindings.clone());

        let mut spawned = Vec::new();
        for (index, start) in branches.iter().enumerate() {
            let mut fork_stack = origin.fork_stack.clone();
            fork_stack.push(ForkGroup {
                id: group,
                size,
                index: index as u32,
            });
            if index == 0 {
                let head = &mut self.heads[idx];
                head.position = *start;
                head.fork_stack = fork_stack;
            } else {
                let id = self.allocate_head();
                self.heads.push(Head {
                    id,
                    position: *start,
                    state: HeadState::Ready,
                    bindings: origin.bindings.clone(),
                    fork_stack,
                    specificity: origin.specificity,
                });
                spawned.push(id);
            }
        }
        spawned
    }

    // Returns the head that continues past the join once every sibling arrived.
    // Only bindings a branch changed since the fork are merged; when several
    // branches changed the same key the later sibling wins.
    fn arrive_at_join(&mut self, idx: usize) -> Option<HeadId> {
        let Some(group) = self.heads[idx].fork_stack.last().copied() else {
            let head = &mut self.heads[idx];
            head.position = head.position.next();
            return Some(head.id);
        };
        let head_id = self.heads[idx].id;
        self.heads[idx].state = HeadState::AtJoin { group: group.id };
        self.propagate_join_aborts();

        let still_waiting = self
            .head(head_id)
            .map(|h| h.state == HeadState::AtJoin { group: group.id })
            .unwrap_or(false);
        if !still_waiting {
            return None;
        }

        let mut arrived: Vec<usize> = self
            .heads
            .iter()
            .enumerate()
            .filter(|(_, h)| h.state == HeadState::AtJoin { group: group.id })
            .map(|(i, _)| i)
            .collect();
        if arrived.len() < group.size as usize {
            return None;
        }

        arrived.sort_by_key(|&i| self.heads[i].fork_stack.last().map(|g| g.index));
        let base = self.fork_bases.remove(&group.id).unwrap_or_default();
        let mut merged = base.clone();
        let mut specificity = 0;
        for &i in &arrived {
            let sibling = &self.heads[i];
            let changed = sibling
                .bindings
                .iter()
                .filter(|(k, v)| base.get(*k) != Some(*v));
            merged.extend(changed.map(|(k, v)| (k.clone(), v.clone())));
            specificity = specificity.max(sibling.specificity);
        }

        let merged_away: BTreeSet<HeadId> = arrived[1..].iter().map(|&i| self.heads[i].id).collect();
        let survivor = &mut self.heads[arrived[0]];
        survivor.bindings = merged;
        survivor.specificity = specificity;
        survivor.fork_stack.pop();
        survivor.position = survivor.position.next();
        survivor.state = HeadState::Ready;
        let survivor_id = survivor.id;

        self.heads.retain(|h| !merged_away.contains(&h.id));
        Some(survivor_id)
    }

    fn abort_head(&mut self, idx: usize, reason: String) {
        let head = &mut self.heads[idx];
        head.state = HeadState::Aborted {
            reason: reason.clone(),
        };
        let head_id = head.id;
        tracing::debug!(instance_id = %self.id, flow = %self.flow, head = %head_id, %reason, "Head aborted");
        self.record_event(EngineEvent::HeadAborted {
            instance_id: self.id.clone(),
            head: head_id,
            reason: reason.clone(),
        });
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
        self.propagate_join_aborts();
    }

    // A join can never complete once any head of its group aborted.
    fn propagate_join_aborts(&mut self) {
        loop {
            let doomed: BTreeSet<u32> = self
                .heads
                .iter()
                .filter(|h| matches!(h.state, HeadState::Aborted { .. }))
                .flat_map(|h| h.fork_stack.iter().map(|g| g.id))
                .collect();

            let mut aborted = Vec::new();
            for head in self.heads.iter_mut() {
                if let HeadState::AtJoin { group } = head.state {
                    if doomed.contains(&group) {
                        let reason = format!("sibling in fork group {} aborted", group);
                        head.state = HeadState::Aborted {
                            reason: reason.clone(),
                        };
                        aborted.push((head.id, reason));
                    }
                }
            }
            for group in &doomed {
                self.fork_bases.remove(group);
            }
            if aborted.is_empty() {
                break;
            }
            for (head, reason) in aborted {
                self.record_event(EngineEvent::HeadAborted {
                    instance_id: self.id.clone(),
                    head,
                    reason,
                });
            }
        }
    }
}

fn bind(locals: &mut Bindings, global: &mut ContextStore, var: &VarRef, value: Value) {
    match var.scope {
        Scope::Local => assign_path(locals, &var.name, value),
        Scope::Global => global.set(&var.name, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::Template;
    use crate::domain::event::ActionOutcome;
    use crate::domain::flow_definition::{CompiledFlow, Element, FlowDefinition, WhenArm};
    use crate::error::ActionError;
    use crate::types::EventId;

    struct Fixture {
        flow: CompiledFlow,
        global: ContextStore,
        ids: IdGenerator,
    }

    impl Fixture {
        fn new(definition: FlowDefinition) -> Self {
            Self {
                flow: CompiledFlow::compile(definition).unwrap(),
                global: ContextStore::new(),
                ids: IdGenerator::seeded(1),
            }
        }

        fn spawn(&mut self) -> (FlowInstance, AdvanceResult) {
            let mut instance = FlowInstance::spawn(
                InstanceId::from("i1"),
                self.flow.id().clone(),
                50,
                0,
                None,
                Bindings::new(),
                0,
            );
            let mut env = ExecutionEnv {
                program: &self.flow.program,
                global: &mut self.global,
                ids: &mut self.ids,
            };
            let result = instance.start(&mut env);
            (instance, result)
        }

        fn advance(&mut self, instance: &mut FlowInstance, head: HeadId, event: &Event) -> AdvanceResult {
            let mut env = ExecutionEnv {
                program: &self.flow.program,
                global: &mut self.global,
                ids: &mut self.ids,
            };
            instance.advance(head, event, &mut env)
        }
    }

    fn event(name: &str) -> Event {
        Event::new(EventId::from(name), name, Payload::new(), EventSource::External)
    }

    fn sent_names(effects: &StepEffects) -> Vec<String> {
        effects.sends().iter().map(|e| e.name.clone()).collect()
    }

    #[test]
    fn test_eager_sends_then_waits() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::send(SendTemplate::new("a")))
                .then(Element::match_event(EventPattern::new("go")))
                .then(Element::send(SendTemplate::new("b"))),
        );

        let (mut instance, result) = fixture.spawn();
        let effects = match result {
            AdvanceResult::Progressed(effects) => effects,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sent_names(&effects), vec!["a"]);
        assert_eq!(instance.status, InstanceStatus::Active);

        assert_eq!(fixture.advance(&mut instance, HeadId(0), &event("other")), AdvanceResult::NoMatch);

        let result = fixture.advance(&mut instance, HeadId(0), &event("go"));
        assert!(matches!(&result, AdvanceResult::Finished(e) if sent_names(e) == vec!["b"]));
        assert_eq!(instance.status, InstanceStatus::Finished);
    }

    #[test]
    fn test_await_action_correlates_exactly() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::execute("lookup").with_result("res"))
                .then(Element::send(
                    SendTemplate::new("done").with_field("status", Template::var("res.status")),
                )),
        );

        let (mut instance, result) = fixture.spawn();
        let effects = result.into_effects();
        assert_eq!(effects.actions().len(), 1);
        assert_eq!(effects.emissions[0].conflict_key.as_deref(), Some("lookup"));
        assert_eq!(instance.status, InstanceStatus::WaitingOnAction);
        let invocation = effects.actions()[0].invocation_id.clone();
        assert_eq!(instance.pending_invocations(), vec![invocation.clone()]);

        let stranger = Event::action_result(
            &InvocationId::from("someone-else"),
            "lookup",
            &ActionOutcome::Completed { value: json!(1) },
        );
        assert!(instance.matching_heads(&stranger).is_empty());
        assert_eq!(fixture.advance(&mut instance, HeadId(0), &stranger), AdvanceResult::NoMatch);

        let mine = Event::action_result(
            &invocation,
            "lookup",
            &ActionOutcome::Failed {
                error: ActionError::transient("busy"),
            },
        );
        let effects = fixture.advance(&mut instance, HeadId(0), &mine).into_effects();
        assert_eq!(effects.sends()[0].payload["status"], json!("failed"));
        assert_eq!(instance.status, InstanceStatus::Finished);
    }

    #[test]
    fn test_unresolvable_template_aborts_head() {
        let mut fixture = Fixture::new(FlowDefinition::new("f").then(Element::send(
            SendTemplate::new("x").with_field("v", Template::var("missing")),
        )));

        let (instance, result) = fixture.spawn();
        assert!(matches!(result, AdvanceResult::Aborted { .. }));
        assert_eq!(instance.status, InstanceStatus::Aborted);
        assert!(instance.abort_reason.unwrap().contains("missing"));
    }

    #[test]
    fn test_fork_join_waits_for_all_and_merges() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::fork(vec![
                    vec![
                        Element::match_event(EventPattern::new("left").with_var("v", "x")),
                        Element::set("shared", Template::literal("left")),
                    ],
                    vec![
                        Element::match_event(EventPattern::new("right").with_var("v", "y")),
                        Element::set("shared", Template::literal("right")),
                    ],
                ]))
                .then(Element::Join)
                .then(Element::send(SendTemplate::new("joined"))),
        );

        let (mut instance, result) = fixture.spawn();
        assert_eq!(result.into_effects().new_heads, vec![HeadId(1)]);
        assert_eq!(instance.heads.len(), 2);

        let mut right = event("right");
        right.payload.insert("v".to_string(), json!(2));
        let effects = fixture.advance(&mut instance, HeadId(1), &right).into_effects();
        assert!(effects.emissions.is_empty());
        assert_eq!(instance.status, InstanceStatus::Active);

        let mut left = event("left");
        left.payload.insert("v".to_string(), json!(1));
        let result = fixture.advance(&mut instance, HeadId(0), &left);
        assert!(matches!(&result, AdvanceResult::Finished(e) if sent_names(e) == vec!["joined"]));

        assert_eq!(instance.heads.len(), 1);
        let survivor = &instance.heads[0];
        assert_eq!(survivor.id, HeadId(0));
        assert_eq!(survivor.bindings["x"], json!(1));
        assert_eq!(survivor.bindings["y"], json!(2));
        // the later sibling wins on collisions
        assert_eq!(survivor.bindings["shared"], json!("right"));
    }

    #[test]
    fn test_join_keeps_writes_of_branches_that_changed_a_key() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::set("x", Template::literal(0)))
                .then(Element::fork(vec![
                    vec![Element::set("x", Template::literal(1))],
                    vec![Element::set("y", Template::literal(2))],
                ]))
                .then(Element::Join),
        );

        let (instance, result) = fixture.spawn();
        assert!(matches!(result, AdvanceResult::Finished(_)));
        let survivor = &instance.heads[0];
        assert_eq!(survivor.bindings["x"], json!(1));
        assert_eq!(survivor.bindings["y"], json!(2));
        assert!(instance.fork_bases.is_empty());
    }

    #[test]
    fn test_join_receives_abort_from_sibling() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::fork(vec![
                    vec![],
                    vec![
                        Element::match_event(EventPattern::new("fail")),
                        Element::abort("sibling gave up"),
                    ],
                ]))
                .then(Element::Join)
                .then(Element::send(SendTemplate::new("joined"))),
        );

        let (mut instance, _) = fixture.spawn();
        assert!(matches!(instance.heads[0].state, HeadState::AtJoin { .. }));

        let result = fixture.advance(&mut instance, HeadId(1), &event("fail"));
        match result {
            AdvanceResult::Aborted { reason, effects } => {
                assert_eq!(reason, "sibling gave up");
                assert!(effects.emissions.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(instance
            .heads
            .iter()
            .all(|h| matches!(h.state, HeadState::Aborted { .. })));
    }

    #[test]
    fn test_branch_and_when() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f")
                .then(Element::set("global.mode", Template::literal("strict")))
                .then(Element::branch(
                    "global.mode == 'strict'",
                    vec![Element::When {
                        arms: vec![
                            WhenArm {
                                pattern: EventPattern::new("timeout"),
                                body: vec![Element::send(SendTemplate::new("too-slow"))],
                            },
                            WhenArm {
                                pattern: EventPattern::new("answer"),
                                body: vec![Element::send(SendTemplate::new("thanks"))],
                            },
                        ],
                    }],
                    vec![Element::send(SendTemplate::new("lenient"))],
                )),
        );

        let (mut instance, result) = fixture.spawn();
        assert!(result.into_effects().emissions.is_empty());
        assert_eq!(fixture.global.get("mode"), Some(&json!("strict")));

        let result = fixture.advance(&mut instance, HeadId(0), &event("answer"));
        assert!(matches!(&result, AdvanceResult::Finished(e) if sent_names(e) == vec!["thanks"]));
    }

    #[test]
    fn test_external_abort() {
        let mut fixture = Fixture::new(
            FlowDefinition::new("f").then(Element::match_event(EventPattern::new("never"))),
        );
        let (mut instance, _) = fixture.spawn();
        instance.abort("cancelled");

        assert_eq!(instance.status, InstanceStatus::Aborted);
        assert_eq!(instance.abort_reason.as_deref(), Some("cancelled"));
        assert_eq!(instance.matching_heads(&event("never")), Vec::<HeadId>::new());
        assert!(instance
            .take_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::InstanceAborted { .. })));
    }
}
