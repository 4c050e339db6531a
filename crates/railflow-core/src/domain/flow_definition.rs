use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::context::{compile_expression, Template, VarRef};
use crate::domain::pattern::EventPattern;
use crate::error::CoreError;
use crate::types::FlowId;

/// Where a sent event goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Back onto the engine queue
    #[default]
    Internal,
    /// Into the step's output list
    External,
}

/// Group a sent event or action call competes in
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum ConflictKey {
    /// Competes with every event of the same name, or every call of the same action
    #[default]
    EventName,
    /// Competes with every event or call declaring the same key
    Custom(String),
    /// Never competes
    Exempt,
}

impl ConflictKey {
    /// Group key for an event or action called `name`
    pub fn key_for(&self, name: &str) -> Option<String> {
        match self {
            ConflictKey::EventName => Some(name.to_string()),
            ConflictKey::Custom(key) => Some(key.clone()),
            ConflictKey::Exempt => None,
        }
    }

    fn validate(&self, owner: &str) -> Result<(), CoreError> {
        match self {
            ConflictKey::Custom(key) if key.is_empty() => Err(CoreError::ValidationError(format!(
                "'{}' declares an empty conflict key",
                owner
            ))),
            _ => Ok(()),
        }
    }
}

/// Template of an event to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTemplate {
    /// Event name
    pub name: String,
    /// Payload field templates
    #[serde(default)]
    pub payload: BTreeMap<String, Template>,
    /// Delivery target
    #[serde(default)]
    pub delivery: Delivery,
    /// Conflict group
    #[serde(default)]
    pub conflict: ConflictKey,
}

impl SendTemplate {
    /// Internal event with an empty payload
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: BTreeMap::new(),
            delivery: Delivery::Internal,
            conflict: ConflictKey::EventName,
        }
    }

    /// Add a payload field
    pub fn with_field(mut self, field: impl Into<String>, template: Template) -> Self {
        self.payload.insert(field.into(), template);
        self
    }

    /// Deliver outside the engine
    pub fn external(mut self) -> Self {
        self.delivery = Delivery::External;
        self
    }

    /// Compete under a custom key
    pub fn conflict_key(mut self, key: impl Into<String>) -> Self {
        self.conflict = ConflictKey::Custom(key.into());
        self
    }

    /// Never compete
    pub fn exempt(mut self) -> Self {
        self.conflict = ConflictKey::Exempt;
        self
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "send element needs an event name".to_string(),
            ));
        }
        self.conflict.validate(&format!("send {}", self.name))?;
        self.payload.values().try_for_each(Template::validate)
    }
}

/// Whether the head waits for an action result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// Stall until the correlated result arrives
    #[default]
    Await,
    /// Continue immediately; the result can be matched later
    Start,
}

/// Action call parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteSpec {
    /// Registered action name
    pub action: String,
    /// Argument templates
    #[serde(default)]
    pub args: BTreeMap<String, Template>,
    /// Variable receiving the result payload
    #[serde(default)]
    pub result: Option<VarRef>,
    /// Await or start
    #[serde(default)]
    pub mode: ActionMode,
    /// Variable receiving the invocation id
    #[serde(default)]
    pub invocation: Option<VarRef>,
    /// Conflict group; defaults to the action name
    #[serde(default)]
    pub conflict: ConflictKey,
}

impl ExecuteSpec {
    fn validate(&self) -> Result<(), CoreError> {
        if self.action.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "execute element needs an action name".to_string(),
            ));
        }
        self.conflict.validate(&format!("execute {}", self.action))?;
        self.args.values().try_for_each(Template::validate)?;
        if let Some(var) = &self.result {
            var.validate()?;
        }
        if let Some(var) = &self.invocation {
            var.validate()?;
        }
        Ok(())
    }
}

/// One arm of a `when` race
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenArm {
    /// Event that selects this arm
    pub pattern: EventPattern,
    /// Continuation of the arm
    #[serde(default)]
    pub body: Vec<Element>,
}

/// Body element of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    /// Wait for an event
    Match {
        /// Expected event
        pattern: EventPattern,
    },
    /// Emit an event
    Send {
        /// Event to build
        event: SendTemplate,
    },
    /// Invoke an action
    ExecuteAction(ExecuteSpec),
    /// Continue down exactly one arm
    Branch {
        /// JMESPath condition
        condition: String,
        /// Taken when the condition is truthy
        #[serde(default)]
        then: Vec<Element>,
        /// Taken otherwise
        #[serde(default, rename = "else")]
        otherwise: Vec<Element>,
    },
    /// Split the head into one head per branch
    Fork {
        /// Parallel branches
        branches: Vec<Vec<Element>>,
    },
    /// Wait for every sibling of the innermost fork
    Join,
    /// Wait for the first of several events
    When {
        /// Competing arms, earlier arms win when one event matches several
        arms: Vec<WhenArm>,
    },
    /// Write a variable
    Set {
        /// Variable to write
        target: VarRef,
        /// Value to write
        value: Template,
    },
    /// Request a `timer-fired` event after a delay
    StartTimer {
        /// Delay in milliseconds
        duration_ms: u64,
        /// Variable receiving the timer id
        #[serde(default)]
        timer: Option<VarRef>,
    },
    /// Start a child flow instance
    StartFlow {
        /// Flow to start
        flow: FlowId,
        /// Variable receiving the child instance id
        #[serde(default)]
        child: Option<VarRef>,
    },
    /// Abort the head
    Abort {
        /// Abort reason
        reason: String,
    },
}

impl Element {
    /// `match` element
    pub fn match_event(pattern: EventPattern) -> Self {
        Element::Match { pattern }
    }

    /// `send` element
    pub fn send(event: SendTemplate) -> Self {
        Element::Send { event }
    }

    /// Awaited action call without arguments
    pub fn execute(action: impl Into<String>) -> Self {
        Element::ExecuteAction(ExecuteSpec {
            action: action.into(),
            args: BTreeMap::new(),
            result: None,
            mode: ActionMode::Await,
            invocation: None,
            conflict: ConflictKey::EventName,
        })
    }

    /// Add an argument to an `execute_action` element
    pub fn with_arg(mut self, name: impl Into<String>, template: Template) -> Self {
        if let Element::ExecuteAction(spec) = &mut self {
            spec.args.insert(name.into(), template);
        }
        self
    }

    /// Bind the result of an `execute_action` element
    pub fn with_result(mut self, var: impl Into<VarRef>) -> Self {
        if let Element::ExecuteAction(spec) = &mut self {
            spec.result = Some(var.into());
        }
        self
    }

    /// Make an `execute_action` element non-blocking, binding its invocation id
    pub fn started(mut self, invocation: impl Into<VarRef>) -> Self {
        if let Element::ExecuteAction(spec) = &mut self {
            spec.mode = ActionMode::Start;
            spec.invocation = Some(invocation.into());
        }
        self
    }

    /// Make an `execute_action` element compete under a custom key
    pub fn with_conflict_key(mut self, key: impl Into<String>) -> Self {
        if let Element::ExecuteAction(spec) = &mut self {
            spec.conflict = ConflictKey::Custom(key.into());
        }
        self
    }

    /// Let an `execute_action` element run without competing
    pub fn without_conflict(mut self) -> Self {
        if let Element::ExecuteAction(spec) = &mut self {
            spec.conflict = ConflictKey::Exempt;
        }
        self
    }

    /// `branch` element
    pub fn branch(condition: impl Into<String>, then: Vec<Element>, otherwise: Vec<Element>) -> Self {
        Element::Branch {
            condition: condition.into(),
            then,
            otherwise,
        }
    }

    /// `fork` element
    pub fn fork(branches: Vec<Vec<Element>>) -> Self {
        Element::Fork { branches }
    }

    /// `when` element
    pub fn when(arms: Vec<WhenArm>) -> Self {
        Element::When { arms }
    }

    /// `set` element
    pub fn set(target: impl Into<VarRef>, value: Template) -> Self {
        Element::Set {
            target: target.into(),
            value,
        }
    }

    /// `abort` element
    pub fn abort(reason: impl Into<String>) -> Self {
        Element::Abort {
            reason: reason.into(),
        }
    }
}

/// A compiled flow as handed over by the flow-language compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// Description of the flow
    #[serde(default)]
    pub description: Option<String>,

    /// Declared priority; the configured default applies when absent
    #[serde(default)]
    pub priority: Option<i32>,

    /// Pattern that spawns a new instance; child-only flows have none
    #[serde(default)]
    pub activation: Option<EventPattern>,

    /// Body sequence
    #[serde(default)]
    pub body: Vec<Element>,
}

impl FlowDefinition {
    /// Empty flow
    pub fn new(id: impl Into<FlowId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            priority: None,
            activation: None,
            body: Vec::new(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the activation pattern
    pub fn activated_by(mut self, pattern: EventPattern) -> Self {
        self.activation = Some(pattern);
        self
    }

    /// Append a body element
    pub fn then(mut self, element: Element) -> Self {
        self.body.push(element);
        self
    }

    /// Validate the flow definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::ValidationError("flow id must not be empty".to_string()));
        }
        if let Some(pattern) = &self.activation {
            pattern.validate()?;
        }
        validate_sequence(&self.body, false).map_err(|e| match e {
            CoreError::ValidationError(msg) => {
                CoreError::ValidationError(format!("flow '{}': {}", self.id, msg))
            }
            other => other,
        })
    }

    /// Flows this definition starts as children
    pub fn started_flows(&self) -> Vec<&FlowId> {
        let mut flows = Vec::new();
        collect_started_flows(&self.body, &mut flows);
        flows
    }
}

fn collect_started_flows<'a>(elements: &'a [Element], flows: &mut Vec<&'a FlowId>) {
    for element in elements {
        match element {
            Element::StartFlow { flow, .. } => flows.push(flow),
            Element::Branch { then, otherwise, .. } => {
                collect_started_flows(then, flows);
                collect_started_flows(otherwise, flows);
            }
            Element::Fork { branches } => {
                for branch in branches {
                    collect_started_flows(branch, flows);
                }
            }
            Element::When { arms } => {
                for arm in arms {
                    collect_started_flows(&arm.body, flows);
                }
            }
            _ => {}
        }
    }
}

// Joins pair with forks earlier in the same sequence, innermost first. Forks
// opened inside a nested block must be joined in that block, so a join always
// refers to the innermost group of every head reaching it.
fn validate_sequence(elements: &[Element], nested: bool) -> Result<(), CoreError> {
    let mut open_forks = 0usize;
    for element in elements {
        match element {
            Element::Match { pattern } => pattern.validate()?,
            Element::Send { event } => event.validate()?,
            Element::ExecuteAction(spec) => spec.validate()?,
            Element::Branch {
                condition,
                then,
                otherwise,
            } => {
                compile_expression(condition)?;
                validate_sequence(then, true)?;
                validate_sequence(otherwise, true)?;
            }
            Element::Fork { branches } => {
                if branches.is_empty() {
                    return Err(CoreError::ValidationError(
                        "fork needs at least one branch".to_string(),
                    ));
                }
                branches.iter().try_for_each(|b| validate_sequence(b, true))?;
                open_forks += 1;
            }
            Element::Join => {
                if open_forks == 0 {
                    return Err(CoreError::ValidationError(
                        "join without a preceding fork in the same sequence".to_string(),
                    ));
                }
                open_forks -= 1;
            }
            Element::When { arms } => {
                if arms.is_empty() {
                    return Err(CoreError::ValidationError("when needs at least one arm".to_string()));
                }
                for arm in arms {
                    arm.pattern.validate()?;
                    validate_sequence(&arm.body, true)?;
                }
            }
            Element::Set { target, value } => {
                target.validate()?;
                value.validate()?;
            }
            Element::StartTimer { timer, .. } => {
                if let Some(var) = timer {
                    var.validate()?;
                }
            }
            Element::StartFlow { flow, child } => {
                if flow.as_str().trim().is_empty() {
                    return Err(CoreError::ValidationError(
                        "start_flow needs a flow id".to_string(),
                    ));
                }
                if let Some(var) = child {
                    var.validate()?;
                }
            }
            Element::Abort { .. } => {}
        }
    }
    if nested && open_forks > 0 {
        return Err(CoreError::ValidationError(
            "fork inside a nested block must be joined in the same block".to_string(),
        ));
    }
    Ok(())
}

/// Index of an instruction in a [`Program`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position(pub u32);

impl Position {
    /// The following instruction
    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Lowered body element. All jumps point forward.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Wait for an event
    Match(EventPattern),
    /// Emit an event
    Send(SendTemplate),
    /// Invoke an action
    Execute(ExecuteSpec),
    /// Fall through when truthy, otherwise jump
    Branch {
        /// Condition
        condition: String,
        /// Start of the else arm
        otherwise: Position,
    },
    /// Unconditional jump
    Jump(Position),
    /// Split into one head per branch start
    Fork {
        /// Branch entry points
        branches: Vec<Position>,
    },
    /// Race between patterns
    When {
        /// Pattern and entry point of each arm
        arms: Vec<(EventPattern, Position)>,
    },
    /// Wait for fork siblings
    Join,
    /// Write a variable
    Set {
        /// Target
        target: VarRef,
        /// Value
        value: Template,
    },
    /// Request a timer
    StartTimer {
        /// Delay in milliseconds
        duration_ms: u64,
        /// Timer id binding
        timer: Option<VarRef>,
    },
    /// Start a child flow
    StartFlow {
        /// Child flow
        flow: FlowId,
        /// Child instance id binding
        child: Option<VarRef>,
    },
    /// Abort the head
    Abort(String),
    /// Terminal position
    End,
}

/// Arena of lowered instructions
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
}

const UNPATCHED: Position = Position(u32::MAX);

impl Program {
    /// Lower a body sequence
    pub fn lower(body: &[Element]) -> Self {
        let mut program = Program::default();
        program.lower_sequence(body);
        program.emit(Instruction::End);
        program
    }

    /// Instruction at a position; out of range reads as the end
    pub fn get(&self, position: Position) -> &Instruction {
        self.instructions
            .get(position.0 as usize)
            .unwrap_or(&Instruction::End)
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the program is empty
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    fn here(&self) -> Position {
        Position(self.instructions.len() as u32)
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    fn patch_jump(&mut self, at: usize, target: Position) {
        if let Some(Instruction::Jump(slot)) = self.instructions.get_mut(at) {
            *slot = target;
        }
    }

    fn lower_sequence(&mut self, elements: &[Element]) {
        for element in elements {
            self.lower_element(element);
        }
    }

    fn lower_element(&mut self, element: &Element) {
        match element {
            Element::Match { pattern } => {
                self.emit(Instruction::Match(pattern.clone()));
            }
            Element::Send { event } => {
                self.emit(Instruction::Send(event.clone()));
            }
            Element::ExecuteAction(spec) => {
                self.emit(Instruction::Execute(spec.clone()));
            }
            Element::Branch {
                condition,
                then,
                otherwise,
            } => {
                let branch = self.emit(Instruction::Branch {
                    condition: condition.clone(),
                    otherwise: UNPATCHED,
                });
                self.lower_sequence(then);
                let skip_else = self.emit(Instruction::Jump(UNPATCHED));
                let else_start = self.here();
                self.lower_sequence(otherwise);
                let end = self.here();
                if let Some(Instruction::Branch { otherwise, .. }) = self.instructions.get_mut(branch) {
                    *otherwise = else_start;
                }
                self.patch_jump(skip_else, end);
            }
            Element::Fork { branches } => {
                let fork = self.emit(Instruction::Fork { branches: Vec::new() });
                let (starts, exits) = self.lower_arms(branches.iter().map(Vec::as_slice));
                if let Some(Instruction::Fork { branches }) = self.instructions.get_mut(fork) {
                    *branches = starts;
                }
                let end = self.here();
                for exit in exits {
                    self.patch_jump(exit, end);
                }
            }
            Element::Join => {
                self.emit(Instruction::Join);
            }
            Element::When { arms } => {
                let when = self.emit(Instruction::When { arms: Vec::new() });
                let (starts, exits) = self.lower_arms(arms.iter().map(|arm| arm.body.as_slice()));
                if let Some(Instruction::When { arms: lowered }) = self.instructions.get_mut(when) {
                    *lowered = arms
                        .iter()
                        .zip(starts)
                        .map(|(arm, start)| (arm.pattern.clone(), start))
                        .collect();
                }
                let end = self.here();
                for exit in exits {
                    self.patch_jump(exit, end);
                }
            }
            Element::Set { target, value } => {
                self.emit(Instruction::Set {
                    target: target.clone(),
                    value: value.clone(),
                });
            }
            Element::StartTimer { duration_ms, timer } => {
                self.emit(Instruction::StartTimer {
                    duration_ms: *duration_ms,
                    timer: timer.clone(),
                });
            }
            Element::StartFlow { flow, child } => {
                self.emit(Instruction::StartFlow {
                    flow: flow.clone(),
                    child: child.clone(),
                });
            }
            Element::Abort { reason } => {
                self.emit(Instruction::Abort(reason.clone()));
            }
        }
    }

    // Each arm ends with a jump to the common continuation, patched by the caller.
    fn lower_arms<'a>(&mut self, arms: impl Iterator<Item = &'a [Element]>) -> (Vec<Position>, Vec<usize>) {
        let mut starts = Vec::new();
        let mut exits = Vec::new();
        for arm in arms {
            starts.push(self.here());
            self.lower_sequence(arm);
            exits.push(self.emit(Instruction::Jump(UNPATCHED)));
        }
        (starts, exits)
    }
}

/// A validated definition together with its lowered program
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFlow {
    /// Source definition
    pub definition: FlowDefinition,
    /// Lowered body
    pub program: Program,
}

impl CompiledFlow {
    /// Validate and lower a definition
    pub fn compile(definition: FlowDefinition) -> Result<Self, CoreError> {
        definition.validate()?;
        let program = Program::lower(&definition.body);
        Ok(Self {
            definition,
            program,
        })
    }

    /// Flow id
    pub fn id(&self) -> &FlowId {
        &self.definition.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_branch_lowering() {
        let body = vec![Element::branch(
            "ok",
            vec![Element::send(SendTemplate::new("yes"))],
            vec![Element::send(SendTemplate::new("no"))],
        )];
        let program = Program::lower(&body);

        // branch, send yes, jump, send no, end
        assert_eq!(program.len(), 5);
        assert_eq!(
            program.get(Position(0)),
            &Instruction::Branch {
                condition: "ok".to_string(),
                otherwise: Position(3)
            }
        );
        assert_eq!(program.get(Position(2)), &Instruction::Jump(Position(4)));
        assert_eq!(program.get(Position(4)), &Instruction::End);
        assert_eq!(program.get(Position(99)), &Instruction::End);
    }

    #[test]
    fn test_fork_lowering_jumps_to_continuation() {
        let body = vec![
            Element::fork(vec![
                vec![Element::send(SendTemplate::new("a"))],
                vec![Element::send(SendTemplate::new("b"))],
            ]),
            Element::Join,
        ];
        let program = Program::lower(&body);

        assert_eq!(
            program.get(Position(0)),
            &Instruction::Fork {
                branches: vec![Position(1), Position(3)]
            }
        );
        assert_eq!(program.get(Position(2)), &Instruction::Jump(Position(5)));
        assert_eq!(program.get(Position(4)), &Instruction::Jump(Position(5)));
        assert_eq!(program.get(Position(5)), &Instruction::Join);
    }

    #[test]
    fn test_join_requires_fork() {
        let flow = FlowDefinition::new("f").then(Element::Join);
        assert!(matches!(flow.validate(), Err(CoreError::ValidationError(_))));

        let nested = FlowDefinition::new("f")
            .then(Element::fork(vec![vec![]]))
            .then(Element::branch("x", vec![Element::Join], vec![]));
        assert!(nested.validate().is_err());

        let unjoined = FlowDefinition::new("f").then(Element::branch(
            "x",
            vec![Element::fork(vec![vec![], vec![]])],
            vec![],
        ));
        assert!(unjoined.validate().is_err());

        let top_level = FlowDefinition::new("f").then(Element::fork(vec![vec![], vec![]]));
        assert!(top_level.validate().is_ok());
    }

    #[test]
    fn test_bad_condition_rejected_at_load() {
        let flow = FlowDefinition::new("f").then(Element::branch("a ==", vec![], vec![]));
        assert!(CompiledFlow::compile(flow).is_err());
    }

    #[test]
    fn test_started_flows() {
        let flow = FlowDefinition::new("parent").then(Element::branch(
            "x",
            vec![Element::StartFlow {
                flow: FlowId::from("child"),
                child: None,
            }],
            vec![],
        ));
        assert_eq!(flow.started_flows(), vec![&FlowId::from("child")]);
    }

    #[test]
    fn test_action_conflict_keys() {
        let default = ConflictKey::default();
        assert_eq!(default.key_for("bot_say"), Some("bot_say".to_string()));
        assert_eq!(ConflictKey::Exempt.key_for("bot_say"), None);

        let shared = Element::execute("bot_say").with_conflict_key("bot-utterance");
        let Element::ExecuteAction(spec) = &shared else {
            panic!("expected execute_action");
        };
        assert_eq!(spec.conflict.key_for(&spec.action), Some("bot-utterance".to_string()));

        let empty = FlowDefinition::new("f").then(Element::execute("bot_say").with_conflict_key(""));
        assert!(matches!(empty.validate(), Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn test_definition_deserializes() {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "id": "greet",
            "priority": 10,
            "activation": {"name": "greeting"},
            "body": [
                {"type": "send", "event": {
                    "name": "bot-said",
                    "payload": {"text": {"kind": "literal", "value": "hi"}},
                    "delivery": "external"
                }},
                {"type": "execute_action", "action": "check", "result": "res"},
                {"type": "branch", "condition": "res.status == 'failed'",
                 "then": [{"type": "abort", "reason": "check failed"}]}
            ]
        }))
        .unwrap();

        assert_eq!(flow.priority, Some(10));
        assert_eq!(flow.body.len(), 3);
        assert!(flow.validate().is_ok());
    }
}
