//! Arbitration between competing emissions of one round
//!
//! An emission is either an event a head sends or an action it calls.
//! Candidates are grouped by conflict key. Within a group the best candidate
//! is chosen by priority, then match specificity, then instance creation
//! order, then instance id. Every candidate of the winning instance is
//! emitted; all others in the group are overridden.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::TieBreak;
use crate::domain::event::Event;
use crate::domain::flow_definition::Delivery;
use crate::domain::flow_instance::ActionRequest;
use crate::types::{FlowId, HeadId, InstanceId};

/// What an emission does if it wins
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Send an event
    Send {
        /// Event to send
        event: Event,
        /// Where the event goes
        delivery: Delivery,
    },
    /// Invoke an action
    Execute(ActionRequest),
}

/// An event or action call a head wants to perform this round
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// Event or call
    pub intent: Intent,
    /// Conflict group; `None` never competes
    pub conflict_key: Option<String>,
    /// Sending instance
    pub instance_id: InstanceId,
    /// Flow of the sending instance
    pub flow: FlowId,
    /// Sending head
    pub head: HeadId,
    /// Effective priority of the sending instance
    pub priority: i32,
    /// Specificity of the match that led the head here
    pub specificity: u32,
    /// Creation sequence of the sending instance
    pub created_at: u64,
}

impl Emission {
    /// Event name or action name
    pub fn name(&self) -> &str {
        match &self.intent {
            Intent::Send { event, .. } => &event.name,
            Intent::Execute(request) => &request.action,
        }
    }

    /// Event id or invocation id
    pub fn id(&self) -> &str {
        match &self.intent {
            Intent::Send { event, .. } => event.id.as_str(),
            Intent::Execute(request) => request.invocation_id.as_str(),
        }
    }
}

/// An emission that lost its group
#[derive(Debug, Clone, PartialEq)]
pub struct Overridden {
    /// The suppressed emission
    pub emission: Emission,
    /// Instance whose emission won the group
    pub winner: InstanceId,
}

/// A group where the best two instances tied on priority and specificity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictTie {
    /// Conflict group
    pub conflict_key: String,
    /// Winning instance
    pub winner: InstanceId,
    /// Runner-up instance
    pub runner_up: InstanceId,
    /// Creation order was equal too and the instance id decided
    pub unresolvable: bool,
}

/// Output of one resolution round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Emissions to deliver, in collection order
    pub winners: Vec<Emission>,
    /// Suppressed emissions, in collection order
    pub overridden: Vec<Overridden>,
    /// Tie-break decisions worth reporting
    pub ties: Vec<ConflictTie>,
}

/// Deterministic conflict resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    tie_break: TieBreak,
}

impl ConflictResolver {
    /// Resolver with the given creation-order direction
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Rank two candidates; `Less` means `a` wins
    pub fn compare(&self, a: &Emission, b: &Emission) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.specificity.cmp(&a.specificity))
            .then_with(|| self.compare_creation(a, b))
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    }

    fn compare_creation(&self, a: &Emission, b: &Emission) -> Ordering {
        match self.tie_break {
            TieBreak::EarliestFirst => a.created_at.cmp(&b.created_at),
            TieBreak::LatestFirst => b.created_at.cmp(&a.created_at),
        }
    }

    /// Resolve all emissions collected in one round
    pub fn resolve(&self, emissions: Vec<Emission>) -> Resolution {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, emission) in emissions.iter().enumerate() {
            if let Some(key) = &emission.conflict_key {
                groups.entry(key.as_str()).or_default().push(index);
            }
        }

        let mut winner_of: Vec<Option<InstanceId>> = vec![None; emissions.len()];
        let mut ties = Vec::new();
        for (key, members) in &groups {
            let mut ranked: Vec<&Emission> = members.iter().map(|&i| &emissions[i]).collect();
            ranked.sort_by(|a, b| self.compare(a, b));
            let best = ranked[0];

            if let Some(runner_up) = ranked.iter().find(|e| e.instance_id != best.instance_id) {
                if runner_up.priority == best.priority && runner_up.specificity == best.specificity {
                    ties.push(ConflictTie {
                        conflict_key: key.to_string(),
                        winner: best.instance_id.clone(),
                        runner_up: runner_up.instance_id.clone(),
                        unresolvable: runner_up.created_at == best.created_at,
                    });
                }
            }

            for &i in members {
                winner_of[i] = Some(best.instance_id.clone());
            }
        }

        let mut resolution = Resolution {
            ties,
            ..Resolution::default()
        };
        for (emission, winner) in emissions.into_iter().zip(winner_of) {
            match winner {
                Some(winner) if winner != emission.instance_id => {
                    resolution.overridden.push(Overridden { emission, winner });
                }
                _ => resolution.winners.push(emission),
            }
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventSource;
    use crate::types::{EventId, InvocationId, Payload};

    fn emission(instance: &str, name: &str, priority: i32, specificity: u32, created_at: u64) -> Emission {
        Emission {
            intent: Intent::Send {
                event: Event::new(
                    EventId(format!("{}-{}", instance, name)),
                    name,
                    Payload::new(),
                    EventSource::Internal,
                ),
                delivery: Delivery::External,
            },
            conflict_key: Some(name.to_string()),
            instance_id: InstanceId::from(instance),
            flow: FlowId::from(instance),
            head: HeadId(0),
            priority,
            specificity,
            created_at,
        }
    }

    #[test]
    fn test_higher_priority_wins_regardless_of_order() {
        let resolver = ConflictResolver::default();
        for emissions in [
            vec![emission("low", "say", 1, 0, 0), emission("high", "say", 9, 0, 1)],
            vec![emission("high", "say", 9, 0, 1), emission("low", "say", 1, 0, 0)],
        ] {
            let resolution = resolver.resolve(emissions);
            assert_eq!(resolution.winners.len(), 1);
            assert_eq!(resolution.winners[0].instance_id.as_str(), "high");
            assert_eq!(resolution.overridden.len(), 1);
            assert_eq!(resolution.overridden[0].winner.as_str(), "high");
            assert!(resolution.ties.is_empty());
        }
    }

    #[test]
    fn test_specificity_then_creation_order() {
        let resolver = ConflictResolver::default();
        let resolution = resolver.resolve(vec![
            emission("general", "say", 5, 0, 0),
            emission("specific", "say", 5, 2, 1),
        ]);
        assert_eq!(resolution.winners[0].instance_id.as_str(), "specific");

        let resolution = resolver.resolve(vec![
            emission("second", "say", 5, 1, 7),
            emission("first", "say", 5, 1, 3),
        ]);
        assert_eq!(resolution.winners[0].instance_id.as_str(), "first");
        assert_eq!(resolution.ties.len(), 1);
        assert!(!resolution.ties[0].unresolvable);

        let latest = ConflictResolver::new(TieBreak::LatestFirst).resolve(vec![
            emission("second", "say", 5, 1, 7),
            emission("first", "say", 5, 1, 3),
        ]);
        assert_eq!(latest.winners[0].instance_id.as_str(), "second");
    }

    #[test]
    fn test_full_tie_falls_back_to_instance_id() {
        let resolution = ConflictResolver::default().resolve(vec![
            emission("b", "say", 5, 1, 3),
            emission("a", "say", 5, 1, 3),
        ]);
        assert_eq!(resolution.winners[0].instance_id.as_str(), "a");
        assert!(resolution.ties[0].unresolvable);
    }

    #[test]
    fn test_groups_and_exempt_emissions_are_independent() {
        let mut exempt = emission("low", "log", 0, 0, 0);
        exempt.conflict_key = None;
        let mut shared = emission("low", "say", 0, 0, 0);
        shared.conflict_key = Some("reply".to_string());
        let mut other = emission("high", "ask", 9, 0, 1);
        other.conflict_key = Some("reply".to_string());

        let resolution = ConflictResolver::default().resolve(vec![
            exempt,
            shared,
            other,
            emission("low", "unrelated", 0, 0, 0),
        ]);

        let names: Vec<&str> = resolution.winners.iter().map(Emission::name).collect();
        assert_eq!(names, vec!["log", "ask", "unrelated"]);
        assert_eq!(resolution.overridden[0].emission.name(), "say");
    }

    #[test]
    fn test_winning_instance_keeps_all_its_emissions() {
        let resolution = ConflictResolver::default().resolve(vec![
            emission("a", "say", 5, 0, 0),
            emission("b", "say", 1, 0, 1),
            emission("a", "say", 5, 0, 0),
        ]);
        assert_eq!(resolution.winners.len(), 2);
        assert!(resolution.winners.iter().all(|e| e.instance_id.as_str() == "a"));
    }

    #[test]
    fn test_action_calls_compete_with_sends_on_shared_key() {
        let call = |instance: &str, priority: i32, created_at: u64| Emission {
            intent: Intent::Execute(ActionRequest {
                invocation_id: InvocationId(format!("{}-call", instance)),
                action: "bot_say".to_string(),
                arguments: Payload::new(),
                head: HeadId(0),
            }),
            conflict_key: Some("reply".to_string()),
            ..emission(instance, "unused", priority, 0, created_at)
        };
        let mut send = emission("mid", "ask", 5, 0, 2);
        send.conflict_key = Some("reply".to_string());

        let resolution = ConflictResolver::default().resolve(vec![call("low", 1, 0), send, call("high", 9, 1)]);

        assert_eq!(resolution.winners.len(), 1);
        assert_eq!(resolution.winners[0].id(), "high-call");
        let lost: Vec<&str> = resolution.overridden.iter().map(|o| o.emission.id()).collect();
        assert_eq!(lost, vec!["low-call", "mid-ask"]);
    }
}
