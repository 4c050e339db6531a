//! Engine metrics
//!
//! [`MetricsObserver`] turns engine observability events into `metrics`
//! counters and keeps an in-process [`EngineStats`] tally that works without
//! any exporter installed.

use metrics::increment_counter;
use once_cell::sync::Lazy;
use railflow_core::{EngineEvent, EngineObserver, TracingObserver};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static GLOBAL_STATS: Lazy<Arc<EngineStats>> = Lazy::new(|| Arc::new(EngineStats::default()));

/// Process-wide statistics shared by observers created with [`MetricsObserver::new`]
pub fn global_stats() -> Arc<EngineStats> {
    Arc::clone(&GLOBAL_STATS)
}

/// Running totals of engine activity
#[derive(Debug, Default)]
pub struct EngineStats {
    instances_spawned: AtomicU64,
    instances_finished: AtomicU64,
    instances_aborted: AtomicU64,
    emissions_overridden: AtomicU64,
    conflict_ties: AtomicU64,
    actions_dispatched: AtomicU64,
    actions_cancelled: AtomicU64,
    late_results: AtomicU64,
    activation_limits: AtomicU64,
    budget_exhausted: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub instances_spawned: u64,
    pub instances_finished: u64,
    pub instances_aborted: u64,
    pub emissions_overridden: u64,
    pub conflict_ties: u64,
    pub actions_dispatched: u64,
    pub actions_cancelled: u64,
    pub late_results: u64,
    pub activation_limits: u64,
    pub budget_exhausted: u64,
}

impl EngineStats {
    /// Fresh, zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event
    pub fn record(&self, event: &EngineEvent) {
        let counter = match event {
            EngineEvent::InstanceSpawned { .. } => &self.instances_spawned,
            EngineEvent::InstanceFinished { .. } => &self.instances_finished,
            EngineEvent::InstanceAborted { .. } => &self.instances_aborted,
            EngineEvent::EmissionOverridden { .. } => &self.emissions_overridden,
            EngineEvent::ConflictTieBroken { .. } => &self.conflict_ties,
            EngineEvent::ActionDispatched { .. } => &self.actions_dispatched,
            EngineEvent::ActionCancelled { .. } => &self.actions_cancelled,
            EngineEvent::LateActionResult { .. } => &self.late_results,
            EngineEvent::ActivationLimitReached { .. } => &self.activation_limits,
            EngineEvent::StepBudgetExhausted { .. } => &self.budget_exhausted,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current totals
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            instances_spawned: load(&self.instances_spawned),
            instances_finished: load(&self.instances_finished),
            instances_aborted: load(&self.instances_aborted),
            emissions_overridden: load(&self.emissions_overridden),
            conflict_ties: load(&self.conflict_ties),
            actions_dispatched: load(&self.actions_dispatched),
            actions_cancelled: load(&self.actions_cancelled),
            late_results: load(&self.late_results),
            activation_limits: load(&self.activation_limits),
            budget_exhausted: load(&self.budget_exhausted),
        }
    }
}

/// Observer recording engine events as metrics, then forwarding them
#[derive(Debug)]
pub struct MetricsObserver {
    stats: Arc<EngineStats>,
    inner: Arc<dyn EngineObserver>,
}

impl MetricsObserver {
    /// Observer on the process-wide stats that also logs through tracing
    pub fn new() -> Self {
        Self::with_stats(global_stats())
    }

    /// Observer on the given stats
    pub fn with_stats(stats: Arc<EngineStats>) -> Self {
        Self {
            stats,
            inner: Arc::new(TracingObserver),
        }
    }

    /// Forward events to another observer instead of the tracing one
    pub fn forwarding_to(mut self, inner: Arc<dyn EngineObserver>) -> Self {
        self.inner = inner;
        self
    }

    /// Statistics this observer updates
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineObserver for MetricsObserver {
    fn observe(&self, event: &EngineEvent) {
        increment_counter!("railflow_engine_events_total", "type" => event.event_type());
        if let EngineEvent::EmissionOverridden { conflict_key, .. } = event {
            increment_counter!("railflow_emissions_overridden_total", "conflict_key" => conflict_key.clone());
        }
        self.stats.record(event);
        self.inner.observe(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use railflow_core::{FlowId, InstanceId, InvocationId};

    #[test]
    fn test_stats_count_relevant_events() {
        let stats = Arc::new(EngineStats::new());
        let observer = MetricsObserver::with_stats(stats.clone());

        observer.observe(&EngineEvent::InstanceSpawned {
            instance_id: InstanceId::from("i1"),
            flow: FlowId::from("f"),
            parent: None,
        });
        observer.observe(&EngineEvent::LateActionResult {
            invocation_id: InvocationId::from("x"),
        });
        observer.observe(&EngineEvent::InstanceEvicted {
            instance_id: InstanceId::from("i1"),
            flow: FlowId::from("f"),
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.instances_spawned, 1);
        assert_eq!(snapshot.late_results, 1);
        assert_eq!(snapshot.instances_finished, 0);
    }
}
