/// Action registry, dispatcher and backends
pub mod dispatcher;

/// Engine-owned timers
pub mod timers;

/// Built-in verdict aggregation action
pub mod verdict;

/// Engine loop
pub mod engine;

/// Async runtime facade
pub mod runtime;
