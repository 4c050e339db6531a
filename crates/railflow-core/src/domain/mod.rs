/// Events and reserved event names
pub mod event;

/// Event patterns
pub mod pattern;

/// Pattern matching and variable bindings
pub mod matcher;

/// Global and local scopes, templates and expressions
pub mod context;

/// Flow definitions and their compiled programs
pub mod flow_definition;

/// Flow instance aggregate
pub mod flow_instance;

/// Conflict resolution between competing emissions
pub mod conflict;

/// Observability events
pub mod events;

/// Flow registry and snapshot repositories
pub mod repository;
