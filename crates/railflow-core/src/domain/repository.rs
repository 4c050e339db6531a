//! Flow registry and snapshot persistence
//!
//! The registry holds every compiled flow the engine may run. Snapshot
//! repositories let callers persist engine state between process runs; the
//! engine itself never persists anything on its own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::flow_definition::{CompiledFlow, FlowDefinition};
use crate::error::CoreError;
use crate::types::FlowId;

/// Compiled flows in registration order
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: Vec<Arc<CompiledFlow>>,
    index: HashMap<FlowId, usize>,
}

impl FlowRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and check a full set of definitions
    pub fn from_definitions<I>(definitions: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = FlowDefinition>,
    {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        registry.check_references()?;
        Ok(registry)
    }

    /// Validate, compile and add a definition
    pub fn register(&mut self, definition: FlowDefinition) -> Result<Arc<CompiledFlow>, CoreError> {
        if self.index.contains_key(&definition.id) {
            return Err(CoreError::DuplicateDefinition(definition.id.to_string()));
        }
        let compiled = Arc::new(CompiledFlow::compile(definition)?);
        debug!(flow = %compiled.id(), instructions = compiled.program.len(), "Registered flow");
        self.index.insert(compiled.id().clone(), self.flows.len());
        self.flows.push(Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Every `start_flow` target must be registered
    pub fn check_references(&self) -> Result<(), CoreError> {
        for flow in &self.flows {
            for target in flow.definition.started_flows() {
                if !self.index.contains_key(target) {
                    return Err(CoreError::ReferenceError(format!(
                        "flow '{}' starts unknown flow '{}'",
                        flow.id(),
                        target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Flow by id
    pub fn get(&self, id: &FlowId) -> Option<&Arc<CompiledFlow>> {
        self.index.get(id).map(|&i| &self.flows[i])
    }

    /// Flow by id, or an error
    pub fn require(&self, id: &FlowId) -> Result<&Arc<CompiledFlow>, CoreError> {
        self.get(id)
            .ok_or_else(|| CoreError::DefinitionNotFound(id.to_string()))
    }

    /// All flows in registration order
    pub fn flows(&self) -> impl Iterator<Item = &Arc<CompiledFlow>> {
        self.flows.iter()
    }

    /// Number of flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Storage for serialized engine snapshots, keyed by conversation
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Load a snapshot
    async fn load(&self, conversation: &str) -> Result<Option<String>, CoreError>;

    /// Save a snapshot, replacing any previous one
    async fn save(&self, conversation: &str, snapshot: String) -> Result<(), CoreError>;

    /// Delete a snapshot
    async fn delete(&self, conversation: &str) -> Result<(), CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;

    /// In-memory snapshot repository
    #[derive(Debug, Default)]
    pub struct MemorySnapshotRepository {
        snapshots: DashMap<String, String>,
    }

    impl MemorySnapshotRepository {
        /// Create a new memory snapshot repository
        pub fn new() -> Self {
            Self {
                snapshots: DashMap::with_capacity(16),
            }
        }

        /// Number of stored snapshots
        pub fn len(&self) -> usize {
            self.snapshots.len()
        }

        /// Whether nothing is stored
        pub fn is_empty(&self) -> bool {
            self.snapshots.is_empty()
        }
    }

    #[async_trait]
    impl SnapshotRepository for MemorySnapshotRepository {
        async fn load(&self, conversation: &str) -> Result<Option<String>, CoreError> {
            Ok(self.snapshots.get(conversation).map(|s| s.value().clone()))
        }

        async fn save(&self, conversation: &str, snapshot: String) -> Result<(), CoreError> {
            self.snapshots.insert(conversation.to_string(), snapshot);
            Ok(())
        }

        async fn delete(&self, conversation: &str) -> Result<(), CoreError> {
            self.snapshots.remove(conversation);
            Ok(())
        }
    }
}
