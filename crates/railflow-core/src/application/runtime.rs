use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::dispatcher::{ActionRegistry, TokioActionBackend};
use super::engine::{Engine, EngineState};
use super::timers::TokioTimerService;
use crate::config::EngineConfig;
use crate::domain::event::Event;
use crate::domain::events::EngineObserver;
use crate::domain::repository::{FlowRegistry, SnapshotRepository};
use crate::error::CoreError;
use crate::types::{InstanceId, Payload};

/// The main API for hosting an engine inside an async application.
///
/// Actions and timers run as tokio tasks; their completions queue up on an
/// internal channel until the caller feeds them back with
/// [`Runtime::next_completion`] or [`Runtime::run_until_idle`]. Steps never
/// interleave because the engine sits behind a mutex.
pub struct Runtime {
    engine: Mutex<Engine>,
    completions: Mutex<UnboundedReceiver<Event>>,
    repository: Option<Arc<dyn SnapshotRepository>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("persistent", &self.repository.is_some())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime over flows and actions
    pub fn new(flows: FlowRegistry, actions: ActionRegistry, config: EngineConfig) -> Result<Self, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(TokioActionBackend::new(Arc::new(actions), tx.clone()));
        let timers = Arc::new(TokioTimerService::new(tx));
        let engine = Engine::new(Arc::new(flows), config, backend, timers)?;
        info!("Runtime ready");
        Ok(Self {
            engine: Mutex::new(engine),
            completions: Mutex::new(rx),
            repository: None,
        })
    }

    /// Replace the engine observer
    pub fn with_observer(self, observer: Arc<dyn EngineObserver>) -> Self {
        Self {
            engine: Mutex::new(self.engine.into_inner().with_observer(observer)),
            ..self
        }
    }

    /// Persist snapshots through a repository
    pub fn with_repository(mut self, repository: Arc<dyn SnapshotRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Process an external event
    pub async fn handle_event(&self, name: &str, payload: Payload) -> Result<Vec<Event>, CoreError> {
        self.engine.lock().await.process(name, payload)
    }

    /// Process a fully formed event, such as a completion
    pub async fn handle(&self, event: Event) -> Result<Vec<Event>, CoreError> {
        self.engine.lock().await.process_event(event)
    }

    /// Wait for the next completion and process it
    pub async fn next_completion(&self) -> Result<Vec<Event>, CoreError> {
        let event = self
            .completions
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CoreError::ChannelClosed("completion channel closed".to_string()))?;
        self.handle(event).await
    }

    /// Process completions until none arrives for `idle`
    pub async fn run_until_idle(&self, idle: Duration) -> Result<Vec<Event>, CoreError> {
        let mut outputs = Vec::new();
        let mut completions = self.completions.lock().await;
        loop {
            match tokio::time::timeout(idle, completions.recv()).await {
                Ok(Some(event)) => outputs.extend(self.handle(event).await?),
                Ok(None) => break,
                Err(_) => {
                    debug!(outputs = outputs.len(), "Runtime idle");
                    break;
                }
            }
        }
        Ok(outputs)
    }

    /// Write a global variable
    pub async fn set_global(&self, path: &str, value: Value) {
        self.engine.lock().await.set_global(path, value);
    }

    /// Abort a live instance
    pub async fn abort_instance(&self, id: &InstanceId, reason: &str) -> Result<Vec<Event>, CoreError> {
        self.engine.lock().await.abort_instance(id, reason)
    }

    /// Copy of the engine state
    pub async fn snapshot(&self) -> EngineState {
        self.engine.lock().await.snapshot()
    }

    /// Replace the engine state
    pub async fn restore(&self, state: EngineState) -> Result<(), CoreError> {
        self.engine.lock().await.restore(state)
    }

    /// Save the engine state under a conversation key
    pub async fn checkpoint(&self, conversation: &str) -> Result<(), CoreError> {
        let repository = self.require_repository()?;
        let snapshot = self.engine.lock().await.snapshot_json()?;
        repository.save(conversation, snapshot).await?;
        debug!(conversation, "Checkpoint saved");
        Ok(())
    }

    /// Restore the state saved under a conversation key; false when none exists
    pub async fn resume(&self, conversation: &str) -> Result<bool, CoreError> {
        let repository = self.require_repository()?;
        match repository.load(conversation).await? {
            Some(snapshot) => {
                self.engine.lock().await.restore_json(&snapshot)?;
                debug!(conversation, "Checkpoint restored");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn require_repository(&self) -> Result<&Arc<dyn SnapshotRepository>, CoreError> {
        self.repository
            .as_ref()
            .ok_or_else(|| CoreError::ConfigurationError("no snapshot repository configured".to_string()))
    }
}
