//! High-level engine runner and builder.
//!
//! [`EngineRunner`] (constructed via [`EngineRunnerBuilder`]) wires the
//! orchestrator to its provider registry and repositories, spawns
//! executions, and hands out [`ExecutionHandle`]s for status polling and
//! event streaming.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::domain::{build_tree, Execution, ExecutionNode, NodeTree, Session};
use crate::engine::{ExecuteRequest, Orchestrator};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::llm::ProviderRegistry;
use crate::repository::{
    ExecutionRepository, InMemoryExecutionRepository, InMemorySessionRepository,
    SessionRepository, StorageError,
};

/// Status of a spawned execution as seen through its handle.
#[derive(Debug, Clone)]
pub enum RunStatus {
    Running,
    /// Terminal record; inspect `status` for completed vs failed.
    Finished(Execution),
    /// Rejected at entry; no execution record was created.
    Rejected(String),
}

/// Handle to a running or finished execution.
pub struct ExecutionHandle {
    execution_id: String,
    status: Arc<Mutex<RunStatus>>,
    bus: Arc<EventBus>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub async fn status(&self) -> RunStatus {
        self.status.lock().await.clone()
    }

    pub async fn wait(&self) -> RunStatus {
        loop {
            let status = self.status.lock().await.clone();
            match &status {
                RunStatus::Running => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                _ => return status,
            }
        }
    }

    /// Snapshot of events so far plus a live receiver.
    pub fn subscribe(&self) -> (Vec<EngineEvent>, broadcast::Receiver<EngineEvent>) {
        self.bus.subscribe(&self.execution_id)
    }

    /// The retained event log.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.bus.events(&self.execution_id)
    }
}

pub struct EngineRunnerBuilder {
    config: EngineConfig,
    providers: Option<Arc<ProviderRegistry>>,
    executions: Option<Arc<dyn ExecutionRepository>>,
    sessions: Option<Arc<dyn SessionRepository>>,
}

impl EngineRunnerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn executions(mut self, repo: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = Some(repo);
        self
    }

    pub fn sessions(mut self, repo: Arc<dyn SessionRepository>) -> Self {
        self.sessions = Some(repo);
        self
    }

    pub fn build(self) -> EngineRunner {
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(ProviderRegistry::with_builtins()));
        let executions = self
            .executions
            .unwrap_or_else(|| Arc::new(InMemoryExecutionRepository::new()));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(InMemorySessionRepository::new()));
        let orchestrator = Arc::new(Orchestrator::new(
            self.config,
            providers,
            executions.clone(),
            sessions.clone(),
        ));
        EngineRunner {
            orchestrator,
            executions,
            sessions,
        }
    }
}

pub struct EngineRunner {
    orchestrator: Arc<Orchestrator>,
    executions: Arc<dyn ExecutionRepository>,
    sessions: Arc<dyn SessionRepository>,
}

impl EngineRunner {
    pub fn builder() -> EngineRunnerBuilder {
        EngineRunnerBuilder {
            config: EngineConfig::default(),
            providers: None,
            executions: None,
            sessions: None,
        }
    }

    /// Spawn an execution and return its handle immediately. The handle's
    /// execution id is fixed up front so subscribers can attach before the
    /// first event.
    pub fn execute(&self, mut request: ExecuteRequest) -> ExecutionHandle {
        let execution_id = request
            .execution_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let bus = self.orchestrator.bus();
        bus.register(&execution_id);

        let status = Arc::new(Mutex::new(RunStatus::Running));
        let status_exec = status.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.run(request).await {
                Ok(execution) => {
                    *status_exec.lock().await = RunStatus::Finished(execution);
                }
                Err(e) => {
                    *status_exec.lock().await = RunStatus::Rejected(e.to_string());
                }
            }
        });

        ExecutionHandle {
            execution_id,
            status,
            bus,
        }
    }

    /// Run an execution to completion and return the terminal record.
    pub async fn execute_and_wait(&self, request: ExecuteRequest) -> EngineResult<Execution> {
        self.orchestrator.run(request).await
    }

    pub async fn get_execution(&self, id: &str) -> EngineResult<Execution> {
        self.orchestrator.get_execution(id).await
    }

    pub async fn get_nodes(&self, id: &str) -> EngineResult<Vec<ExecutionNode>> {
        self.executions
            .list_nodes(id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Materialized execution tree, siblings ordered by sequence number.
    pub async fn get_tree(&self, id: &str) -> EngineResult<NodeTree> {
        let nodes = self.get_nodes(id).await?;
        build_tree(&nodes).ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    pub async fn list_executions(&self) -> EngineResult<Vec<Execution>> {
        self.executions
            .list_executions()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    // Session and memory CRUD passthrough.

    pub async fn create_session(
        &self,
        name: String,
        context: Option<String>,
    ) -> EngineResult<Session> {
        self.sessions
            .create(Session::new(name, context))
            .await
            .map_err(storage_err)
    }

    pub async fn get_session(&self, id: &str) -> EngineResult<Session> {
        self.sessions
            .get(id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> EngineResult<Vec<Session>> {
        self.sessions.list().await.map_err(storage_err)
    }

    pub async fn delete_session(&self, id: &str) -> EngineResult<()> {
        self.sessions.delete(id).await.map_err(storage_err)
    }

    pub async fn get_memory(&self, session_id: &str) -> EngineResult<HashMap<String, Value>> {
        Ok(self.get_session(session_id).await?.memory)
    }

    pub async fn set_memory_key(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> EngineResult<()> {
        self.sessions
            .set_memory_key(session_id, key, value)
            .await
            .map_err(storage_err)
    }

    pub async fn delete_memory_key(&self, session_id: &str, key: &str) -> EngineResult<()> {
        self.sessions
            .delete_memory_key(session_id, key)
            .await
            .map_err(storage_err)
    }
}

fn storage_err(e: StorageError) -> EngineError {
    match e {
        StorageError::NotFound(what) => EngineError::SessionNotFound(what),
        other => EngineError::Storage(other.to_string()),
    }
}
