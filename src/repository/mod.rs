//! Storage boundary: execution and session repositories.
//!
//! The core writes node records on each terminal transition and does not
//! require read-your-own-write across requests while an execution is
//! running. Durability stronger than best-effort write-through is out of
//! scope; the in-memory implementations here are the reference backends.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Execution, ExecutionNode, Session};

pub mod in_memory;

pub use in_memory::{InMemoryExecutionRepository, InMemorySessionRepository};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// One row per execution, one row per node keyed by `parent_node_id`.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn insert_execution(&self, execution: &Execution) -> Result<(), StorageError>;
    async fn update_execution(&self, execution: &Execution) -> Result<(), StorageError>;
    async fn upsert_node(&self, node: &ExecutionNode) -> Result<(), StorageError>;
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StorageError>;
    async fn list_executions(&self) -> Result<Vec<Execution>, StorageError>;
    async fn list_nodes(&self, execution_id: &str) -> Result<Vec<ExecutionNode>, StorageError>;
}

/// Sessions with their persistent memory documents. Memory writes are
/// atomic per session; the merge is last-writer-wins per key.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Session>, StorageError>;
    async fn list(&self) -> Result<Vec<Session>, StorageError>;
    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Merge an execution's final memory into the session.
    async fn merge_memory(
        &self,
        id: &str,
        memory: HashMap<String, Value>,
    ) -> Result<(), StorageError>;

    async fn set_memory_key(&self, id: &str, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete_memory_key(&self, id: &str, key: &str) -> Result<(), StorageError>;
}
