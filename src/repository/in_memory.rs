use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{ExecutionRepository, SessionRepository, StorageError};
use crate::domain::{Execution, ExecutionNode, Session};

pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<String, Execution>>,
    nodes: RwLock<HashMap<String, Vec<ExecutionNode>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn insert_execution(&self, execution: &Execution) -> Result<(), StorageError> {
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StorageError> {
        let mut guard = self.executions.write();
        if !guard.contains_key(&execution.id) {
            return Err(StorageError::NotFound(execution.id.clone()));
        }
        guard.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn upsert_node(&self, node: &ExecutionNode) -> Result<(), StorageError> {
        let mut guard = self.nodes.write();
        let rows = guard.entry(node.execution_id.clone()).or_default();
        match rows.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node.clone(),
            None => rows.push(node.clone()),
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StorageError> {
        Ok(self.executions.read().get(id).cloned())
    }

    async fn list_executions(&self) -> Result<Vec<Execution>, StorageError> {
        let mut rows: Vec<Execution> = self.executions.read().values().cloned().collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    async fn list_nodes(&self, execution_id: &str) -> Result<Vec<ExecutionNode>, StorageError> {
        Ok(self
            .nodes
            .read()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: Session) -> Result<Session, StorageError> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StorageError> {
        let mut rows: Vec<Session> = self.sessions.read().values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        if self.sessions.write().remove(id).is_none() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn merge_memory(
        &self,
        id: &str,
        memory: HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        // The write lock makes the merge atomic per session;
        // per-key resolution is last-writer-wins.
        let mut guard = self.sessions.write();
        let session = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        for (key, value) in memory {
            session.memory.insert(key, value);
        }
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_memory_key(&self, id: &str, key: &str, value: Value) -> Result<(), StorageError> {
        let mut guard = self.sessions.write();
        let session = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        session.memory.insert(key.to_string(), value);
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete_memory_key(&self, id: &str, key: &str) -> Result<(), StorageError> {
        let mut guard = self.sessions.write();
        let session = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if session.memory.remove(key).is_none() {
            return Err(StorageError::NotFound(format!("{}/{}", id, key)));
        }
        session.updated_at = chrono::Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::ExecutionStatus;

    #[tokio::test]
    async fn test_execution_crud() {
        let repo = InMemoryExecutionRepository::new();
        let mut execution = Execution::new("q".into(), 3, None);
        repo.insert_execution(&execution).await.unwrap();

        execution.status = ExecutionStatus::Completed;
        repo.update_execution(&execution).await.unwrap();

        let fetched = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert!(repo.get_execution("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_execution_errors() {
        let repo = InMemoryExecutionRepository::new();
        let execution = Execution::new("q".into(), 3, None);
        assert!(matches!(
            repo.update_execution(&execution).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_node_upsert_replaces_row() {
        let repo = InMemoryExecutionRepository::new();
        let execution = Execution::new("q".into(), 3, None);
        let trace = crate::engine::ExecutionTrace::new(execution.clone());
        let mut node = trace.create_node(None, 0, "p".into(), "m".into(), HashMap::new());

        repo.upsert_node(&node).await.unwrap();
        node.output = Some("done".into());
        repo.upsert_node(&node).await.unwrap();

        let rows = repo.list_nodes(&execution.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_session_memory_merge_last_writer_wins() {
        let repo = InMemorySessionRepository::new();
        let mut session = Session::new("s".into(), None);
        session.memory.insert("keep".into(), json!("old"));
        session.memory.insert("clobber".into(), json!("old"));
        let session = repo.create(session).await.unwrap();

        let mut merged = HashMap::new();
        merged.insert("clobber".to_string(), json!("new"));
        merged.insert("added".to_string(), json!(1));
        repo.merge_memory(&session.id, merged.clone()).await.unwrap();

        let fetched = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.memory.get("keep"), Some(&json!("old")));
        assert_eq!(fetched.memory.get("clobber"), Some(&json!("new")));
        assert_eq!(fetched.memory.get("added"), Some(&json!(1)));

        // Merging the same snapshot again is idempotent.
        repo.merge_memory(&session.id, merged).await.unwrap();
        let again = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(again.memory, fetched.memory);
    }

    #[tokio::test]
    async fn test_memory_key_crud() {
        let repo = InMemorySessionRepository::new();
        let session = repo.create(Session::new("s".into(), None)).await.unwrap();

        repo.set_memory_key(&session.id, "k", json!({"v": 1}))
            .await
            .unwrap();
        let fetched = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.memory.get("k"), Some(&json!({"v": 1})));

        repo.delete_memory_key(&session.id, "k").await.unwrap();
        assert!(matches!(
            repo.delete_memory_key(&session.id, "k").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
