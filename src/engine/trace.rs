//! In-memory trace of one execution.
//!
//! Node ids, sibling sequence numbers, and aggregate token/cost totals are
//! all allocated and updated under one lock, so the trace stays consistent
//! with the union of terminal node counters at every point.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;

use crate::domain::{
    build_tree, Execution, ExecutionNode, ExecutionStatus, NodeStatus, NodeTree, NodeType,
};
use crate::error::ErrorKind;

struct TraceInner {
    execution: Execution,
    nodes: HashMap<String, ExecutionNode>,
    order: Vec<String>,
    next_sequence: HashMap<Option<String>, usize>,
}

/// Shared, lock-guarded trace for one execution.
pub struct ExecutionTrace {
    inner: Mutex<TraceInner>,
}

impl ExecutionTrace {
    pub fn new(execution: Execution) -> Self {
        Self {
            inner: Mutex::new(TraceInner {
                execution,
                nodes: HashMap::new(),
                order: Vec::new(),
                next_sequence: HashMap::new(),
            }),
        }
    }

    pub fn execution(&self) -> Execution {
        self.inner.lock().execution.clone()
    }

    pub fn execution_id(&self) -> String {
        self.inner.lock().execution.id.clone()
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        self.inner.lock().execution.status = status;
    }

    /// Create a node in status `running`, assigning the next sequence number
    /// among its siblings in issue order.
    pub fn create_node(
        &self,
        parent_node_id: Option<String>,
        depth: usize,
        prompt: String,
        model: String,
        memory_before: HashMap<String, serde_json::Value>,
    ) -> ExecutionNode {
        let mut inner = self.inner.lock();
        let sequence = inner
            .next_sequence
            .entry(parent_node_id.clone())
            .or_insert(0);
        let sequence_number = *sequence;
        *sequence += 1;

        let node = ExecutionNode {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: inner.execution.id.clone(),
            node_type: if parent_node_id.is_none() {
                NodeType::Root
            } else {
                NodeType::Child
            },
            parent_node_id,
            depth,
            sequence_number,
            prompt,
            generated_code: None,
            status: NodeStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            model,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            output: None,
            error_message: None,
            error_kind: None,
            memory_before: Some(memory_before),
            memory_after: None,
        };
        inner.order.push(node.id.clone());
        inner.nodes.insert(node.id.clone(), node.clone());
        node
    }

    /// Apply a mutation to one node and return the updated record.
    pub fn update_node<F>(&self, node_id: &str, f: F) -> Option<ExecutionNode>
    where
        F: FnOnce(&mut ExecutionNode),
    {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(node_id)?;
        f(node);
        Some(node.clone())
    }

    /// Record one LM call's usage on a node and fold it into the execution
    /// totals.
    pub fn record_usage(&self, node_id: &str, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.input_tokens = input_tokens;
            node.output_tokens = output_tokens;
            node.cost_usd = cost_usd;
        }
        inner.execution.total_input_tokens += input_tokens;
        inner.execution.total_output_tokens += output_tokens;
        inner.execution.total_cost_usd += cost_usd;
    }

    /// Mark every node still running as failed with the given kind and
    /// return the updated records. Execution is sequential, so the running
    /// set at failure time is exactly the ancestor chain of the node that
    /// failed.
    pub fn fail_running(&self, kind: ErrorKind, message: &str) -> Vec<ExecutionNode> {
        let mut inner = self.inner.lock();
        let mut updated = Vec::new();
        for node in inner.nodes.values_mut() {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Failed;
                node.error_kind = Some(kind);
                node.error_message = Some(message.to_string());
                node.completed_at = Some(Utc::now());
                updated.push(node.clone());
            }
        }
        updated
    }

    /// Mark the execution completed with its final result.
    pub fn complete(&self, final_result: String) -> Execution {
        let mut inner = self.inner.lock();
        inner.execution.status = ExecutionStatus::Completed;
        inner.execution.final_result = Some(final_result);
        inner.execution.completed_at = Some(Utc::now());
        inner.execution.clone()
    }

    /// Mark the execution failed.
    pub fn fail(&self, kind: ErrorKind, message: String) -> Execution {
        let mut inner = self.inner.lock();
        inner.execution.status = ExecutionStatus::Failed;
        inner.execution.error_kind = Some(kind);
        inner.execution.error_message = Some(message);
        inner.execution.completed_at = Some(Utc::now());
        inner.execution.clone()
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> Vec<ExecutionNode> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<ExecutionNode> {
        self.inner.lock().nodes.get(node_id).cloned()
    }

    /// Materialize the node tree.
    pub fn tree(&self) -> Option<NodeTree> {
        build_tree(&self.nodes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> ExecutionTrace {
        let mut execution = Execution::new("q".into(), 3, None);
        execution.status = ExecutionStatus::Running;
        ExecutionTrace::new(execution)
    }

    #[test]
    fn test_sequence_numbers_per_parent() {
        let trace = trace();
        let root = trace.create_node(None, 0, "p".into(), "m".into(), HashMap::new());
        assert_eq!(root.sequence_number, 0);
        assert_eq!(root.node_type, NodeType::Root);

        let c0 = trace.create_node(Some(root.id.clone()), 1, "a".into(), "m".into(), HashMap::new());
        let c1 = trace.create_node(Some(root.id.clone()), 1, "b".into(), "m".into(), HashMap::new());
        let g0 = trace.create_node(Some(c0.id.clone()), 2, "c".into(), "m".into(), HashMap::new());
        assert_eq!(c0.sequence_number, 0);
        assert_eq!(c1.sequence_number, 1);
        assert_eq!(g0.sequence_number, 0);
    }

    #[test]
    fn test_usage_accumulates_on_execution() {
        let trace = trace();
        let root = trace.create_node(None, 0, "p".into(), "m".into(), HashMap::new());
        let child = trace.create_node(Some(root.id.clone()), 1, "a".into(), "m".into(), HashMap::new());
        trace.record_usage(&root.id, 10, 20, 0.01);
        trace.record_usage(&child.id, 5, 5, 0.002);

        let execution = trace.execution();
        assert_eq!(execution.total_input_tokens, 15);
        assert_eq!(execution.total_output_tokens, 25);
        assert!((execution.total_cost_usd - 0.012).abs() < 1e-12);

        let nodes = trace.nodes();
        let total: u64 = nodes.iter().map(|n| n.input_tokens).sum();
        assert_eq!(total, execution.total_input_tokens);
    }

    #[test]
    fn test_fail_running_marks_ancestor_chain() {
        let trace = trace();
        let root = trace.create_node(None, 0, "p".into(), "m".into(), HashMap::new());
        let child = trace.create_node(Some(root.id.clone()), 1, "a".into(), "m".into(), HashMap::new());
        let grandchild =
            trace.create_node(Some(child.id.clone()), 2, "b".into(), "m".into(), HashMap::new());

        trace.update_node(&grandchild.id, |n| n.status = NodeStatus::Timeout);
        let updated = trace.fail_running(ErrorKind::DeadlineExceeded, "deadline");
        assert_eq!(updated.len(), 2);

        let root = trace.node(&root.id).unwrap();
        let child = trace.node(&child.id).unwrap();
        let grandchild = trace.node(&grandchild.id).unwrap();
        assert_eq!(root.status, NodeStatus::Failed);
        assert_eq!(root.error_kind, Some(ErrorKind::DeadlineExceeded));
        assert_eq!(child.status, NodeStatus::Failed);
        assert_eq!(grandchild.status, NodeStatus::Timeout);
    }

    #[test]
    fn test_tree_materialization() {
        let trace = trace();
        let root = trace.create_node(None, 0, "p".into(), "m".into(), HashMap::new());
        trace.create_node(Some(root.id.clone()), 1, "a".into(), "m".into(), HashMap::new());
        trace.create_node(Some(root.id.clone()), 1, "b".into(), "m".into(), HashMap::new());

        let tree = trace.tree().unwrap();
        assert_eq!(tree.node.id, root.id);
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].node.sequence_number, 0);
        assert_eq!(tree.children[1].node.sequence_number, 1);
    }

    #[test]
    fn test_terminal_transitions() {
        let trace = trace();
        let done = trace.complete("answer".into());
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.final_result.as_deref(), Some("answer"));
        assert!(done.completed_at.is_some());

        let trace = super::tests::trace();
        let failed = trace.fail(ErrorKind::NoFinal, "program terminated without FINAL".into());
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_kind, Some(ErrorKind::NoFinal));
    }
}
