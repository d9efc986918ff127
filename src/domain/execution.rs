//! Execution and execution-node records.
//!
//! An [`Execution`] is one user-initiated run. It owns a tree of
//! [`ExecutionNode`]s: the root node is the agent whose LM output is parsed
//! as a program; child nodes are spawned by `llm_query` calls inside that
//! program.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are never left once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Running)
    }
}

/// Whether a node is the single program-generating root or an `llm_query`
/// child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Child,
}

/// One user-initiated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub user_query: String,
    pub context_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl Execution {
    pub fn new(user_query: String, context_size: usize, session_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            user_query,
            context_size,
            context_hash: None,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            final_result: None,
            error_message: None,
            error_kind: None,
        }
    }
}

/// One LM invocation within an execution.
///
/// Token counts and cost cover the single LM call this node represents,
/// never its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    pub node_type: NodeType,
    pub depth: usize,
    pub sequence_number: usize,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<String>,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_before: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_after: Option<HashMap<String, Value>>,
}

/// A node with its children, materialized on demand from the flat record
/// set by grouping on `parent_node_id` and sorting siblings by
/// `sequence_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTree {
    #[serde(flatten)]
    pub node: ExecutionNode,
    pub children: Vec<NodeTree>,
}

/// Materialize the tree for an execution from its flat node records.
///
/// Returns `None` when the node set has no root.
pub fn build_tree(nodes: &[ExecutionNode]) -> Option<NodeTree> {
    let root = nodes
        .iter()
        .find(|n| n.parent_node_id.is_none())?
        .clone();
    Some(attach_children(root, nodes))
}

fn attach_children(node: ExecutionNode, nodes: &[ExecutionNode]) -> NodeTree {
    let mut children: Vec<ExecutionNode> = nodes
        .iter()
        .filter(|n| n.parent_node_id.as_deref() == Some(node.id.as_str()))
        .cloned()
        .collect();
    children.sort_by_key(|n| n.sequence_number);
    NodeTree {
        node,
        children: children
            .into_iter()
            .map(|c| attach_children(c, nodes))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(
        id: &str,
        execution_id: &str,
        parent: Option<&str>,
        depth: usize,
        sequence: usize,
    ) -> ExecutionNode {
        ExecutionNode {
            id: id.to_string(),
            execution_id: execution_id.to_string(),
            parent_node_id: parent.map(|p| p.to_string()),
            node_type: if parent.is_none() {
                NodeType::Root
            } else {
                NodeType::Child
            },
            depth,
            sequence_number: sequence,
            prompt: "p".into(),
            generated_code: None,
            status: NodeStatus::Completed,
            started_at: Utc::now(),
            completed_at: None,
            model: "mock".into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            output: None,
            error_message: None,
            error_kind: None,
            memory_before: None,
            memory_after: None,
        }
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_node_serde_round_trip() {
        let mut node = make_node("n1", "e1", Some("n0"), 1, 2);
        node.generated_code = Some("FINAL(context)".into());
        node.memory_before = Some(HashMap::from([(
            "k".to_string(),
            serde_json::json!({"v": 1}),
        )]));
        let json = serde_json::to_string(&node).unwrap();
        let back: ExecutionNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, node.id);
        assert_eq!(back.parent_node_id, node.parent_node_id);
        assert_eq!(back.sequence_number, node.sequence_number);
        assert_eq!(back.generated_code, node.generated_code);
        assert_eq!(back.memory_before, node.memory_before);
    }

    #[test]
    fn test_build_tree_sorts_siblings_by_sequence() {
        let nodes = vec![
            make_node("root", "e1", None, 0, 0),
            make_node("c2", "e1", Some("root"), 1, 2),
            make_node("c0", "e1", Some("root"), 1, 0),
            make_node("c1", "e1", Some("root"), 1, 1),
            make_node("g0", "e1", Some("c1"), 2, 0),
        ];
        let tree = build_tree(&nodes).unwrap();
        assert_eq!(tree.node.id, "root");
        let ids: Vec<_> = tree.children.iter().map(|c| c.node.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2"]);
        assert_eq!(tree.children[1].children[0].node.id, "g0");
    }

    #[test]
    fn test_build_tree_empty() {
        assert!(build_tree(&[]).is_none());
    }
}
