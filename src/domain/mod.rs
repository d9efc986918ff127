//! Domain records: executions, execution nodes, sessions.

pub mod execution;
pub mod session;

pub use execution::{
    build_tree, Execution, ExecutionNode, ExecutionStatus, NodeStatus, NodeTree, NodeType,
};
pub use session::{ContextMetadata, Session};
