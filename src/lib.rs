pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod repository;
pub mod sandbox;

pub use crate::api::{EngineRunner, EngineRunnerBuilder, ExecutionHandle, RunStatus};
pub use crate::config::EngineConfig;
pub use crate::domain::{
    build_tree,
    ContextMetadata,
    Execution,
    ExecutionNode,
    ExecutionStatus,
    NodeStatus,
    NodeTree,
    NodeType,
    Session,
};
pub use crate::engine::{ExecuteRequest, ExecutionTrace, Orchestrator};
pub use crate::error::{EngineError, EngineResult, ErrorKind};
pub use crate::events::{EngineEvent, EventBus};
pub use crate::llm::{LmProvider, PricingTable, ProviderRegistry};
pub use crate::repository::{
    ExecutionRepository,
    InMemoryExecutionRepository,
    InMemorySessionRepository,
    SessionRepository,
};
pub use crate::sandbox::{Outcome, SandboxError};
