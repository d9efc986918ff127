//! The recursive agent engine: prompt composition, per-node lifecycle,
//! orchestration, and the in-memory execution trace.

pub mod agent;
pub mod orchestrator;
pub mod prompts;
pub mod trace;

pub use agent::{AgentFailure, AgentSuccess, ChannelHost, ChildCall};
pub use orchestrator::{ExecuteRequest, Orchestrator};
pub use trace::ExecutionTrace;
