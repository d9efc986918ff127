//! The boundary the HTTP layer adapts: a runner facade with handles and
//! streaming subscriptions, plus session/memory CRUD passthrough.

pub mod runner;

pub use runner::{EngineRunner, EngineRunnerBuilder, ExecutionHandle, RunStatus};
