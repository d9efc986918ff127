//! Error types for the orchestrator.
//!
//! - [`ErrorKind`] — The taxonomy propagated on nodes and executions.
//! - [`EngineError`] — Top-level errors for orchestrator entry and execution.

pub mod engine_error;
pub mod kind;

pub use engine_error::EngineError;
pub use kind::ErrorKind;

/// Convenience alias for engine-level results.
pub type EngineResult<T> = Result<T, EngineError>;
