//! Sandboxed execution of LM-generated programs.
//!
//! Programs run in a tree-walking interpreter over a restricted AST; the
//! environment is an allow-list, so capabilities the surface does not
//! document cannot be reached. One run produces exactly one [`Outcome`].

use std::collections::HashMap;
use std::time::Instant;

pub mod ast;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

pub use error::{SandboxError, SandboxResult};
pub use interpreter::{HostError, SandboxHost};

use interpreter::{Interpreter, Signal};

use crate::error::ErrorKind;

/// The single result of one sandboxed program run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The program called `FINAL(value)`.
    Final(String),
    /// The program ran to completion without calling `FINAL`.
    NoFinal,
    /// The program failed; `kind` buckets the failure.
    Error { kind: ErrorKind, message: String },
    /// The wall-clock deadline expired inside the interpreter.
    Timeout,
}

/// Outcome plus the memory mapping to record as `memory_after`.
#[derive(Debug)]
pub struct RunResult {
    pub outcome: Outcome,
    pub memory_after: HashMap<String, serde_json::Value>,
}

/// Parse and execute one program.
///
/// Memory mutations are visible in `memory_after` only when the program
/// reached `FINAL`; failed and timed-out runs report the input memory
/// unchanged, so partial side effects never leak.
pub fn run_program(
    source: &str,
    context: &str,
    memory_in: &HashMap<String, serde_json::Value>,
    host: &mut dyn SandboxHost,
    deadline: Instant,
) -> RunResult {
    let program = match parser::parse_program(source) {
        Ok(program) => program,
        Err(e) => {
            return RunResult {
                outcome: error_outcome(e),
                memory_after: memory_in.clone(),
            }
        }
    };

    let mut interp = Interpreter::new(context, memory_in, host, deadline);
    match interp.run(&program) {
        Ok(()) => RunResult {
            outcome: Outcome::NoFinal,
            memory_after: memory_in.clone(),
        },
        Err(Signal::Final(value)) => RunResult {
            memory_after: interp.memory_snapshot(),
            outcome: Outcome::Final(value),
        },
        Err(Signal::Error(e)) => RunResult {
            outcome: error_outcome(e),
            memory_after: memory_in.clone(),
        },
    }
}

fn error_outcome(e: SandboxError) -> Outcome {
    match e {
        SandboxError::Timeout => Outcome::Timeout,
        other => Outcome::Error {
            kind: other.kind(),
            message: other.to_string(),
        },
    }
}
