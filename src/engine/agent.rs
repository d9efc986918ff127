//! Bridging between the blocking interpreter and the async orchestrator.
//!
//! The sandbox runs on a blocking worker. When a program calls
//! `llm_query`, the worker posts a [`ChildCall`] to the orchestrator task
//! and parks on a oneshot reply; the orchestrator services the call with a
//! nested agent invocation at `depth + 1` and completes the reply.

use tokio::sync::{mpsc, oneshot};

use crate::error::ErrorKind;
use crate::sandbox::{HostError, SandboxHost};

/// One `llm_query` request crossing from the interpreter to the
/// orchestrator.
pub struct ChildCall {
    pub prompt: String,
    pub reply: oneshot::Sender<Result<String, HostError>>,
}

/// Sandbox host backed by a channel to the orchestrator task.
pub struct ChannelHost {
    tx: mpsc::Sender<ChildCall>,
}

impl ChannelHost {
    pub fn new(tx: mpsc::Sender<ChildCall>) -> Self {
        Self { tx }
    }
}

impl SandboxHost for ChannelHost {
    fn llm_query(&mut self, prompt: String) -> Result<String, HostError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(ChildCall {
                prompt,
                reply: reply_tx,
            })
            .map_err(|_| HostError {
                kind: ErrorKind::DeadlineExceeded,
                message: "orchestrator stopped servicing child calls".to_string(),
            })?;
        reply_rx.blocking_recv().map_err(|_| HostError {
            kind: ErrorKind::DeadlineExceeded,
            message: "orchestrator dropped the child call".to_string(),
        })?
    }
}

/// How one agent invocation ended, as seen by its caller.
#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// A successful agent invocation: the node's output plus the memory state
/// to thread onward.
#[derive(Debug)]
pub struct AgentSuccess {
    pub output: String,
    pub memory_after: std::collections::HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_host_round_trip() {
        let (tx, mut rx) = mpsc::channel::<ChildCall>(1);

        let worker = tokio::task::spawn_blocking(move || {
            let mut host = ChannelHost::new(tx);
            host.llm_query("ping".to_string())
        });

        let call = rx.recv().await.unwrap();
        assert_eq!(call.prompt, "ping");
        call.reply.send(Ok("pong".to_string())).unwrap();

        let result = worker.await.unwrap();
        assert_eq!(result.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_channel_host_error_reply() {
        let (tx, mut rx) = mpsc::channel::<ChildCall>(1);

        let worker = tokio::task::spawn_blocking(move || {
            let mut host = ChannelHost::new(tx);
            host.llm_query("ping".to_string())
        });

        let call = rx.recv().await.unwrap();
        call.reply
            .send(Err(HostError {
                kind: ErrorKind::RecursionLimit,
                message: "too deep".into(),
            }))
            .unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursionLimit);
    }

    #[tokio::test]
    async fn test_channel_host_dropped_orchestrator() {
        let (tx, rx) = mpsc::channel::<ChildCall>(1);
        drop(rx);

        let worker = tokio::task::spawn_blocking(move || {
            let mut host = ChannelHost::new(tx);
            host.llm_query("ping".to_string())
        });

        let err = worker.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    }
}
