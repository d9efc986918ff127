//! Engine events and the per-execution streaming bus.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Bounded per-execution buffer; slow subscribers drop the oldest events
/// rather than blocking producers.
pub const EVENT_BUFFER: usize = 256;

const PROMPT_PREVIEW_CHARS: usize = 200;
const OUTPUT_PREVIEW_CHARS: usize = 500;

/// Progress event for one execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        execution_id: String,
        timestamp: DateTime<Utc>,
        query: String,
        context_size: usize,
        model: String,
    },
    NodeStarted {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
        parent_id: Option<String>,
        depth: usize,
        sequence: usize,
        node_type: crate::domain::NodeType,
        prompt_preview: String,
    },
    NodeCode {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
        code: String,
    },
    NodeOutput {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
        output_preview: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    NodeFailed {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
        error_kind: ErrorKind,
        error_message: String,
    },
    ExecutionCompleted {
        execution_id: String,
        timestamp: DateTime<Utc>,
        final_result_preview: String,
        total_input_tokens: u64,
        total_output_tokens: u64,
        total_cost_usd: f64,
    },
    ExecutionFailed {
        execution_id: String,
        timestamp: DateTime<Utc>,
        error_kind: ErrorKind,
        error_message: String,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::NodeStarted { execution_id, .. }
            | EngineEvent::NodeCode { execution_id, .. }
            | EngineEvent::NodeOutput { execution_id, .. }
            | EngineEvent::NodeFailed { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. } => execution_id,
        }
    }
}

/// Truncate to a character budget for event previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

pub fn prompt_preview(text: &str) -> String {
    preview(text, PROMPT_PREVIEW_CHARS)
}

pub fn output_preview(text: &str) -> String {
    preview(text, OUTPUT_PREVIEW_CHARS)
}

struct ExecutionChannel {
    tx: broadcast::Sender<EngineEvent>,
    log: Vec<EngineEvent>,
}

/// Many-producer, many-consumer event bus with one channel per execution.
///
/// The bus retains the full event log, so late subscribers receive a
/// snapshot of everything published so far followed by live events.
pub struct EventBus {
    channels: RwLock<HashMap<String, ExecutionChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for an execution. Idempotent.
    pub fn register(&self, execution_id: &str) {
        let mut channels = self.channels.write();
        channels.entry(execution_id.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(EVENT_BUFFER);
            ExecutionChannel {
                tx,
                log: Vec::new(),
            }
        });
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(event.execution_id().to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(EVENT_BUFFER);
                ExecutionChannel {
                    tx,
                    log: Vec::new(),
                }
            });
        channel.log.push(event.clone());
        // No receivers is fine; the log still records the event.
        let _ = channel.tx.send(event);
    }

    /// Snapshot of events published so far plus a live receiver.
    pub fn subscribe(&self, execution_id: &str) -> (Vec<EngineEvent>, broadcast::Receiver<EngineEvent>) {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(execution_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(EVENT_BUFFER);
                ExecutionChannel {
                    tx,
                    log: Vec::new(),
                }
            });
        (channel.log.clone(), channel.tx.subscribe())
    }

    /// The retained event log for an execution.
    pub fn events(&self, execution_id: &str) -> Vec<EngineEvent> {
        self.channels
            .read()
            .get(execution_id)
            .map(|c| c.log.clone())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
