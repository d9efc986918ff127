//! Top-level orchestrator: entry validation, the recursive agent loop, and
//! terminal bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::agent::{AgentFailure, AgentSuccess, ChannelHost, ChildCall};
use super::prompts;
use super::trace::ExecutionTrace;
use crate::config::EngineConfig;
use crate::domain::{ContextMetadata, Execution, ExecutionStatus, NodeStatus};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::{output_preview, prompt_preview, EngineEvent, EventBus};
use crate::llm::{
    call_with_retry, CompletionRequest, LlmError, PricingTable, ProviderRegistry, RetryPolicy,
};
use crate::repository::{ExecutionRepository, SessionRepository};
use crate::sandbox::{self, HostError, Outcome};

/// Input to one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub user_query: String,
    pub context: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// Caller-chosen execution id, generated when absent. Lets callers
    /// subscribe to the event stream before the run begins.
    pub execution_id: Option<String>,
}

/// Per-execution immutable state threaded through the recursion.
struct RunScope {
    trace: Arc<ExecutionTrace>,
    context: Arc<String>,
    context_meta: ContextMetadata,
    model: String,
    deadline: Instant,
}

pub struct Orchestrator {
    config: EngineConfig,
    providers: Arc<ProviderRegistry>,
    pricing: PricingTable,
    retry: RetryPolicy,
    bus: Arc<EventBus>,
    executions: Arc<dyn ExecutionRepository>,
    sessions: Arc<dyn SessionRepository>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        providers: Arc<ProviderRegistry>,
        executions: Arc<dyn ExecutionRepository>,
        sessions: Arc<dyn SessionRepository>,
    ) -> Self {
        let retry = RetryPolicy::with_max_attempts(config.llm_max_attempts);
        Self {
            config,
            providers,
            pricing: PricingTable::builtin(),
            retry,
            bus: Arc::new(EventBus::new()),
            executions,
            sessions,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one execution to a terminal status.
    ///
    /// Entry rejections (oversized context, unknown session) return `Err`
    /// without creating any records; failures during the run return the
    /// failed execution record.
    pub async fn run(&self, request: ExecuteRequest) -> EngineResult<Execution> {
        let session = match &request.session_id {
            Some(id) => Some(
                self.sessions
                    .get(id)
                    .await
                    .map_err(|e| EngineError::Storage(e.to_string()))?
                    .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?,
            ),
            None => None,
        };

        let context = request
            .context
            .or_else(|| session.as_ref().and_then(|s| s.context.clone()))
            .unwrap_or_default();
        let context_size = context.chars().count();
        if context_size > self.config.max_context_size {
            return Err(EngineError::ContextTooLarge {
                size: context_size,
                limit: self.config.max_context_size,
            });
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        self.providers
            .get_for_model(&model)
            .map_err(|_| EngineError::NoProvider(model.clone()))?;

        let memory: HashMap<String, Value> = session
            .as_ref()
            .map(|s| s.memory.clone())
            .unwrap_or_default();

        let context_meta = ContextMetadata::of(&context);
        let mut execution = Execution::new(
            request.user_query.clone(),
            context_size,
            request.session_id.clone(),
        );
        if let Some(id) = &request.execution_id {
            execution.id = id.clone();
        }
        execution.context_hash = Some(context_meta.sha256.clone());
        execution.status = ExecutionStatus::Running;
        self.executions
            .insert_execution(&execution)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        self.bus.register(&execution.id);
        self.bus.publish(EngineEvent::ExecutionStarted {
            execution_id: execution.id.clone(),
            timestamp: Utc::now(),
            query: request.user_query.clone(),
            context_size,
            model: model.clone(),
        });

        let scope = RunScope {
            trace: Arc::new(ExecutionTrace::new(execution)),
            context: Arc::new(context),
            context_meta,
            model,
            deadline: Instant::now() + self.config.execution_timeout,
        };

        let result = self
            .run_agent(&scope, request.user_query.clone(), 0, None, memory)
            .await;

        let execution = match result {
            Ok(success) => {
                let execution = scope.trace.complete(success.output.clone());
                if let Some(session_id) = &request.session_id {
                    if let Err(e) = self
                        .sessions
                        .merge_memory(session_id, success.memory_after)
                        .await
                    {
                        tracing::warn!("failed to merge session memory: {}", e);
                    }
                }
                self.bus.publish(EngineEvent::ExecutionCompleted {
                    execution_id: execution.id.clone(),
                    timestamp: Utc::now(),
                    final_result_preview: output_preview(&success.output),
                    total_input_tokens: execution.total_input_tokens,
                    total_output_tokens: execution.total_output_tokens,
                    total_cost_usd: execution.total_cost_usd,
                });
                execution
            }
            Err(failure) => {
                for node in scope.trace.fail_running(failure.kind, &failure.message) {
                    self.persist_node(&node).await;
                }
                let execution = scope.trace.fail(failure.kind, failure.message.clone());
                self.bus.publish(EngineEvent::ExecutionFailed {
                    execution_id: execution.id.clone(),
                    timestamp: Utc::now(),
                    error_kind: failure.kind,
                    error_message: failure.message,
                });
                execution
            }
        };

        if let Err(e) = self.executions.update_execution(&execution).await {
            tracing::warn!("failed to persist execution {}: {}", execution.id, e);
        }
        Ok(execution)
    }

    /// One agent invocation. Depth 0 and oversized child prompts generate
    /// and execute a program; other children are leaf completions whose LM
    /// response text is the output.
    fn run_agent<'a>(
        &'a self,
        scope: &'a RunScope,
        query: String,
        depth: usize,
        parent_node_id: Option<String>,
        memory: HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<AgentSuccess, AgentFailure>> {
        async move {
            let programmatic =
                depth == 0 || query.chars().count() > self.config.recursion_threshold;

            let node = scope.trace.create_node(
                parent_node_id,
                depth,
                query.clone(),
                scope.model.clone(),
                memory.clone(),
            );
            let node_id = node.id.clone();
            self.bus.publish(EngineEvent::NodeStarted {
                execution_id: node.execution_id.clone(),
                node_id: node_id.clone(),
                timestamp: Utc::now(),
                parent_id: node.parent_node_id.clone(),
                depth,
                sequence: node.sequence_number,
                node_type: node.node_type,
                prompt_preview: prompt_preview(&query),
            });
            self.persist_node(&node).await;

            // A recursive sub-agent operates on the prompt that spawned it:
            // the prompt becomes the node's context and the code-generation
            // query is a fixed instruction.
            let (node_context, messages) = if !programmatic {
                (scope.context.clone(), prompts::child_messages(&query))
            } else if depth == 0 {
                (
                    scope.context.clone(),
                    prompts::code_messages(
                        &query,
                        &scope.context_meta,
                        &memory,
                        self.config.default_chunk_size,
                    ),
                )
            } else {
                let meta = ContextMetadata::of(&query);
                (
                    Arc::new(query.clone()),
                    prompts::code_messages(
                        prompts::SUBAGENT_QUERY,
                        &meta,
                        &memory,
                        self.config.default_chunk_size,
                    ),
                )
            };

            let response = match self.complete_within_deadline(scope, depth, messages).await {
                Ok(response) => response,
                Err(failure) => {
                    return Err(self.fail_node(scope, &node_id, &memory, failure).await);
                }
            };

            let cost = self.cost_of(&scope.model, response.input_tokens, response.output_tokens);
            scope
                .trace
                .record_usage(&node_id, response.input_tokens, response.output_tokens, cost.0);
            if let Some(warning) = cost.1 {
                scope.trace.update_node(&node_id, |n| {
                    n.error_message = Some(warning);
                });
            }

            if !programmatic {
                let output = response.content;
                let updated = scope.trace.update_node(&node_id, |n| {
                    n.status = NodeStatus::Completed;
                    n.output = Some(output.clone());
                    n.memory_after = Some(memory.clone());
                    n.completed_at = Some(Utc::now());
                });
                self.bus.publish(EngineEvent::NodeOutput {
                    execution_id: scope.trace.execution_id(),
                    node_id: node_id.clone(),
                    timestamp: Utc::now(),
                    output_preview: output_preview(&output),
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    cost_usd: cost.0,
                });
                if let Some(updated) = updated {
                    self.persist_node(&updated).await;
                }
                return Ok(AgentSuccess {
                    output,
                    memory_after: memory,
                });
            }

            let code = prompts::extract_program(&response.content);
            let updated = scope.trace.update_node(&node_id, |n| {
                n.generated_code = Some(code.clone());
            });
            self.bus.publish(EngineEvent::NodeCode {
                execution_id: scope.trace.execution_id(),
                node_id: node_id.clone(),
                timestamp: Utc::now(),
                code: code.clone(),
            });
            if let Some(updated) = updated {
                self.persist_node(&updated).await;
            }

            let run = self
                .execute_program(scope, &node_id, depth, code, memory.clone(), node_context)
                .await;

            match run.outcome {
                Outcome::Final(output) => {
                    let updated = scope.trace.update_node(&node_id, |n| {
                        n.status = NodeStatus::Completed;
                        n.output = Some(output.clone());
                        n.memory_after = Some(run.memory_after.clone());
                        n.completed_at = Some(Utc::now());
                    });
                    self.bus.publish(EngineEvent::NodeOutput {
                        execution_id: scope.trace.execution_id(),
                        node_id: node_id.clone(),
                        timestamp: Utc::now(),
                        output_preview: output_preview(&output),
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                        cost_usd: cost.0,
                    });
                    if let Some(updated) = updated {
                        self.persist_node(&updated).await;
                    }
                    Ok(AgentSuccess {
                        output,
                        memory_after: run.memory_after,
                    })
                }
                Outcome::NoFinal => {
                    let failure = AgentFailure {
                        kind: ErrorKind::NoFinal,
                        message: "program terminated without FINAL".to_string(),
                    };
                    Err(self.fail_node(scope, &node_id, &memory, failure).await)
                }
                Outcome::Error { kind, message } => {
                    // A child that timed out surfaces here as DeadlineExceeded;
                    // this node failed, the child carries the timeout status.
                    let failure = AgentFailure { kind, message };
                    Err(self
                        .fail_node_with_status(scope, &node_id, &memory, failure, NodeStatus::Failed)
                        .await)
                }
                Outcome::Timeout => {
                    let failure = AgentFailure {
                        kind: ErrorKind::DeadlineExceeded,
                        message: "execution deadline expired while running the program"
                            .to_string(),
                    };
                    Err(self
                        .fail_node_with_status(scope, &node_id, &memory, failure, NodeStatus::Timeout)
                        .await)
                }
            }
        }
        .boxed()
    }

    /// Run the program on a blocking worker, servicing its `llm_query`
    /// requests with nested agent invocations until it finishes. `context`
    /// is the node's own context: the root's for depth 0, the triggering
    /// prompt for a recursive sub-agent.
    async fn execute_program(
        &self,
        scope: &RunScope,
        node_id: &str,
        depth: usize,
        code: String,
        memory: HashMap<String, Value>,
        context: Arc<String>,
    ) -> sandbox::RunResult {
        let (tx, mut rx) = mpsc::channel::<ChildCall>(1);
        let deadline = scope.deadline;
        let child_memory = memory.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let mut host = ChannelHost::new(tx);
            sandbox::run_program(&code, &context, &memory, &mut host, deadline)
        });

        while let Some(call) = rx.recv().await {
            let reply = self
                .service_child_call(scope, depth, node_id, call.prompt, child_memory.clone())
                .await;
            // The worker may have been torn down by its own deadline poll.
            let _ = call.reply.send(reply);
        }

        match worker.await {
            Ok(result) => result,
            Err(e) => sandbox::RunResult {
                outcome: Outcome::Error {
                    kind: ErrorKind::ProgramRuntimeError,
                    message: format!("sandbox worker panicked: {}", e),
                },
                memory_after: HashMap::new(),
            },
        }
    }

    /// Enforce the recursion and deadline guards, then run the nested agent
    /// loop for one `llm_query` call.
    async fn service_child_call(
        &self,
        scope: &RunScope,
        parent_depth: usize,
        parent_node_id: &str,
        prompt: String,
        memory: HashMap<String, Value>,
    ) -> Result<String, HostError> {
        let child_depth = parent_depth + 1;
        if child_depth > self.config.max_recursion_depth {
            return Err(HostError {
                kind: ErrorKind::RecursionLimit,
                message: format!(
                    "llm_query would exceed the maximum recursion depth of {}",
                    self.config.max_recursion_depth
                ),
            });
        }
        if Instant::now() >= scope.deadline {
            return Err(HostError {
                kind: ErrorKind::DeadlineExceeded,
                message: "execution deadline expired".to_string(),
            });
        }

        match self
            .run_agent(
                scope,
                prompt,
                child_depth,
                Some(parent_node_id.to_string()),
                memory,
            )
            .await
        {
            Ok(success) => Ok(success.output),
            Err(failure) => Err(HostError {
                kind: failure.kind,
                message: failure.message,
            }),
        }
    }

    /// One LM call bounded by `min(remaining deadline, per-call cap)` with
    /// transient-error retries inside.
    async fn complete_within_deadline(
        &self,
        scope: &RunScope,
        depth: usize,
        messages: Vec<crate::llm::ChatMessage>,
    ) -> Result<crate::llm::types::CompletionResponse, AgentFailure> {
        let remaining = scope.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AgentFailure {
                kind: ErrorKind::DeadlineExceeded,
                message: "execution deadline expired".to_string(),
            });
        }
        let call_cap = if depth == 0 {
            remaining
        } else {
            remaining.min(self.config.child_call_timeout)
        };

        let provider = self.providers.get_for_model(&scope.model).map_err(|e| {
            AgentFailure {
                kind: ErrorKind::ProviderError,
                message: e.to_string(),
            }
        })?;
        let request = CompletionRequest {
            model: scope.model.clone(),
            messages,
            temperature: None,
            max_tokens: None,
        };

        let call = call_with_retry(&self.retry, || {
            let provider = provider.clone();
            let request = request.clone();
            async move { provider.complete(request).await }
        });
        match tokio::time::timeout(call_cap, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(AgentFailure {
                kind: provider_error_kind(&e),
                message: e.to_string(),
            }),
            Err(_) => Err(AgentFailure {
                kind: ErrorKind::DeadlineExceeded,
                message: "LM call exceeded its deadline".to_string(),
            }),
        }
    }

    async fn fail_node(
        &self,
        scope: &RunScope,
        node_id: &str,
        memory: &HashMap<String, Value>,
        failure: AgentFailure,
    ) -> AgentFailure {
        let status = if failure.kind == ErrorKind::DeadlineExceeded {
            NodeStatus::Timeout
        } else {
            NodeStatus::Failed
        };
        self.fail_node_with_status(scope, node_id, memory, failure, status)
            .await
    }

    async fn fail_node_with_status(
        &self,
        scope: &RunScope,
        node_id: &str,
        memory: &HashMap<String, Value>,
        failure: AgentFailure,
        status: NodeStatus,
    ) -> AgentFailure {
        let updated = scope.trace.update_node(node_id, |n| {
            n.status = status;
            n.error_kind = Some(failure.kind);
            n.error_message = Some(failure.message.clone());
            n.memory_after = Some(memory.clone());
            n.completed_at = Some(Utc::now());
        });
        self.bus.publish(EngineEvent::NodeFailed {
            execution_id: scope.trace.execution_id(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            error_kind: failure.kind,
            error_message: failure.message.clone(),
        });
        if let Some(updated) = updated {
            self.persist_node(&updated).await;
        }
        failure
    }

    fn cost_of(&self, model: &str, input_tokens: u64, output_tokens: u64) -> (f64, Option<String>) {
        match self.pricing.cost(model, input_tokens, output_tokens) {
            Some(cost) => (cost, None),
            None => {
                tracing::warn!("no pricing entry for model {}, recording zero cost", model);
                (
                    0.0,
                    Some(format!("warning: unknown model '{}' in pricing table", model)),
                )
            }
        }
    }

    /// Best-effort write-through; storage problems never fail the run.
    async fn persist_node(&self, node: &crate::domain::ExecutionNode) {
        if let Err(e) = self.executions.upsert_node(node).await {
            tracing::warn!("failed to persist node {}: {}", node.id, e);
        }
    }

    /// The live trace nodes for an execution (used by the API facade while
    /// an execution is running).
    pub async fn get_execution(&self, id: &str) -> EngineResult<Execution> {
        self.executions
            .get_execution(id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }
}

fn provider_error_kind(e: &LlmError) -> ErrorKind {
    match e {
        LlmError::Timeout => ErrorKind::DeadlineExceeded,
        _ => ErrorKind::ProviderError,
    }
}
