//! End-to-end engine tests driven by scripted providers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rlm_engine::llm::types::{CompletionRequest, CompletionResponse};
use rlm_engine::llm::{LlmError, LmProvider, ProviderRegistry};
use rlm_engine::{
    EngineConfig, EngineError, EngineEvent, EngineRunner, ErrorKind, ExecuteRequest,
    ExecutionStatus, NodeStatus, NodeType,
};

/// Provider that replies from a scripted queue, with optional per-call
/// latency. Falls back to a fixed answer when the queue runs dry.
struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            fallback: "fallback answer".to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn handles(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "gpt-4o"
    }

    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().pop_front();
        let content = match next {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => self.fallback.clone(),
        };
        Ok(CompletionResponse {
            content,
            model: "gpt-4o".into(),
            input_tokens: 10,
            output_tokens: 20,
        })
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        execution_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    }
}

fn runner_with(provider: ScriptedProvider, config: EngineConfig) -> (EngineRunner, Arc<ScriptedProvider>) {
    let provider = Arc::new(provider);
    let mut registry = ProviderRegistry::new();
    registry.register(provider.clone());
    let runner = EngineRunner::builder()
        .config(config)
        .providers(Arc::new(registry))
        .build();
    (runner, provider)
}

fn request(query: &str, context: &str) -> ExecuteRequest {
    ExecuteRequest {
        user_query: query.into(),
        context: Some(context.into()),
        model: Some("gpt-4o".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_trivial_final() {
    let (runner, provider) = runner_with(
        ScriptedProvider::new(vec![Ok("```\nFINAL(context)\n```".into())]),
        fast_config(),
    );

    let execution = runner
        .execute_and_wait(request("echo", "abc"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.final_result.as_deref(), Some("abc"));
    assert_eq!(provider.calls(), 1);
    assert_eq!(execution.total_input_tokens, 10);
    assert_eq!(execution.total_output_tokens, 20);
    // gpt-4o: $5/M input, $15/M output.
    let expected_cost = 10.0 * 5.0 / 1e6 + 20.0 * 15.0 / 1e6;
    assert!((execution.total_cost_usd - expected_cost).abs() < 1e-12);

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_type, NodeType::Root);
    assert_eq!(nodes[0].status, NodeStatus::Completed);
    assert_eq!(nodes[0].output.as_deref(), Some("abc"));
    assert_eq!(nodes[0].generated_code.as_deref(), Some("FINAL(context)"));
}

#[tokio::test]
async fn test_chunked_map_reduce() {
    let program = r#"```
chunk_size = 50000
results = []
for i in range(0, len(context), chunk_size):
    chunk = context[i:i + chunk_size]
    results.append(llm_query(f"Summarize:\n{chunk}"))
FINAL("\n---\n".join(results))
```"#;
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![
            Ok(program.into()),
            Ok("S1".into()),
            Ok("S2".into()),
            Ok("S3".into()),
        ]),
        fast_config(),
    );

    let context = "x".repeat(120_000);
    let execution = runner
        .execute_and_wait(request("summarize", &context))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.final_result.as_deref(),
        Some("S1\n---\nS2\n---\nS3")
    );

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes.len(), 4);
    let root = nodes.iter().find(|n| n.parent_node_id.is_none()).unwrap();
    let mut children: Vec<_> = nodes
        .iter()
        .filter(|n| n.parent_node_id.as_deref() == Some(root.id.as_str()))
        .collect();
    children.sort_by_key(|n| n.sequence_number);
    assert_eq!(children.len(), 3);
    let sequences: Vec<usize> = children.iter().map(|n| n.sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert!(children.iter().all(|n| n.depth == 1));
    assert_eq!(children[0].output.as_deref(), Some("S1"));
    assert_eq!(children[2].output.as_deref(), Some("S3"));

    // Child prompts carry the chunk sizes of 50k/50k/20k plus the task text.
    assert!(children[0].prompt.len() > 50_000);
    assert!(children[2].prompt.len() < 30_000);
}

#[tokio::test]
async fn test_execution_invariants_and_totals() {
    let program = r#"```
a = llm_query("first question")
b = llm_query("second question")
FINAL(a + " " + b)
```"#;
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok(program.into()), Ok("A".into()), Ok("B".into())]),
        fast_config(),
    );

    let execution = runner
        .execute_and_wait(request("q", "ctx"))
        .await
        .unwrap();
    let nodes = runner.get_nodes(&execution.id).await.unwrap();

    // Exactly one root; every other node's parent exists in the set.
    let roots: Vec<_> = nodes.iter().filter(|n| n.parent_node_id.is_none()).collect();
    assert_eq!(roots.len(), 1);
    for node in &nodes {
        if let Some(parent_id) = &node.parent_node_id {
            let parent = nodes.iter().find(|p| &p.id == parent_id).unwrap();
            assert_eq!(node.depth, parent.depth + 1);
            assert_eq!(node.execution_id, parent.execution_id);
        } else {
            assert_eq!(node.depth, 0);
        }
    }

    // Totals equal the sum over nodes.
    assert_eq!(
        execution.total_input_tokens,
        nodes.iter().map(|n| n.input_tokens).sum::<u64>()
    );
    assert_eq!(
        execution.total_output_tokens,
        nodes.iter().map(|n| n.output_tokens).sum::<u64>()
    );
    let cost_sum: f64 = nodes.iter().map(|n| n.cost_usd).sum();
    assert!((execution.total_cost_usd - cost_sum).abs() < 1e-12);

    // Sibling sequences are 0..k-1 without gaps.
    let root_id = &roots[0].id;
    let mut sequences: Vec<usize> = nodes
        .iter()
        .filter(|n| n.parent_node_id.as_deref() == Some(root_id.as_str()))
        .map(|n| n.sequence_number)
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1]);

    // Completed execution: final result equals the root output.
    assert_eq!(execution.final_result, roots[0].output);
}

#[tokio::test]
async fn test_recursion_cap_rejects_llm_query() {
    let program = "```\nFINAL(llm_query(\"anything\"))\n```";
    let config = EngineConfig {
        max_recursion_depth: 0,
        ..fast_config()
    };
    let (runner, provider) = runner_with(ScriptedProvider::new(vec![Ok(program.into())]), config);

    let execution = runner
        .execute_and_wait(request("q", "ctx"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::RecursionLimit));
    // Only the root LM call happened; the child was rejected before a node
    // or an LM call was made.
    assert_eq!(provider.calls(), 1);
    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes.len(), 1);
}

#[tokio::test]
async fn test_nested_recursion_within_cap_succeeds() {
    // Child prompts over the recursion threshold become recursive
    // sub-agents that generate their own programs, with the triggering
    // prompt as their context.
    let config = EngineConfig {
        recursion_threshold: 10,
        max_recursion_depth: 2,
        ..fast_config()
    };
    let root_program = "```\nFINAL(llm_query(\"please summarize this long text\"))\n```";
    let child_program = "```\nFINAL(llm_query(\"hi\") + \" / \" + context)\n```";
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![
            Ok(root_program.into()),
            Ok(child_program.into()),
            Ok("leaf answer".into()),
        ]),
        config,
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    // The depth-1 program's `context` is the llm_query prompt, not the
    // root's context.
    assert_eq!(
        execution.final_result.as_deref(),
        Some("leaf answer / please summarize this long text")
    );

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes.len(), 3);
    let mut depths: Vec<usize> = nodes.iter().map(|n| n.depth).collect();
    depths.sort_unstable();
    assert_eq!(depths, vec![0, 1, 2]);
    // The depth-1 node ran its own program.
    let middle = nodes.iter().find(|n| n.depth == 1).unwrap();
    assert!(middle.generated_code.is_some());
    assert_eq!(middle.prompt, "please summarize this long text");
}

#[tokio::test]
async fn test_nested_recursion_one_deeper_fails() {
    let config = EngineConfig {
        recursion_threshold: 10,
        max_recursion_depth: 2,
        ..fast_config()
    };
    let root_program = "```\nFINAL(llm_query(\"please summarize this long text\"))\n```";
    let depth1_program = "```\nFINAL(llm_query(\"another prompt that is long\"))\n```";
    let depth2_program = "```\nFINAL(llm_query(\"x\"))\n```";
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![
            Ok(root_program.into()),
            Ok(depth1_program.into()),
            Ok(depth2_program.into()),
        ]),
        config,
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::RecursionLimit));
}

#[tokio::test]
async fn test_sandbox_violation_import_os() {
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok("```\nimport os; FINAL(os.getcwd())\n```".into())]),
        fast_config(),
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::SandboxViolation));
    assert!(execution.error_message.unwrap().contains("os"));

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes[0].status, NodeStatus::Failed);
    assert_eq!(nodes[0].error_kind, Some(ErrorKind::SandboxViolation));
}

#[tokio::test]
async fn test_provider_outage_after_retries() {
    let unavailable = || {
        Err(LlmError::ApiError {
            status: 503,
            message: "service unavailable".into(),
        })
    };
    let (runner, provider) = runner_with(
        ScriptedProvider::new(vec![unavailable(), unavailable(), unavailable()]),
        fast_config(),
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::ProviderError));
    assert_eq!(provider.calls(), 3);

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].status, NodeStatus::Failed);
    assert_eq!(nodes[0].error_kind, Some(ErrorKind::ProviderError));
}

#[tokio::test]
async fn test_no_final() {
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok("```\nx = 1 + 1\n```".into())]),
        fast_config(),
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::NoFinal));
    assert!(execution
        .error_message
        .unwrap()
        .contains("terminated without FINAL"));
}

#[tokio::test]
async fn test_deadline_expiry_marks_timeout_chain() {
    let program = r#"```
for i in range(1000):
    x = llm_query("slow question")
FINAL(x)
```"#;
    let config = EngineConfig {
        execution_timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    };
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok(program.into())]).with_delay(Duration::from_millis(200)),
        config,
    );

    let execution = runner.execute_and_wait(request("q", "ctx")).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_kind, Some(ErrorKind::DeadlineExceeded));

    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    // At least one child ran into the deadline.
    assert!(nodes
        .iter()
        .any(|n| matches!(n.status, NodeStatus::Timeout | NodeStatus::Failed)));
    // Totals reflect only LM calls that completed; usage is recorded when a
    // call returns, so the sums still agree with the node records.
    assert_eq!(
        execution.total_input_tokens,
        nodes.iter().map(|n| n.input_tokens).sum::<u64>()
    );
}

#[tokio::test]
async fn test_context_size_boundary() {
    let config = EngineConfig {
        max_context_size: 100,
        ..fast_config()
    };
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![
            Ok("```\nFINAL(len(context))\n```".into()),
        ]),
        config,
    );

    // Exactly at the limit: accepted.
    let at_limit = "x".repeat(100);
    let execution = runner
        .execute_and_wait(request("q", &at_limit))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.final_result.as_deref(), Some("100"));

    // One more character: rejected at entry, no records created.
    let over_limit = "x".repeat(101);
    let err = runner
        .execute_and_wait(request("q", &over_limit))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ContextTooLarge { size: 101, limit: 100 }));
}

#[tokio::test]
async fn test_unknown_model_cost_warning() {
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok("```\nFINAL(context)\n```".into())]),
        fast_config(),
    );

    let execution = runner
        .execute_and_wait(ExecuteRequest {
            user_query: "q".into(),
            context: Some("ctx".into()),
            model: Some("mystery-model".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.total_cost_usd, 0.0);
    let nodes = runner.get_nodes(&execution.id).await.unwrap();
    assert!(nodes[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("mystery-model"));
}

#[tokio::test]
async fn test_session_memory_round_trip() {
    let program = r#"```
count = memory.get("count", 0)
memory["count"] = count + 1
FINAL(memory["count"])
```"#;
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok(program.into()), Ok(program.into())]),
        fast_config(),
    );

    let session = runner
        .create_session("notes".into(), Some("the document".into()))
        .await
        .unwrap();

    let count_request = || ExecuteRequest {
        user_query: "count runs".into(),
        session_id: Some(session.id.clone()),
        model: Some("gpt-4o".into()),
        ..Default::default()
    };

    let first = runner.execute_and_wait(count_request()).await.unwrap();
    assert_eq!(first.final_result.as_deref(), Some("1"));

    let second = runner.execute_and_wait(count_request()).await.unwrap();
    assert_eq!(second.final_result.as_deref(), Some("2"));

    let memory = runner.get_memory(&session.id).await.unwrap();
    assert_eq!(memory.get("count"), Some(&serde_json::json!(2)));

    // Nodes carry before/after snapshots.
    let nodes = runner.get_nodes(&second.id).await.unwrap();
    let root = &nodes[0];
    assert_eq!(
        root.memory_before.as_ref().unwrap().get("count"),
        Some(&serde_json::json!(1))
    );
    assert_eq!(
        root.memory_after.as_ref().unwrap().get("count"),
        Some(&serde_json::json!(2))
    );
}

#[tokio::test]
async fn test_event_stream_replay_matches_tree() {
    let program = r#"```
a = llm_query("one")
b = llm_query("two")
FINAL(a + b)
```"#;
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok(program.into()), Ok("1".into()), Ok("2".into())]),
        fast_config(),
    );

    let handle = runner.execute(request("q", "ctx"));
    let (snapshot, mut rx) = handle.subscribe();

    let is_terminal = |event: &EngineEvent| {
        matches!(
            event,
            EngineEvent::ExecutionCompleted { .. } | EngineEvent::ExecutionFailed { .. }
        )
    };
    let mut events = snapshot;
    while !events.iter().any(is_terminal) {
        match rx.recv().await {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }

    // Replay: rebuild parent/child relations from node_started events.
    let mut replayed: Vec<(String, Option<String>, usize)> = Vec::new();
    for event in &events {
        if let EngineEvent::NodeStarted {
            node_id,
            parent_id,
            sequence,
            ..
        } = event
        {
            replayed.push((node_id.clone(), parent_id.clone(), *sequence));
        }
    }

    let execution_id = handle.execution_id().to_string();
    let tree = runner.get_tree(&execution_id).await.unwrap();
    assert_eq!(replayed.len(), 3);
    assert_eq!(tree.node.id, replayed[0].0);
    let replayed_children: Vec<&String> = replayed
        .iter()
        .filter(|(_, parent, _)| parent.as_deref() == Some(tree.node.id.as_str()))
        .map(|(id, _, _)| id)
        .collect();
    let tree_children: Vec<&String> = tree.children.iter().map(|c| &c.node.id).collect();
    assert_eq!(replayed_children, tree_children);

    // The stream carried the generated program and the terminal event.
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::NodeCode { code, .. } if code.contains("llm_query"))));
    assert!(matches!(
        events.last().unwrap(),
        EngineEvent::ExecutionCompleted { .. }
    ));
}

#[tokio::test]
async fn test_handle_status_transitions() {
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![Ok("```\nFINAL(\"done\")\n```".into())]),
        fast_config(),
    );

    let handle = runner.execute(request("q", "ctx"));
    let status = handle.wait().await;
    match status {
        rlm_engine::RunStatus::Finished(execution) => {
            assert_eq!(execution.status, ExecutionStatus::Completed);
            assert_eq!(execution.final_result.as_deref(), Some("done"));
        }
        other => panic!("expected finished, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_executions_are_isolated() {
    let (runner, _provider) = runner_with(
        ScriptedProvider::new(vec![
            Ok("```\nFINAL(context)\n```".into()),
            Ok("```\nFINAL(context)\n```".into()),
        ]),
        fast_config(),
    );

    let first = runner.execute(request("q1", "aaa"));
    let second = runner.execute(request("q2", "bbb"));

    let (first_status, second_status) = tokio::join!(first.wait(), second.wait());
    let results: Vec<String> = [first_status, second_status]
        .into_iter()
        .map(|status| match status {
            rlm_engine::RunStatus::Finished(e) => e.final_result.unwrap(),
            other => panic!("expected finished, got {:?}", other),
        })
        .collect();
    let mut sorted = results.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["aaa", "bbb"]);
}
