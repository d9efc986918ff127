use std::sync::Arc;

use async_trait::async_trait;

use rlm_engine::llm::types::{CompletionRequest, CompletionResponse};
use rlm_engine::llm::{LlmError, LmProvider, ProviderRegistry};
use rlm_engine::{EngineEvent, EngineRunner, ExecuteRequest, RunStatus};

/// Scripted provider so the demo runs without network access: the first
/// call returns a chunking program, later calls answer the chunk prompts.
struct DemoProvider {
    calls: std::sync::Mutex<usize>,
}

#[async_trait]
impl LmProvider for DemoProvider {
    fn id(&self) -> &str {
        "demo"
    }

    fn handles(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "demo-model"
    }

    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        let content = if *calls == 1 {
            r#"```
chunk_size = 40
notes = []
for i in range(0, len(context), chunk_size):
    chunk = context[i:i + chunk_size]
    notes.append(llm_query(f"Summarize this piece:\n{chunk}"))
FINAL("\n---\n".join(notes))
```"#
                .to_string()
        } else {
            format!("summary #{}", *calls - 1)
        };
        Ok(CompletionResponse {
            content,
            model: "demo-model".into(),
            input_tokens: 25,
            output_tokens: 40,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== RLM Engine ===\n");

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(DemoProvider {
        calls: std::sync::Mutex::new(0),
    }));

    let runner = EngineRunner::builder()
        .providers(Arc::new(providers))
        .build();

    let context = "The quick brown fox jumps over the lazy dog. \
                   Pack my box with five dozen liquor jugs. \
                   Sphinx of black quartz, judge my vow."
        .to_string();

    let handle = runner.execute(ExecuteRequest {
        user_query: "Summarize this document".into(),
        context: Some(context),
        model: Some("demo-model".into()),
        ..Default::default()
    });

    let (snapshot, mut rx) = handle.subscribe();
    let printer = tokio::spawn(async move {
        let is_terminal = |event: &EngineEvent| {
            matches!(
                event,
                EngineEvent::ExecutionCompleted { .. } | EngineEvent::ExecutionFailed { .. }
            )
        };
        let mut done = false;
        for event in snapshot {
            done = done || is_terminal(&event);
            print_event(&event);
        }
        while !done {
            match rx.recv().await {
                Ok(event) => {
                    done = is_terminal(&event);
                    print_event(&event);
                }
                Err(_) => break,
            }
        }
    });

    let status = handle.wait().await;
    let _ = printer.await;

    match status {
        RunStatus::Finished(execution) => {
            println!("\n=== Execution {} ===", execution.id);
            println!("status: {:?}", execution.status);
            println!(
                "tokens: {} in / {} out, cost ${:.6}",
                execution.total_input_tokens, execution.total_output_tokens,
                execution.total_cost_usd
            );
            if let Some(result) = &execution.final_result {
                println!("final result:\n{}", result);
            }
            if let Some(error) = &execution.error_message {
                println!("error: {}", error);
            }

            if let Ok(tree) = runner.get_tree(&execution.id).await {
                println!("\ntree:");
                print_tree(&tree, 0);
            }
        }
        RunStatus::Rejected(reason) => println!("rejected: {}", reason),
        RunStatus::Running => unreachable!(),
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::ExecutionStarted {
            context_size, model, ..
        } => println!(">>> execution started ({} chars, model {})", context_size, model),
        EngineEvent::NodeStarted {
            depth, sequence, ..
        } => println!("  > node started (depth {}, seq {})", depth, sequence),
        EngineEvent::NodeCode { code, .. } => {
            println!("  > program generated ({} lines)", code.lines().count())
        }
        EngineEvent::NodeOutput {
            output_preview,
            cost_usd,
            ..
        } => println!("  > node output: {:.40} (${:.6})", output_preview, cost_usd),
        EngineEvent::NodeFailed { error_kind, .. } => {
            println!("  > node FAILED: {}", error_kind)
        }
        EngineEvent::ExecutionCompleted { total_cost_usd, .. } => {
            println!(">>> execution completed (total ${:.6})", total_cost_usd)
        }
        EngineEvent::ExecutionFailed { error_message, .. } => {
            println!(">>> execution FAILED: {}", error_message)
        }
    }
}

fn print_tree(tree: &rlm_engine::NodeTree, indent: usize) {
    let pad = "  ".repeat(indent);
    println!(
        "{}[{:?} depth={} seq={}] {:?}",
        pad, tree.node.node_type, tree.node.depth, tree.node.sequence_number, tree.node.status
    );
    for child in &tree.children {
        print_tree(child, indent + 1);
    }
}
