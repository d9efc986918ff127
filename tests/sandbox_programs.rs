//! Whole-program sandbox tests in the shape the code-generation prompt
//! teaches: chunk, query, aggregate, FINAL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rlm_engine::sandbox::{run_program, HostError, Outcome, SandboxHost};
use rlm_engine::ErrorKind;

/// Echoes a canned reply per prompt, recording every prompt it saw.
struct EchoHost {
    prompts: Vec<String>,
}

impl EchoHost {
    fn new() -> Self {
        Self {
            prompts: Vec::new(),
        }
    }
}

impl SandboxHost for EchoHost {
    fn llm_query(&mut self, prompt: String) -> Result<String, HostError> {
        let reply = format!("reply#{}", self.prompts.len());
        self.prompts.push(prompt);
        Ok(reply)
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn test_map_reduce_program_shape() {
    let source = r#"
chunk_size = 10
results = []
for i in range(0, len(context), chunk_size):
    chunk = context[i:i + chunk_size]
    results.append(llm_query(f"Extract the key facts from this text:\n{chunk}"))
summary = llm_query("Combine these notes into one answer:\n" + "\n---\n".join(results))
FINAL(summary)
"#;
    let context = "0123456789abcdefghij0123";
    let mut host = EchoHost::new();
    let result = run_program(source, context, &HashMap::new(), &mut host, deadline());

    assert_eq!(result.outcome, Outcome::Final("reply#3".into()));
    assert_eq!(host.prompts.len(), 4);
    assert!(host.prompts[0].ends_with("0123456789"));
    assert!(host.prompts[2].ends_with("0123"));
    assert!(host.prompts[3].contains("reply#0\n---\nreply#1\n---\nreply#2"));
}

#[test]
fn test_search_then_analyze_program() {
    let source = r#"
needle = "error"
hits = []
lines = context.split("\n")
for i, line in enumerate(lines):
    if needle in line.lower():
        hits.append(f"line {i}: {line.strip()}")
if len(hits) == 0:
    FINAL("no matches")
analysis = llm_query("Explain these log lines:\n" + "\n".join(hits))
FINAL(analysis)
"#;
    let context = "ok start\nERROR disk full\nall good\n  error: retry failed\n";
    let mut host = EchoHost::new();
    let result = run_program(source, context, &HashMap::new(), &mut host, deadline());

    assert_eq!(result.outcome, Outcome::Final("reply#0".into()));
    assert!(host.prompts[0].contains("line 1: ERROR disk full"));
    assert!(host.prompts[0].contains("line 3: error: retry failed"));
}

#[test]
fn test_no_matches_early_final_skips_llm() {
    let source = r#"
hits = []
for line in context.split("\n"):
    if "error" in line:
        hits.append(line)
if len(hits) == 0:
    FINAL("no matches")
FINAL(llm_query("analyze"))
"#;
    let mut host = EchoHost::new();
    let result = run_program(source, "clean\nlog\n", &HashMap::new(), &mut host, deadline());
    assert_eq!(result.outcome, Outcome::Final("no matches".into()));
    assert!(host.prompts.is_empty());
}

#[test]
fn test_memory_accumulation_program() {
    let source = r#"
seen = memory.get("documents", [])
seen.append(len(context))
memory["documents"] = seen
memory["total_chars"] = sum(seen)
FINAL(f"{len(seen)} documents, {memory['total_chars']} chars")
"#;
    let mut memory = HashMap::new();
    memory.insert("documents".to_string(), serde_json::json!([120]));
    let mut host = EchoHost::new();
    let result = run_program(source, "abcde", &memory, &mut host, deadline());

    assert_eq!(result.outcome, Outcome::Final("2 documents, 125 chars".into()));
    assert_eq!(
        result.memory_after.get("documents"),
        Some(&serde_json::json!([120, 5]))
    );
    assert_eq!(
        result.memory_after.get("total_chars"),
        Some(&serde_json::json!(125))
    );
}

#[test]
fn test_helper_function_program() {
    let source = r#"
def chunk_text(text, size):
    pieces = []
    for i in range(0, len(text), size):
        pieces.append(text[i:i + size])
    return pieces

chunks = chunk_text(context, 4)
counts = []
for c in chunks:
    counts.append(str(len(c)))
FINAL(",".join(counts))
"#;
    let mut host = EchoHost::new();
    let result = run_program(source, "abcdefghij", &HashMap::new(), &mut host, deadline());
    assert_eq!(result.outcome, Outcome::Final("4,4,2".into()));
}

#[test]
fn test_forbidden_capability_fails_closed() {
    for source in [
        "FINAL(eval(\"1+1\"))",
        "FINAL(exec(\"x=1\"))",
        "f = open(\"/tmp/x\")\nFINAL(f)",
        "FINAL(getattr(context, \"upper\"))",
        "__import__(\"os\")\nFINAL(1)",
    ] {
        let mut host = EchoHost::new();
        let result = run_program(source, "ctx", &HashMap::new(), &mut host, deadline());
        match result.outcome {
            Outcome::Error { kind, .. } => assert_eq!(
                kind,
                ErrorKind::SandboxViolation,
                "source not rejected as violation: {}",
                source
            ),
            other => panic!("expected violation for {:?}, got {:?}", source, other),
        }
    }
}
