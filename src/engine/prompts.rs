//! Prompt composition and program extraction.
//!
//! The root LM never sees the context content, only its metadata; the
//! program it writes reads `context` inside the sandbox.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::ContextMetadata;
use crate::llm::ChatMessage;

/// User query given to a recursive sub-agent. Its real input is the
/// context, which carries the `llm_query` prompt that spawned it.
pub const SUBAGENT_QUERY: &str = "Process and respond to this request";

/// System message for program-generating nodes: documents the sandbox
/// surface and the fenced-code response format.
pub fn code_system_prompt(chunk_size: usize) -> String {
    format!(
        r#"You are an agent that processes large contexts by writing a short program.

Your environment provides exactly these bindings:
- `context`: the full context string (may be very large)
- `memory`: a dict of persistent values from previous runs; you may read and update it
- `llm_query(prompt)`: ask a sub-agent a question and get its answer as a string
- `FINAL(result)`: finish with your answer. YOU MUST call this to complete.
- builtins: len, range, enumerate, min, max, sum, sorted, str, int, float, bool, list, dict
- string methods: split, join, strip, upper, lower, find, replace, startswith, endswith

The language is a small Python-like subset: assignments, if/elif/else, for and
while loops, def, return, f-strings, list and dict literals, slicing.
List comprehensions, imports, and attribute access other than the methods
above are not available.

RULES:
1. NEVER put the full context into one prompt - it is too large.
2. Chunk it: slice `context` into pieces of about {chunk_size} characters and
   process each with llm_query().
3. Aggregate the per-chunk answers, then call FINAL(result).
4. Keep the program simple and flat.

Example:
```
chunk_size = {chunk_size}
results = []
for i in range(0, len(context), chunk_size):
    chunk = context[i:i + chunk_size]
    results.append(llm_query(f"Extract the key facts from this text:\n{{chunk}}"))
summary = llm_query("Combine these notes into one answer:\n" + "\n---\n".join(results))
FINAL(summary)
```

Respond with ONLY the program in a fenced code block, no explanations."#
    )
}

/// User message for the root node: query plus context metadata and memory.
pub fn root_user_message(
    query: &str,
    meta: &ContextMetadata,
    memory: &HashMap<String, Value>,
) -> String {
    let memory_text = if memory.is_empty() {
        "No previous memory".to_string()
    } else {
        serde_json::to_string_pretty(&memory).unwrap_or_else(|_| "{}".to_string())
    };
    format!(
        "Context information:\n\
         - size: {} characters\n\
         - sha256: {}\n\
         - sample: {}\n\n\
         Memory from previous runs:\n{}\n\n\
         User query: {}\n\n\
         Write the program now. Remember to call FINAL(result) at the end.",
        meta.size, meta.sha256, meta.sample, memory_text, query
    )
}

/// System message for leaf child nodes answering an `llm_query` prompt.
pub fn child_system_prompt() -> String {
    "You are a sub-agent helping to process a large document.\n\
     You receive one specific task from the parent agent. Answer it directly.\n\
     Be concise but complete; if asked to extract, use a structured format."
        .to_string()
}

/// Messages for a program-generating node.
pub fn code_messages(
    query: &str,
    meta: &ContextMetadata,
    memory: &HashMap<String, Value>,
    chunk_size: usize,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(code_system_prompt(chunk_size)),
        ChatMessage::user(root_user_message(query, meta, memory)),
    ]
}

/// Messages for a leaf child node: the caller's prompt verbatim plus the
/// child system message.
pub fn child_messages(prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(child_system_prompt()),
        ChatMessage::user(prompt),
    ]
}

/// Extract the program from an LM response: the content of the first fenced
/// code block (any language tag); with no fenced block, the whole response.
pub fn extract_program(response: &str) -> String {
    let fence = Regex::new(r"(?s)```[a-zA-Z0-9_-]*[ \t]*\r?\n(.*?)```").unwrap();
    if let Some(caps) = fence.captures(response) {
        return caps[1].trim_end().to_string();
    }
    response.trim().to_string()
}
