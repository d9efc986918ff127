//! Session records and context fingerprints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Size, hash, and sample of a context blob. The sample is what the root LM
/// sees; the full content never enters a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub size: usize,
    pub sha256: String,
    pub sample: String,
}

impl ContextMetadata {
    const SAMPLE_CHARS: usize = 200;

    pub fn of(context: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context.as_bytes());
        let sample: String = context.chars().take(Self::SAMPLE_CHARS).collect();
        Self {
            size: context.chars().count(),
            sha256: format!("{:x}", hasher.finalize()),
            sample,
        }
    }
}

/// A session groups executions and carries persistent memory between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_metadata: Option<ContextMetadata>,
    #[serde(default)]
    pub memory: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(name: String, context: Option<String>) -> Self {
        let now = Utc::now();
        let context_metadata = context.as_deref().map(ContextMetadata::of);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            context,
            context_metadata,
            memory: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_metadata_sha256() {
        let meta = ContextMetadata::of("hello");
        assert_eq!(meta.size, 5);
        assert_eq!(
            meta.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(meta.sample, "hello");
    }

    #[test]
    fn test_context_metadata_sample_truncated() {
        let long = "x".repeat(1000);
        let meta = ContextMetadata::of(&long);
        assert_eq!(meta.size, 1000);
        assert_eq!(meta.sample.len(), 200);
    }

    #[test]
    fn test_session_new_fingerprints_context() {
        let session = Session::new("s".into(), Some("abc".into()));
        let meta = session.context_metadata.unwrap();
        assert_eq!(meta.size, 3);
        assert!(session.memory.is_empty());
    }
}
