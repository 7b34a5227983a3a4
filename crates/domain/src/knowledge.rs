//! Knowledge item model for the retrieval orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Domain buckets content is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Personal,
    Creator,
    Projects,
    Other,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [Bucket::Personal, Bucket::Creator, Bucket::Projects, Bucket::Other];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Note,
    Document,
    Email,
    ChatLog,
    WebPage,
    Code,
    Other,
}

/// A retrievable unit. `content_hash` is unique across the store:
/// re-ingesting identical content updates metadata without duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub source_type: SourceType,
    pub bucket: Bucket,
    pub title: String,
    pub content: String,
    /// Fixed-dimension vector from the embedding service.
    pub embedding: Vec<f32>,
    /// Tokenized form used by the keyword index.
    pub keywords: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_snake_case_serialization() {
        assert_eq!(serde_json::to_string(&Bucket::Personal).unwrap(), "\"personal\"");
        assert_eq!(serde_json::to_string(&Bucket::Projects).unwrap(), "\"projects\"");
    }

    #[test]
    fn all_buckets_listed_once() {
        let mut seen = std::collections::HashSet::new();
        for b in Bucket::ALL {
            assert!(seen.insert(b));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn source_type_roundtrip() {
        for st in [
            SourceType::Note,
            SourceType::Document,
            SourceType::Email,
            SourceType::ChatLog,
            SourceType::WebPage,
            SourceType::Code,
            SourceType::Other,
        ] {
            let json = serde_json::to_string(&st).unwrap();
            let back: SourceType = serde_json::from_str(&json).unwrap();
            assert_eq!(st, back);
        }
    }
}
