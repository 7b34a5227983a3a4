//! Usage accounting — one record per LLM API invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    /// Estimated from the per-model pricing map; 0.0 when unpriced.
    #[serde(default)]
    pub estimated_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
}

impl UsageRecord {
    pub fn new(model: impl Into<String>, usage: &Usage, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            duration_ms,
            conversation_id: None,
            message_id: None,
            estimated_cost_usd: 0.0,
            created_at: Utc::now(),
            seq: 0,
        }
    }

    pub fn for_conversation(mut self, conversation_id: Uuid, message_id: Option<Uuid>) -> Self {
        self.conversation_id = Some(conversation_id);
        self.message_id = message_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_copies_usage_fields() {
        let usage = Usage { prompt_tokens: 120, completion_tokens: 40, total_tokens: 160 };
        let rec = UsageRecord::new("gpt-test", &usage, 830);
        assert_eq!(rec.prompt_tokens, 120);
        assert_eq!(rec.completion_tokens, 40);
        assert_eq!(rec.total_tokens, 160);
        assert_eq!(rec.duration_ms, 830);
        assert!(rec.conversation_id.is_none());
    }

    #[test]
    fn for_conversation_links_ids() {
        let conv = Uuid::new_v4();
        let msg = Uuid::new_v4();
        let rec = UsageRecord::new("m", &Usage::default(), 0).for_conversation(conv, Some(msg));
        assert_eq!(rec.conversation_id, Some(conv));
        assert_eq!(rec.message_id, Some(msg));
    }
}
