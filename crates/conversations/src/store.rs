//! Conversation store — conversations own their messages by cascade.
//!
//! Messages within a conversation are totally ordered by `created_at`
//! with a stable tiebreak by `id`. Assistant messages may carry tool
//! calls; the matching `tool`-role messages must follow before the next
//! assistant turn ([`ConversationStore::verify_tool_pairing`] checks the
//! invariant for audits and tests).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use butler_domain::conversation::{Conversation, Message, Role};
use butler_domain::error::{Error, Result};
use butler_store::persist;

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
}

pub struct ConversationStore {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    /// conversation id -> messages, kept sorted by order key.
    messages: RwLock<HashMap<Uuid, Vec<Message>>>,
    seq: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            persist_path: None,
        }
    }

    pub fn with_persistence(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("conversations.json");
        let store = Self::new();
        if let Some(snap) = persist::load_json::<Snapshot>(&path) {
            let max_seq = snap.messages.iter().map(|m| m.seq).max().unwrap_or(0);
            let count = snap.conversations.len();
            {
                let mut convs = store.conversations.write();
                for c in snap.conversations {
                    convs.insert(c.id, c);
                }
            }
            {
                let mut msgs = store.messages.write();
                for m in snap.messages {
                    msgs.entry(m.conversation_id).or_default().push(m);
                }
                for list in msgs.values_mut() {
                    list.sort_by_key(Message::order_key);
                }
            }
            store.seq.store(max_seq + 1, Ordering::SeqCst);
            tracing::info!(count, "loaded conversations from disk");
        }
        Self { persist_path: Some(path), ..store }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let snap = Snapshot {
            conversations: self.conversations.read().values().cloned().collect(),
            messages: self.messages.read().values().flatten().cloned().collect(),
        };
        persist::save_json(path, &snap)
    }

    // ── Conversations ─────────────────────────────────────────────

    pub fn create(&self, principal: impl Into<String>, title: impl Into<String>) -> Conversation {
        let mut conv = Conversation::new(principal, title);
        conv.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.conversations.write().insert(conv.id, conv.clone());
        conv
    }

    pub fn get(&self, id: &Uuid) -> Option<Conversation> {
        self.conversations.read().get(id).cloned()
    }

    pub fn list(&self, principal: Option<&str>) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self
            .conversations
            .read()
            .values()
            .filter(|c| principal.is_none_or(|p| c.principal == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Delete a conversation and, by cascade, all of its messages.
    pub fn delete(&self, id: &Uuid) -> bool {
        let removed = self.conversations.write().remove(id).is_some();
        if removed {
            self.messages.write().remove(id);
        }
        removed
    }

    // ── Messages ──────────────────────────────────────────────────

    /// Append a message; assigns the audit seq and bumps the
    /// conversation's `updated_at`. The message must reference an
    /// existing conversation.
    pub fn append(&self, mut message: Message) -> Result<Message> {
        {
            let mut convs = self.conversations.write();
            let conv = convs
                .get_mut(&message.conversation_id)
                .ok_or_else(|| Error::NotFound(format!("conversation {}", message.conversation_id)))?;
            conv.updated_at = chrono::Utc::now();
            if message.principal.is_empty() {
                message.principal = conv.principal.clone();
            }
        }
        message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut msgs = self.messages.write();
        let list = msgs.entry(message.conversation_id).or_default();
        list.push(message.clone());
        // Keep the stored order canonical: created_at, then id.
        list.sort_by_key(Message::order_key);
        Ok(message)
    }

    /// Replace a previously-appended message (same id) in place, e.g. to
    /// finalize streamed assistant content or attach tool-call results.
    pub fn update(&self, message: &Message) -> Result<()> {
        let mut msgs = self.messages.write();
        let list = msgs
            .get_mut(&message.conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", message.conversation_id)))?;
        let slot = list
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| Error::NotFound(format!("message {}", message.id)))?;
        *slot = message.clone();
        Ok(())
    }

    /// All messages of a conversation in total order.
    pub fn messages(&self, conversation_id: &Uuid) -> Vec<Message> {
        self.messages
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent `limit` messages, in total order.
    pub fn tail(&self, conversation_id: &Uuid, limit: usize) -> Vec<Message> {
        let msgs = self.messages.read();
        let Some(list) = msgs.get(conversation_id) else {
            return Vec::new();
        };
        let skip = list.len().saturating_sub(limit);
        list[skip..].to_vec()
    }

    /// Check the pairing invariant: the set of tool calls an assistant
    /// message declares is exactly the set of `tool`-role messages that
    /// follow it before the next assistant message. Returns the ids of
    /// assistant messages violating it.
    pub fn verify_tool_pairing(&self, conversation_id: &Uuid) -> Vec<Uuid> {
        let msgs = self.messages(conversation_id);
        let mut violations = Vec::new();
        let mut i = 0;
        while i < msgs.len() {
            if msgs[i].role != Role::Assistant {
                i += 1;
                continue;
            }
            let declared: std::collections::HashSet<&str> =
                msgs[i].tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            let mut seen = std::collections::HashSet::new();
            let mut j = i + 1;
            while j < msgs.len() && msgs[j].role != Role::Assistant {
                if msgs[j].role == Role::Tool {
                    for result in &msgs[j].tool_results {
                        if let Some(id) = result.get("call_id").and_then(|v| v.as_str()) {
                            seen.insert(id.to_string());
                        }
                    }
                }
                j += 1;
            }
            let seen_refs: std::collections::HashSet<&str> =
                seen.iter().map(String::as_str).collect();
            if declared != seen_refs {
                violations.push(msgs[i].id);
            }
            i = j;
        }
        violations
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
