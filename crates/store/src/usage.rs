//! Usage ledger — append-only record of LLM API invocations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use butler_domain::usage::UsageRecord;
use butler_domain::Result;

use crate::persist;

pub struct UsageStore {
    records: RwLock<Vec<UsageRecord>>,
    seq: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            persist_path: None,
        }
    }

    pub fn with_persistence(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("usage.json");
        let store = Self::new();
        if let Some(records) = persist::load_json::<Vec<UsageRecord>>(&path) {
            let max_seq = records.iter().map(|r| r.seq).max().unwrap_or(0);
            let count = records.len();
            *store.records.write() = records;
            store.seq.store(max_seq + 1, Ordering::SeqCst);
            tracing::info!(count, "loaded usage records from disk");
        }
        Self { persist_path: Some(path), ..store }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let records = self.records.read();
        persist::save_json(path, &*records)
    }

    /// Append a record, assigning its audit sequence. Returns the stored copy.
    pub fn record(&self, mut record: UsageRecord) -> UsageRecord {
        record.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.records.write().push(record.clone());
        tracing::debug!(
            model = %record.model,
            total_tokens = record.total_tokens,
            "usage recorded"
        );
        record
    }

    pub fn list(&self) -> Vec<UsageRecord> {
        self.records.read().clone()
    }

    pub fn for_conversation(&self, conversation_id: &Uuid) -> Vec<UsageRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.conversation_id == Some(*conversation_id))
            .cloned()
            .collect()
    }

    pub fn total_tokens(&self) -> u64 {
        self.records.read().iter().map(|r| r.total_tokens as u64).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.records.read().iter().map(|r| r.estimated_cost_usd).sum()
    }
}

impl Default for UsageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_domain::stream::Usage;

    fn usage(total: u32) -> Usage {
        Usage { prompt_tokens: total / 2, completion_tokens: total - total / 2, total_tokens: total }
    }

    #[test]
    fn record_assigns_increasing_seq() {
        let store = UsageStore::new();
        let a = store.record(UsageRecord::new("m", &usage(10), 5));
        let b = store.record(UsageRecord::new("m", &usage(20), 5));
        assert!(b.seq > a.seq);
        assert_eq!(store.total_tokens(), 30);
    }

    #[test]
    fn filter_by_conversation() {
        let store = UsageStore::new();
        let conv = Uuid::new_v4();
        store.record(UsageRecord::new("m", &usage(10), 1).for_conversation(conv, None));
        store.record(UsageRecord::new("m", &usage(10), 1));
        assert_eq!(store.for_conversation(&conv).len(), 1);
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = UsageStore::with_persistence(dir.path());
            store.record(UsageRecord::new("m", &usage(7), 2));
            store.save().unwrap();
        }
        let store = UsageStore::with_persistence(dir.path());
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.total_tokens(), 7);
    }
}
