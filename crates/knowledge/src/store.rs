//! Knowledge store — bucket-sharded items with unique content hashes.
//!
//! Each bucket has its own lock: readers run concurrently, a writer takes
//! the bucket exclusively. `snapshot` clones the requested buckets under
//! their read locks so one query sees a consistent view across the vector
//! and keyword rankings (no torn reads between the two indexes).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use butler_domain::knowledge::{Bucket, KnowledgeItem};
use butler_domain::Result;
use butler_store::persist;

/// SHA-256 hex of item content; the store-wide uniqueness key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct UpsertOutcome {
    pub id: Uuid,
    /// False when an identical-content item existed and only metadata moved.
    pub created: bool,
}

pub struct KnowledgeStore {
    shards: HashMap<Bucket, RwLock<HashMap<Uuid, KnowledgeItem>>>,
    /// content_hash -> (bucket, id); guards the uniqueness invariant.
    hashes: RwLock<HashMap<String, (Bucket, Uuid)>>,
    seq: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        let shards = Bucket::ALL
            .into_iter()
            .map(|b| (b, RwLock::new(HashMap::new())))
            .collect();
        Self {
            shards,
            hashes: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            persist_path: None,
        }
    }

    pub fn with_persistence(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("knowledge.json");
        let store = Self::new();
        if let Some(items) = persist::load_json::<Vec<KnowledgeItem>>(&path) {
            let max_seq = items.iter().map(|i| i.seq).max().unwrap_or(0);
            let count = items.len();
            for item in items {
                store.hashes
                    .write()
                    .insert(item.content_hash.clone(), (item.bucket, item.id));
                if let Some(shard) = store.shards.get(&item.bucket) {
                    shard.write().insert(item.id, item);
                }
            }
            store.seq.store(max_seq + 1, Ordering::SeqCst);
            tracing::info!(count, "loaded knowledge items from disk");
        }
        Self { persist_path: Some(path), ..store }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let items: Vec<KnowledgeItem> = self.snapshot(&Bucket::ALL);
        persist::save_json(path, &items)
    }

    /// Insert or refresh an item. Identical content (same hash) updates
    /// metadata only and never duplicates; the original id is returned.
    pub fn upsert(&self, mut item: KnowledgeItem) -> UpsertOutcome {
        item.content_hash = content_hash(&item.content);

        // Fast path: known hash updates metadata in place.
        if let Some((bucket, id)) = self.hashes.read().get(&item.content_hash).copied() {
            if let Some(shard) = self.shards.get(&bucket) {
                let mut guard = shard.write();
                if let Some(existing) = guard.get_mut(&id) {
                    existing.metadata = item.metadata;
                    tracing::debug!(item_id = %id, "re-ingest refreshed metadata");
                    return UpsertOutcome { id, created: false };
                }
            }
        }

        item.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = item.id;
        let bucket = item.bucket;
        self.hashes.write().insert(item.content_hash.clone(), (bucket, id));
        if let Some(shard) = self.shards.get(&bucket) {
            shard.write().insert(id, item);
        }
        UpsertOutcome { id, created: true }
    }

    pub fn get(&self, bucket: Bucket, id: &Uuid) -> Option<KnowledgeItem> {
        self.shards.get(&bucket)?.read().get(id).cloned()
    }

    /// Find an item by id across all buckets.
    pub fn find(&self, id: &Uuid) -> Option<KnowledgeItem> {
        Bucket::ALL.into_iter().find_map(|b| self.get(b, id))
    }

    /// Consistent clone of the requested buckets, ordered by seq.
    pub fn snapshot(&self, buckets: &[Bucket]) -> Vec<KnowledgeItem> {
        let mut out = Vec::new();
        for bucket in buckets {
            if let Some(shard) = self.shards.get(bucket) {
                out.extend(shard.read().values().cloned());
            }
        }
        out.sort_by_key(|i| i.seq);
        out
    }

    pub fn len(&self) -> usize {
        self.shards.values().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}
