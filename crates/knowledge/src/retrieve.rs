//! Hybrid retrieval: classify, search both indexes over one snapshot,
//! fuse with reciprocal rank, pack into a token-bounded context bundle.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use butler_domain::config::RetrievalConfig;
use butler_domain::knowledge::{Bucket, KnowledgeItem};
use butler_domain::Result;
use butler_llm::EmbeddingClient;

use crate::keyword::{rank_keyword, tokenize};
use crate::store::KnowledgeStore;
use crate::vector::rank_vector;

/// Rough token estimate used for budget packing (corpus convention).
const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bucket classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optional LLM-backed classifier consulted when the keyword heuristics
/// are ambiguous. `None` keeps the query ambiguous (search everywhere).
#[async_trait::async_trait]
pub trait BucketClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Option<Bucket>;
}

fn bucket_hint_terms(bucket: Bucket) -> &'static [&'static str] {
    match bucket {
        Bucket::Personal => &[
            "my", "me", "family", "health", "home", "friend", "birthday", "doctor", "personal",
        ],
        Bucket::Creator => &[
            "video", "content", "audience", "channel", "post", "publish", "script", "episode",
            "creator",
        ],
        Bucket::Projects => &[
            "project", "code", "deploy", "repo", "bug", "feature", "design", "release", "api",
        ],
        Bucket::Other => &[],
    }
}

/// Keyword-heuristic classification. A single clear winner narrows the
/// search to that bucket; ties and zero hits stay ambiguous.
pub fn classify_by_keywords(query: &str) -> Option<Bucket> {
    let terms = tokenize(query);
    let mut best: Option<(Bucket, usize)> = None;
    let mut tie = false;
    for bucket in [Bucket::Personal, Bucket::Creator, Bucket::Projects] {
        let hits = bucket_hint_terms(bucket)
            .iter()
            .filter(|hint| terms.iter().any(|t| t == *hint))
            .count();
        if hits == 0 {
            continue;
        }
        match best {
            Some((_, top)) if hits > top => {
                best = Some((bucket, hits));
                tie = false;
            }
            Some((_, top)) if hits == top => tie = true,
            None => best = Some((bucket, hits)),
            _ => {}
        }
    }
    match (best, tie) {
        (Some((bucket, _)), false) => Some(bucket),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One packed item with its retrieval provenance (for later citation).
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub bucket: Bucket,
    pub content_hash: String,
    pub tokens: usize,
    pub fused_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
}

/// Ordered, token-bounded set of knowledge items for prompt injection.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    pub budget_tokens: usize,
    /// Buckets that were searched.
    pub buckets: Vec<Bucket>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render for prompt injection.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&format!(
                "### {} ({:?})\n{}\n\n",
                item.title, item.bucket, item.content
            ));
        }
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fusion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FusedHit {
    id: Uuid,
    fused_score: f64,
    vector_rank: Option<usize>,
    vector_score: Option<f32>,
    keyword_rank: Option<usize>,
    keyword_score: Option<f32>,
}

/// Reciprocal-rank fusion: each list contributes `1 / (k + rank)` (ranks
/// are 1-based). Items present in both lists dominate either list's tail.
fn rrf_fuse(vector: &[(Uuid, f32)], keyword: &[(Uuid, f32)], k: f64) -> Vec<FusedHit> {
    let mut hits: HashMap<Uuid, FusedHit> = HashMap::new();
    for (rank0, (id, score)) in vector.iter().enumerate() {
        let entry = hits.entry(*id).or_insert_with(|| FusedHit {
            id: *id,
            fused_score: 0.0,
            vector_rank: None,
            vector_score: None,
            keyword_rank: None,
            keyword_score: None,
        });
        entry.fused_score += 1.0 / (k + (rank0 + 1) as f64);
        entry.vector_rank = Some(rank0 + 1);
        entry.vector_score = Some(*score);
    }
    for (rank0, (id, score)) in keyword.iter().enumerate() {
        let entry = hits.entry(*id).or_insert_with(|| FusedHit {
            id: *id,
            fused_score: 0.0,
            vector_rank: None,
            vector_score: None,
            keyword_rank: None,
            keyword_score: None,
        });
        entry.fused_score += 1.0 / (k + (rank0 + 1) as f64);
        entry.keyword_rank = Some(rank0 + 1);
        entry.keyword_score = Some(*score);
    }
    let mut fused: Vec<FusedHit> = hits.into_values().collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RetrievalOrchestrator {
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn EmbeddingClient>,
    classifier: Option<Arc<dyn BucketClassifier>>,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    pub fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn EmbeddingClient>,
        config: RetrievalConfig,
    ) -> Self {
        Self { store, embedder, classifier: None, config }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn BucketClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Produce a [`ContextBundle`] for `query`, bounded by `budget_tokens`
    /// (falling back to the configured budget when zero).
    ///
    /// 1. Classify the query into a bucket; ambiguous searches all.
    /// 2. Vector search: top `K_v` by cosine at or above the threshold.
    /// 3. Keyword search: top `K_k` by BM25.
    /// 4. Reciprocal-rank fusion, deduplicated by content hash.
    /// 5. Greedy pack by descending fused rank; items are never split.
    pub async fn retrieve(
        &self,
        query: &str,
        principal: &str,
        budget_tokens: usize,
    ) -> Result<ContextBundle> {
        let budget = if budget_tokens == 0 {
            self.config.context_budget_tokens
        } else {
            budget_tokens
        };

        // 1. Classify.
        let buckets = match self.classify(query).await {
            Some(bucket) => vec![bucket],
            None => Bucket::ALL.to_vec(),
        };

        // One snapshot feeds both searches: no torn reads between them.
        let snapshot = self.store.snapshot(&buckets);

        // 2–3. Both rankings.
        let query_embedding = self.embedder.embed(query).await?;
        let vector_hits = rank_vector(
            &query_embedding,
            &snapshot,
            self.config.vector_top_k,
            self.config.vector_threshold,
        );
        let keyword_hits = rank_keyword(query, &snapshot, self.config.keyword_top_k);

        // 4. Fuse and dedupe by content hash.
        let by_id: HashMap<Uuid, &KnowledgeItem> =
            snapshot.iter().map(|i| (i.id, i)).collect();
        let fused = rrf_fuse(&vector_hits, &keyword_hits, self.config.rrf_k);

        // 5. Pack greedily.
        let mut seen_hashes = std::collections::HashSet::new();
        let mut items = Vec::new();
        let mut total_tokens = 0usize;
        for hit in fused {
            let Some(item) = by_id.get(&hit.id) else {
                continue;
            };
            if !seen_hashes.insert(item.content_hash.clone()) {
                continue;
            }
            let tokens = estimate_tokens(&item.content) + estimate_tokens(&item.title);
            if total_tokens + tokens > budget {
                continue; // never split an item; later, smaller ones may fit
            }
            total_tokens += tokens;
            items.push(ContextItem {
                id: item.id,
                title: item.title.clone(),
                content: item.content.clone(),
                bucket: item.bucket,
                content_hash: item.content_hash.clone(),
                tokens,
                fused_score: hit.fused_score,
                vector_rank: hit.vector_rank,
                vector_score: hit.vector_score,
                keyword_rank: hit.keyword_rank,
                keyword_score: hit.keyword_score,
            });
        }

        tracing::debug!(
            principal,
            buckets = ?buckets,
            candidates = by_id.len(),
            packed = items.len(),
            total_tokens,
            budget,
            "retrieval complete"
        );

        Ok(ContextBundle { items, total_tokens, budget_tokens: budget, buckets })
    }

    async fn classify(&self, query: &str) -> Option<Bucket> {
        if let Some(bucket) = classify_by_keywords(query) {
            return Some(bucket);
        }
        if let Some(classifier) = &self.classifier {
            return classifier.classify(query).await;
        }
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
