//! Ingestion pipeline.
//!
//! Seven stages run per source: discovery (the caller hands us sources),
//! ingestion (raw capture), parsing (normalization), classification
//! (bucket assignment), analysis (keyword extraction), storage (embedding
//! computed and stored atomically with the item), indexing (both indexes
//! derive from the stored item, so the upsert covers them).

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use butler_domain::knowledge::{Bucket, KnowledgeItem, SourceType};
use butler_domain::Result;
use butler_llm::EmbeddingClient;

use crate::keyword::extract_keywords;
use crate::retrieve::classify_by_keywords;
use crate::store::KnowledgeStore;

/// Stored keyword cap per item.
const MAX_KEYWORDS: usize = 32;

/// A discovered source ready for ingestion.
#[derive(Debug, Clone)]
pub struct IngestSource {
    pub source_type: SourceType,
    pub title: String,
    pub content: String,
    pub metadata: Value,
    /// Connector-supplied bucket; `None` classifies from content.
    pub bucket_hint: Option<Bucket>,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub id: Uuid,
    pub bucket: Bucket,
    /// False when the content hash matched an existing item.
    pub created: bool,
}

pub struct Ingestor {
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl Ingestor {
    pub fn new(store: Arc<KnowledgeStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { store, embedder }
    }

    /// Run one source through the pipeline.
    pub async fn ingest(&self, source: IngestSource) -> Result<IngestReport> {
        // Parsing: normalize line endings and trim.
        let content = source.content.replace("\r\n", "\n").trim().to_string();

        // Classification: explicit hint, then content heuristics.
        let bucket = source
            .bucket_hint
            .or_else(|| classify_by_keywords(&content))
            .unwrap_or(Bucket::Other);

        // Analysis: entity/keyword extraction for the keyword index.
        let keywords = extract_keywords(&content, MAX_KEYWORDS);

        // Storage: the embedding is computed first so item + vector are
        // stored in one atomic upsert.
        let embedding = self.embedder.embed(&content).await?;
        let item = KnowledgeItem {
            id: Uuid::new_v4(),
            source_type: source.source_type,
            bucket,
            title: source.title,
            content,
            embedding,
            keywords,
            metadata: source.metadata,
            content_hash: String::new(), // recomputed by the store
            created_at: chrono::Utc::now(),
            seq: 0,
        };
        let outcome = self.store.upsert(item);

        tracing::debug!(
            item_id = %outcome.id,
            ?bucket,
            created = outcome.created,
            "source ingested"
        );
        Ok(IngestReport { id: outcome.id, bucket, created: outcome.created })
    }

    /// Ingest a discovered batch; sources that fail are logged and
    /// skipped, the rest proceed.
    pub async fn ingest_batch(&self, sources: Vec<IngestSource>) -> Vec<IngestReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            let title = source.title.clone();
            match self.ingest(source).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(title = %title, error = %e, "ingest failed"),
            }
        }
        reports
    }
}
