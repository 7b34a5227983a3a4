//! Abstract LLM generation and embedding clients.
//!
//! Real transports live in out-of-tree integration crates; the core only
//! sees these traits. [`RateLimited`] pools a client behind a semaphore so
//! exceeding the per-provider limit suspends the caller instead of failing.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use butler_domain::error::{Error, Result};
use butler_domain::stream::{BoxStream, GenerateChunk, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    /// The fully composed prompt (directives + context + history + user).
    pub prompt: String,
    pub params: GenerateParams,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Generation service: yields text chunks and a terminal usage record.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<GenerateChunk>>>;
}

/// Embedding service. Deterministic per (model, text).
#[async_trait::async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pools an inner client behind `max_concurrent` permits. A permit is held
/// for the full lifetime of the returned stream, so in-flight streaming
/// reads count against the limit.
pub struct RateLimited {
    inner: Arc<dyn LlmClient>,
    permits: Arc<Semaphore>,
}

impl RateLimited {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait::async_trait]
impl LlmClient for RateLimited {
    async fn generate(
        &self,
        req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<GenerateChunk>>> {
        // Suspend (not fail) until a permit frees up.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Permanent("llm client pool closed".into()))?;
        let inner = self.inner.generate(req).await?;
        let stream = async_stream::stream! {
            let _permit = permit; // released when the stream is dropped
            futures_util::pin_mut!(inner);
            while let Some(item) = futures_util::StreamExt::next(&mut inner).await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test doubles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scripted client: each `generate` call pops the next canned response and
/// streams it in small chunks. An empty script yields a transport error.
pub struct MockLlm {
    responses: Mutex<Vec<String>>,
    chunk_size: usize,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self { responses: Mutex::new(responses), chunk_size: 7 }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn generate(
        &self,
        _req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<GenerateChunk>>> {
        let response = {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(Error::Transient("mock llm has no responses left".into()));
            }
            responses.remove(0)
        };
        let chunk_size = self.chunk_size;
        let stream = async_stream::stream! {
            let mut rest = response.as_str();
            while !rest.is_empty() {
                let mut cut = rest.len().min(chunk_size);
                while !rest.is_char_boundary(cut) {
                    cut += 1;
                }
                let (chunk, tail) = rest.split_at(cut);
                yield Ok(GenerateChunk::Text(chunk.to_string()));
                rest = tail;
            }
            yield Ok(GenerateChunk::Done {
                usage: Usage {
                    prompt_tokens: 100,
                    completion_tokens: (response.len() / 4) as u32,
                    total_tokens: 100 + (response.len() / 4) as u32,
                },
            });
        };
        Ok(Box::pin(stream))
    }
}

/// Deterministic embedder: folds bytes into a fixed-dimension vector and
/// L2-normalizes it. Same text always embeds identically.
pub struct MockEmbedder {
    pub dimension: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

#[async_trait::async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dimension] += f32::from(b) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}
