use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retrieval configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Top-K candidates from the vector index.
    #[serde(default = "default_vector_top_k")]
    pub vector_top_k: usize,
    /// Top-K candidates from the keyword index.
    #[serde(default = "default_keyword_top_k")]
    pub keyword_top_k: usize,
    /// Minimum cosine similarity for a vector hit.
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f32,
    /// Context bundle token budget `B_ctx`.
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,
    /// Reciprocal-rank-fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
}

fn default_vector_top_k() -> usize {
    10
}

fn default_keyword_top_k() -> usize {
    10
}

fn default_vector_threshold() -> f32 {
    0.35
}

fn default_context_budget_tokens() -> usize {
    2_048
}

fn default_rrf_k() -> f64 {
    60.0
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_top_k: default_vector_top_k(),
            keyword_top_k: default_keyword_top_k(),
            vector_threshold: default_vector_threshold(),
            context_budget_tokens: default_context_budget_tokens(),
            rrf_k: default_rrf_k(),
        }
    }
}
