use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM client configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default model identifier passed to the generation service.
    #[serde(default = "default_model")]
    pub model: String,
    /// Concurrent in-flight requests allowed per provider; exceeding this
    /// suspends the caller on the limiter rather than failing.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Per-model pricing for usage cost estimates.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_max_concurrent_requests() -> usize {
    4
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_concurrent_requests: default_max_concurrent_requests(),
            pricing: HashMap::new(),
        }
    }
}

/// USD per million tokens, input and output priced separately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (completion_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}
