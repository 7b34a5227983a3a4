use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum worker parallelism `W`. Clamped to `1..=64`.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Backpressure factor `K`: new tool-initiated spawns are rejected
    /// once the ready count exceeds `workers * backpressure_factor`.
    #[serde(default = "default_backpressure_factor")]
    pub backpressure_factor: usize,
    /// Scheduler wakeup interval when no store event arrives.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Retry backoff base in milliseconds (doubles per attempt).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Default per-task deadline. `None` = no timeout.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

fn default_workers() -> usize {
    4
}

fn default_backpressure_factor() -> usize {
    8
}

fn default_tick_ms() -> u64 {
    250
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backpressure_factor: default_backpressure_factor(),
            tick_ms: default_tick_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            task_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    /// Clamp `workers` to the allowed range `1..=64`.
    pub fn clamped(&self) -> Self {
        Self {
            workers: self.workers.clamp(1, 64),
            backpressure_factor: self.backpressure_factor.max(1),
            ..self.clone()
        }
    }

    /// Ready-queue depth above which new spawns are refused.
    pub fn backpressure_limit(&self) -> usize {
        self.workers.clamp(1, 64) * self.backpressure_factor.max(1)
    }
}
