mod executor;
mod llm;
mod retrieval;
mod triggers;
mod turn;

pub use executor::*;
pub use llm::*;
pub use retrieval::*;
pub use triggers::*;
pub use turn::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for JSON state snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            executor: ExecutorConfig::default(),
            triggers: TriggerConfig::default(),
            retrieval: RetrievalConfig::default(),
            turn: TurnConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}
