use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation turn configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Number of most-recent messages always preserved when history is
    /// truncated (least-recent-first eviction).
    #[serde(default = "default_preserved_window")]
    pub preserved_window: usize,
    /// Upper bound on history messages sent per turn, preserved window
    /// included.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// System directives prefixed to every prompt.
    #[serde(default = "default_system_directives")]
    pub system_directives: String,
}

fn default_preserved_window() -> usize {
    8
}

fn default_max_history() -> usize {
    40
}

fn default_system_directives() -> String {
    "You are Butler, a personal assistant.".to_string()
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            preserved_window: default_preserved_window(),
            max_history: default_max_history(),
            system_directives: default_system_directives(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TurnConfig::default();
        assert_eq!(cfg.preserved_window, 8);
        assert_eq!(cfg.max_history, 40);
        assert!(cfg.system_directives.contains("Butler"));
    }

    #[test]
    fn deserialize_missing_fields_use_defaults() {
        let cfg: TurnConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.preserved_window, 8);
    }
}
