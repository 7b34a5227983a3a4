use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trigger service configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// How often the service scans for due triggers.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum firings per scan while the executor signals backpressure.
    #[serde(default = "default_backpressure_fire_cap")]
    pub backpressure_fire_cap: usize,
    /// Retained fired-key history (oldest evicted beyond this).
    #[serde(default = "default_fired_key_history")]
    pub fired_key_history: usize,
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_backpressure_fire_cap() -> usize {
    1
}

fn default_fired_key_history() -> usize {
    10_000
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            backpressure_fire_cap: default_backpressure_fire_cap(),
            fired_key_history: default_fired_key_history(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TriggerConfig::default();
        assert_eq!(cfg.tick_interval_secs, 30);
        assert_eq!(cfg.backpressure_fire_cap, 1);
        assert_eq!(cfg.fired_key_history, 10_000);
    }

    #[test]
    fn deserialize_missing_fields_use_defaults() {
        let cfg: TriggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.tick_interval_secs, 30);
    }
}
