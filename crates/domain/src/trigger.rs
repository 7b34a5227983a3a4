//! Trigger model — rules that enqueue work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::{json_path, TaskSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerRule {
    /// 5-field cron expression evaluated in `timezone`.
    Cron { expression: String, timezone: String },
    /// Fire every N seconds from the last fire.
    Interval { every_secs: u64 },
    /// Fire on each matching event delivery.
    Event {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<EventFilter>,
    },
    /// Fired only by an explicit API call.
    Manual,
}

/// Simple payload predicate: a dot-path must equal a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub path: String,
    pub equals: Value,
}

impl EventFilter {
    pub fn matches(&self, payload: &Value) -> bool {
        json_path(payload, &self.path) == Some(&self.equals)
    }
}

/// What happens when the service discovers a missed cron window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedPolicy {
    /// Drop the missed window silently.
    Skip,
    /// Fire exactly once, no matter how many windows were missed.
    RunOnce,
    /// Fire once per missed window, bounded by `max_catchup_runs`.
    CatchUp,
}

impl Default for MissedPolicy {
    fn default() -> Self {
        Self::RunOnce
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trigger record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_COOLDOWN_MINUTES: u64 = 24 * 60;

/// Cooldown after consecutive failures: 2^(n-1) minutes, capped at 24h.
pub fn cooldown_minutes(consecutive_failures: u32) -> u64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let exp = (consecutive_failures - 1).min(20);
    let minutes = 1u64.checked_shl(exp).unwrap_or(MAX_COOLDOWN_MINUTES);
    minutes.min(MAX_COOLDOWN_MINUTES)
}

fn default_max_catchup_runs() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub name: String,
    pub rule: TriggerRule,
    pub enabled: bool,
    /// Task spec enqueued on each firing.
    pub task: TaskSpec,
    #[serde(default)]
    pub missed_policy: MissedPolicy,
    #[serde(default = "default_max_catchup_runs")]
    pub max_catchup_runs: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    // ── Error tracking ───────────────────────────────────────────────
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seq: u64,
}

impl Trigger {
    pub fn new(name: impl Into<String>, rule: TriggerRule, task: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            rule,
            enabled: true,
            task,
            missed_policy: MissedPolicy::default(),
            max_catchup_runs: default_max_catchup_runs(),
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            next_fire_at: None,
            consecutive_failures: 0,
            last_error: None,
            cooldown_until: None,
            seq: 0,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|cu| cu > now)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fire keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic per-firing identifier enforcing at-most-once semantics
/// across restarts: the cron/interval instant or the event id, scoped to
/// the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FireKey(pub String);

impl FireKey {
    pub fn for_instant(trigger_id: Uuid, instant: DateTime<Utc>) -> Self {
        Self(format!("{trigger_id}:{}", instant.to_rfc3339()))
    }

    pub fn for_event(trigger_id: Uuid, event_id: &str) -> Self {
        Self(format!("{trigger_id}:event:{event_id}"))
    }

    pub fn for_manual(trigger_id: Uuid, request_id: Uuid) -> Self {
        Self(format!("{trigger_id}:manual:{request_id}"))
    }
}
