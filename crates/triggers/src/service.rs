//! Trigger service — scans for due triggers and enqueues their tasks.
//!
//! Each firing is keyed by a deterministic [`FireKey`]; a key that was
//! already consumed is dropped, giving at-most-once semantics per
//! (trigger, fire-key) across restarts. Create failures put the trigger
//! into an exponential cooldown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use butler_domain::config::TriggerConfig;
use butler_domain::error::{Error, Result};
use butler_domain::trigger::{cooldown_minutes, FireKey, MissedPolicy, Trigger, TriggerRule};
use butler_store::{persist, TaskStore};

use crate::cron;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Load probe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scheduler load signal. While the executor is backpressured, trigger
/// firing is rate-capped (the triggers themselves remain enqueued).
pub trait LoadProbe: Send + Sync {
    fn is_backpressured(&self) -> bool;
}

/// Probe for deployments without an executor wired (never backpressured).
pub struct NoLoad;

impl LoadProbe for NoLoad {
    fn is_backpressured(&self) -> bool {
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fired-key ledger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded set of consumed fire-keys, oldest evicted first.
struct FiredKeys {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FiredKeys {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn from_keys(keys: Vec<String>, capacity: usize) -> Self {
        let mut fired = Self::new(capacity);
        for key in keys {
            fired.mark(&key);
        }
        fired
    }

    /// Consume a key. Returns false if it was already consumed.
    fn mark(&mut self, key: &str) -> bool {
        if !self.set.insert(key.to_string()) {
            return false;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trigger service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TriggerService {
    triggers: RwLock<HashMap<Uuid, Trigger>>,
    fired: Mutex<FiredKeys>,
    seq: std::sync::atomic::AtomicU64,
    tasks: Arc<TaskStore>,
    probe: Arc<dyn LoadProbe>,
    config: TriggerConfig,
    persist_dir: Option<PathBuf>,
}

impl TriggerService {
    pub fn new(tasks: Arc<TaskStore>, probe: Arc<dyn LoadProbe>, config: TriggerConfig) -> Self {
        let capacity = config.fired_key_history;
        Self {
            triggers: RwLock::new(HashMap::new()),
            fired: Mutex::new(FiredKeys::new(capacity)),
            seq: std::sync::atomic::AtomicU64::new(0),
            tasks,
            probe,
            config,
            persist_dir: None,
        }
    }

    /// Load `triggers.json` and `trigger_fires.json` from the state dir.
    pub fn with_persistence(
        tasks: Arc<TaskStore>,
        probe: Arc<dyn LoadProbe>,
        config: TriggerConfig,
        state_dir: &std::path::Path,
    ) -> Self {
        let service = Self::new(tasks, probe, config);
        let dir = state_dir.to_path_buf();
        if let Some(triggers) = persist::load_json::<Vec<Trigger>>(&dir.join("triggers.json")) {
            let count = triggers.len();
            let max_seq = triggers.iter().map(|t| t.seq).max().unwrap_or(0);
            let mut map = service.triggers.write();
            for t in triggers {
                map.insert(t.id, t);
            }
            drop(map);
            service.seq.store(max_seq + 1, std::sync::atomic::Ordering::SeqCst);
            tracing::info!(count, "loaded triggers from disk");
        }
        if let Some(keys) = persist::load_json::<Vec<String>>(&dir.join("trigger_fires.json")) {
            let capacity = service.config.fired_key_history;
            *service.fired.lock() = FiredKeys::from_keys(keys, capacity);
        }
        Self { persist_dir: Some(dir), ..service }
    }

    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let triggers: Vec<Trigger> = self.triggers.read().values().cloned().collect();
        persist::save_json(&dir.join("triggers.json"), &triggers)?;
        persist::save_json(&dir.join("trigger_fires.json"), &self.fired.lock().keys())?;
        Ok(())
    }

    // ── Registration ──────────────────────────────────────────────

    /// Register a trigger, computing its first `next_fire_at`. Cron
    /// expressions are validated structurally.
    pub fn register(&self, mut trigger: Trigger) -> Result<Uuid> {
        if let TriggerRule::Cron { expression, .. } = &trigger.rule {
            if !cron::validate_expression(expression) {
                return Err(Error::Validation(format!("invalid cron expression: {expression}")));
            }
        }
        trigger.next_fire_at = self.compute_next(&trigger, Utc::now());
        trigger.seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = trigger.id;
        self.triggers.write().insert(id, trigger);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Trigger> {
        self.triggers.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Trigger> {
        let mut out: Vec<Trigger> = self.triggers.read().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn delete(&self, id: &Uuid) -> bool {
        self.triggers.write().remove(id).is_some()
    }

    pub fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<()> {
        let mut map = self.triggers.write();
        let trigger = map.get_mut(id).ok_or_else(|| Error::NotFound(format!("trigger {id}")))?;
        trigger.enabled = enabled;
        trigger.updated_at = Utc::now();
        if enabled && trigger.next_fire_at.is_none() {
            trigger.next_fire_at = compute_next_for(trigger, Utc::now());
        }
        Ok(())
    }

    fn compute_next(&self, trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        compute_next_for(trigger, after)
    }

    // ── Firing ────────────────────────────────────────────────────

    /// Fire a trigger once under `fire_key`. Returns the created task id,
    /// or `None` when the key was already consumed or creation failed.
    fn fire(&self, trigger_id: &Uuid, fire_key: FireKey, payload: Option<&Value>) -> Option<Uuid> {
        if !self.fired.lock().mark(&fire_key.0) {
            tracing::debug!(trigger_id = %trigger_id, key = %fire_key.0, "fire-key already consumed");
            return None;
        }

        let spec = {
            let map = self.triggers.read();
            let trigger = map.get(trigger_id)?;
            let mut spec = trigger.task.clone();
            if let Some(payload) = payload {
                match &mut spec.input {
                    Value::Object(obj) => {
                        obj.insert("event".into(), payload.clone());
                    }
                    other => *other = serde_json::json!({ "event": payload }),
                }
            }
            spec
        };

        match self.tasks.create_task(spec) {
            Ok(task_id) => {
                let now = Utc::now();
                let mut map = self.triggers.write();
                if let Some(trigger) = map.get_mut(trigger_id) {
                    trigger.last_fired_at = Some(now);
                    trigger.consecutive_failures = 0;
                    trigger.last_error = None;
                    trigger.cooldown_until = None;
                    trigger.updated_at = now;
                }
                tracing::info!(trigger_id = %trigger_id, task_id = %task_id, "trigger fired");
                Some(task_id)
            }
            Err(e) => {
                self.record_failure(trigger_id, &e.to_string());
                None
            }
        }
    }

    fn record_failure(&self, trigger_id: &Uuid, error: &str) {
        let now = Utc::now();
        let mut map = self.triggers.write();
        if let Some(trigger) = map.get_mut(trigger_id) {
            trigger.consecutive_failures += 1;
            trigger.last_error = Some(error.to_string());
            let minutes = cooldown_minutes(trigger.consecutive_failures);
            trigger.cooldown_until = Some(now + chrono::Duration::minutes(minutes as i64));
            trigger.updated_at = now;
            tracing::warn!(
                trigger_id = %trigger_id,
                failures = trigger.consecutive_failures,
                cooldown_min = minutes,
                error,
                "trigger fire failed"
            );
        }
    }

    /// Manually fire a trigger. The request id keys the firing, so a
    /// retried request with the same id stays at-most-once.
    pub fn fire_manual(&self, id: &Uuid, request_id: Uuid) -> Result<Option<Uuid>> {
        let trigger = self.get(id).ok_or_else(|| Error::NotFound(format!("trigger {id}")))?;
        if !trigger.enabled {
            return Err(Error::Validation(format!("trigger {id} is disabled")));
        }
        Ok(self.fire(id, FireKey::for_manual(*id, request_id), None))
    }

    /// Deliver an event to every matching enabled event trigger. Returns
    /// the created task ids.
    pub fn deliver_event(&self, topic: &str, event_id: &str, payload: &Value) -> Vec<Uuid> {
        let matching: Vec<Uuid> = self
            .triggers
            .read()
            .values()
            .filter(|t| t.enabled && !t.in_cooldown(Utc::now()))
            .filter(|t| match &t.rule {
                TriggerRule::Event { topic: want, filter } => {
                    want == topic && filter.as_ref().is_none_or(|f| f.matches(payload))
                }
                _ => false,
            })
            .map(|t| t.id)
            .collect();

        matching
            .into_iter()
            .filter_map(|id| self.fire(&id, FireKey::for_event(id, event_id), Some(payload)))
            .collect()
    }

    /// One scan: fire every due cron/interval trigger, honoring missed-
    /// window policies, cooldowns, and the backpressure rate cap.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<Trigger> = self
            .triggers
            .read()
            .values()
            .filter(|t| {
                t.enabled
                    && !t.in_cooldown(now)
                    && t.next_fire_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();

        let cap = if self.probe.is_backpressured() {
            self.config.backpressure_fire_cap
        } else {
            usize::MAX
        };

        let mut created = Vec::new();
        for trigger in due.into_iter().take(cap) {
            created.extend(self.fire_due(&trigger, now));
        }
        created
    }

    fn fire_due(&self, trigger: &Trigger, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut created = Vec::new();
        match &trigger.rule {
            TriggerRule::Cron { expression, timezone } => {
                let tz = cron::parse_tz(timezone);
                let since = trigger
                    .next_fire_at
                    .map(|at| at - chrono::Duration::minutes(1))
                    .unwrap_or(now);
                let windows =
                    cron::occurrences_between(expression, &since, &now, tz, trigger.max_catchup_runs.max(1));

                let to_fire: Vec<DateTime<Utc>> = if windows.len() <= 1 {
                    windows
                } else {
                    match trigger.missed_policy {
                        MissedPolicy::Skip => Vec::new(),
                        MissedPolicy::RunOnce => windows.last().copied().into_iter().collect(),
                        MissedPolicy::CatchUp => windows,
                    }
                };
                for instant in to_fire {
                    if let Some(task_id) =
                        self.fire(&trigger.id, FireKey::for_instant(trigger.id, instant), None)
                    {
                        created.push(task_id);
                    }
                }
                let next = cron::next_occurrence(expression, &now, tz);
                let mut map = self.triggers.write();
                if let Some(t) = map.get_mut(&trigger.id) {
                    t.next_fire_at = next;
                }
            }
            TriggerRule::Interval { every_secs } => {
                let scheduled = trigger.next_fire_at.unwrap_or(now);
                if let Some(task_id) =
                    self.fire(&trigger.id, FireKey::for_instant(trigger.id, scheduled), None)
                {
                    created.push(task_id);
                }
                let mut map = self.triggers.write();
                if let Some(t) = map.get_mut(&trigger.id) {
                    t.next_fire_at = Some(now + chrono::Duration::seconds(*every_secs as i64));
                }
            }
            TriggerRule::Event { .. } | TriggerRule::Manual => {}
        }
        created
    }

    /// Long-running scan loop; spawn with `tokio::spawn(service.run())`.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.tick_interval_secs.max(1));
        tracing::info!(interval_secs = interval.as_secs(), "trigger service started");
        loop {
            let created = self.tick(Utc::now());
            if !created.is_empty() {
                tracing::debug!(count = created.len(), "trigger scan enqueued tasks");
            }
            if let Err(e) = self.save() {
                tracing::warn!(error = %e, "failed to persist triggers");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn compute_next_for(trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &trigger.rule {
        TriggerRule::Cron { expression, timezone } => {
            cron::next_occurrence(expression, &after, cron::parse_tz(timezone))
        }
        TriggerRule::Interval { every_secs } => {
            Some(after + chrono::Duration::seconds(*every_secs as i64))
        }
        TriggerRule::Event { .. } | TriggerRule::Manual => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use butler_domain::task::{TaskKind, TaskSpec, TaskStatus};
    use butler_domain::trigger::EventFilter;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestProbe(AtomicBool);

    impl LoadProbe for TestProbe {
        fn is_backpressured(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn service() -> (Arc<TaskStore>, TriggerService) {
        let tasks = Arc::new(TaskStore::new());
        let svc = TriggerService::new(
            Arc::clone(&tasks),
            Arc::new(NoLoad),
            TriggerConfig::default(),
        );
        (tasks, svc)
    }

    fn spec() -> TaskSpec {
        TaskSpec::new("triggered work", TaskKind::Research).with_principal("tester")
    }

    fn cron_trigger(expr: &str) -> Trigger {
        Trigger::new(
            "cron",
            TriggerRule::Cron { expression: expr.into(), timezone: "UTC".into() },
            spec(),
        )
    }

    #[test]
    fn register_computes_next_fire() {
        let (_, svc) = service();
        let id = svc.register(cron_trigger("0 * * * *")).unwrap();
        assert!(svc.get(&id).unwrap().next_fire_at.is_some());
    }

    #[test]
    fn register_rejects_bad_cron() {
        let (_, svc) = service();
        let err = svc.register(cron_trigger("not a cron")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn due_cron_fires_exactly_once() {
        let (tasks, svc) = service();
        let id = svc.register(cron_trigger("* * * * *")).unwrap();
        // Force the trigger due.
        let past = Utc::now() - chrono::Duration::minutes(1);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);

        let created = svc.tick(Utc::now());
        assert_eq!(created.len(), 1);
        assert_eq!(tasks.get(&created[0]).unwrap().status, TaskStatus::Pending);

        // Immediately ticking again: next_fire_at is now in the future.
        assert!(svc.tick(Utc::now()).is_empty());
    }

    #[test]
    fn fire_key_is_at_most_once() {
        let (tasks, svc) = service();
        let id = svc.register(cron_trigger("* * * * *")).unwrap();
        let instant = Utc::now();
        let key = FireKey::for_instant(id, instant);

        assert!(svc.fire(&id, key.clone(), None).is_some());
        // Replaying the same fire-key drops the firing.
        assert!(svc.fire(&id, key, None).is_none());
        assert_eq!(tasks.list(&Default::default()).len(), 1);
    }

    #[test]
    fn disabled_trigger_never_fires() {
        let (_, svc) = service();
        let id = svc.register(cron_trigger("* * * * *")).unwrap();
        let past = Utc::now() - chrono::Duration::minutes(1);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);
        svc.set_enabled(&id, false).unwrap();

        assert!(svc.tick(Utc::now()).is_empty());
        assert!(svc.fire_manual(&id, Uuid::new_v4()).is_err());
    }

    #[test]
    fn missed_windows_run_once_by_default() {
        let (_, svc) = service();
        let id = svc.register(cron_trigger("*/5 * * * *")).unwrap();
        // Pretend the service slept through four windows.
        let past = Utc::now() - chrono::Duration::minutes(20);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);

        let created = svc.tick(Utc::now());
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn missed_windows_catch_up_fires_each() {
        let (_, svc) = service();
        let mut trigger = cron_trigger("*/5 * * * *");
        trigger.missed_policy = MissedPolicy::CatchUp;
        trigger.max_catchup_runs = 3;
        let id = svc.register(trigger).unwrap();
        let past = Utc::now() - chrono::Duration::minutes(30);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);

        let created = svc.tick(Utc::now());
        assert_eq!(created.len(), 3); // capped by max_catchup_runs
    }

    #[test]
    fn missed_windows_skip_drops_all() {
        let (_, svc) = service();
        let mut trigger = cron_trigger("*/5 * * * *");
        trigger.missed_policy = MissedPolicy::Skip;
        let id = svc.register(trigger).unwrap();
        let past = Utc::now() - chrono::Duration::minutes(30);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);

        assert!(svc.tick(Utc::now()).is_empty());
        // But the schedule advances.
        assert!(svc.get(&id).unwrap().next_fire_at.unwrap() > Utc::now());
    }

    #[test]
    fn interval_fires_and_reschedules() {
        let (_, svc) = service();
        let trigger = Trigger::new("interval", TriggerRule::Interval { every_secs: 300 }, spec());
        let id = svc.register(trigger).unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);

        let created = svc.tick(Utc::now());
        assert_eq!(created.len(), 1);
        let next = svc.get(&id).unwrap().next_fire_at.unwrap();
        assert!(next > Utc::now() + chrono::Duration::seconds(250));
    }

    #[test]
    fn event_delivery_matches_topic_and_filter() {
        let (tasks, svc) = service();
        let trigger = Trigger::new(
            "on email",
            TriggerRule::Event {
                topic: "inbox".into(),
                filter: Some(EventFilter { path: "kind".into(), equals: json!("important") }),
            },
            spec(),
        );
        svc.register(trigger).unwrap();

        // Non-matching filter: no fire.
        assert!(svc.deliver_event("inbox", "e1", &json!({"kind": "spam"})).is_empty());
        // Wrong topic: no fire.
        assert!(svc.deliver_event("calendar", "e2", &json!({"kind": "important"})).is_empty());

        let created = svc.deliver_event("inbox", "e3", &json!({"kind": "important"}));
        assert_eq!(created.len(), 1);
        // Payload lands on the task input.
        let task = tasks.get(&created[0]).unwrap();
        assert_eq!(task.input["event"]["kind"], "important");

        // Same event id is idempotent.
        assert!(svc.deliver_event("inbox", "e3", &json!({"kind": "important"})).is_empty());
    }

    #[test]
    fn manual_fire_with_same_request_id_is_idempotent() {
        let (_, svc) = service();
        let trigger = Trigger::new("manual", TriggerRule::Manual, spec());
        let id = svc.register(trigger).unwrap();
        let request = Uuid::new_v4();

        assert!(svc.fire_manual(&id, request).unwrap().is_some());
        assert!(svc.fire_manual(&id, request).unwrap().is_none());
        assert!(svc.fire_manual(&id, Uuid::new_v4()).unwrap().is_some());
    }

    #[test]
    fn create_failure_sets_cooldown() {
        let (_, svc) = service();
        let mut bad_spec = spec();
        bad_spec.parent_id = Some(Uuid::new_v4()); // unknown parent: create fails
        let trigger = Trigger::new("broken", TriggerRule::Manual, bad_spec);
        let id = svc.register(trigger).unwrap();

        assert!(svc.fire_manual(&id, Uuid::new_v4()).unwrap().is_none());
        let t = svc.get(&id).unwrap();
        assert_eq!(t.consecutive_failures, 1);
        assert!(t.cooldown_until.is_some());
        assert!(t.last_error.is_some());
    }

    #[test]
    fn backpressure_caps_firing_rate() {
        let tasks = Arc::new(TaskStore::new());
        let probe = Arc::new(TestProbe(AtomicBool::new(true)));
        let svc = TriggerService::new(
            Arc::clone(&tasks),
            probe.clone(),
            TriggerConfig { backpressure_fire_cap: 1, ..Default::default() },
        );

        let past = Utc::now() - chrono::Duration::minutes(1);
        for _ in 0..3 {
            let id = svc.register(cron_trigger("* * * * *")).unwrap();
            svc.triggers.write().get_mut(&id).unwrap().next_fire_at = Some(past);
        }

        // Capped to one firing per tick while backpressured.
        assert_eq!(svc.tick(Utc::now()).len(), 1);

        // Pressure released: the rest fire.
        probe.0.store(false, Ordering::Relaxed);
        assert_eq!(svc.tick(Utc::now()).len(), 2);
    }

    #[test]
    fn fired_keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Arc::new(TaskStore::new());
        let id;
        let instant = Utc::now();
        {
            let svc = TriggerService::with_persistence(
                Arc::clone(&tasks),
                Arc::new(NoLoad),
                TriggerConfig::default(),
                dir.path(),
            );
            id = svc.register(cron_trigger("* * * * *")).unwrap();
            assert!(svc.fire(&id, FireKey::for_instant(id, instant), None).is_some());
            svc.save().unwrap();
        }
        // Restart: replaying the consumed key is dropped (catch-up fires
        // exactly once, not repeatedly).
        let svc = TriggerService::with_persistence(
            Arc::clone(&tasks),
            Arc::new(NoLoad),
            TriggerConfig::default(),
            dir.path(),
        );
        assert!(svc.get(&id).is_some());
        assert!(svc.fire(&id, FireKey::for_instant(id, instant), None).is_none());
    }

    #[test]
    fn fired_keys_bounded_eviction() {
        let mut fired = FiredKeys::new(2);
        assert!(fired.mark("a"));
        assert!(fired.mark("b"));
        assert!(fired.mark("c")); // evicts "a"
        assert!(fired.mark("a")); // "a" is forgotten, consumable again
        assert!(!fired.mark("c"));
    }
}
