//! Per-task cancellation tokens with group fan-out.
//!
//! Each claimed task gets a `CancelToken`. Calling `cancel()` on it signals
//! the worker to stop cooperatively at its next suspension point.
//!
//! **Groups** support cascading cancellation: children register in their
//! parent task's cancel group, so interrupting a parent signals every
//! running descendant immediately (the store-side cascade transitions the
//! rest).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation token checked by workers and passed to tool handlers.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active cancellation tokens per task, with group support for
/// cascading parent -> child cancellation.
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
    /// parent task id -> running child task ids.
    groups: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new cancel token for a task.
    pub fn register(&self, task_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(task_id, token.clone());
        token
    }

    /// Cancel a running task and every child in its cancel group.
    /// Returns true if a token was found for the task itself.
    pub fn cancel(&self, task_id: &Uuid) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(task_id) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(task_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(child_token) = tokens.get(child) {
                    child_token.cancel();
                }
            }
        }

        found
    }

    /// Remove the token for a task (called when its worker finishes).
    pub fn remove(&self, task_id: &Uuid) {
        self.tokens.lock().remove(task_id);
        self.groups.lock().remove(task_id);
    }

    pub fn is_active(&self, task_id: &Uuid) -> bool {
        self.tokens.lock().contains_key(task_id)
    }

    /// Register a child in a parent's cancel group.
    pub fn add_to_group(&self, parent_id: Uuid, child_id: Uuid) {
        self.groups.lock().entry(parent_id).or_default().insert(child_id);
    }

    pub fn remove_from_group(&self, parent_id: &Uuid, child_id: &Uuid) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent_id) {
            children.remove(child_id);
            if children.is_empty() {
                groups.remove(parent_id);
            }
        }
    }
}
