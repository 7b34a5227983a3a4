//! Ready-queue ordering and readiness predicates.

use std::cmp::Ordering;

use butler_domain::task::{Task, TaskStatus};

/// Deterministic scheduling order: priority descending, then `created_at`
/// ascending, then id ascending as the stable tiebreak.
pub fn cmp_ready(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// How a pending task's dependencies stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// Every dependency is terminal-ok (or tolerated).
    Satisfied,
    /// At least one dependency is not terminal yet.
    Waiting,
    /// A dependency failed/cancelled and the task does not tolerate it:
    /// the task can never run.
    Blocked,
}

/// Evaluate dependency readiness given the statuses of the dependencies.
pub fn dep_state(dep_statuses: &[TaskStatus], tolerate_failures: bool) -> DepState {
    let mut waiting = false;
    for status in dep_statuses {
        if !status.is_terminal() {
            waiting = true;
            continue;
        }
        if !status.satisfies_dependency(tolerate_failures) {
            return DepState::Blocked;
        }
    }
    if waiting {
        DepState::Waiting
    } else {
        DepState::Satisfied
    }
}
