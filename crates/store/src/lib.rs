//! Persistent state for the Butler core: the task graph, workflow
//! templates, and the usage ledger.
//!
//! The task store is the single shared mutable state of the system; every
//! status change goes through [`TaskStore::transition`], which enforces the
//! lifecycle invariants and broadcasts a [`TaskEvent`] to subscribers.

pub mod persist;
pub mod tasks;
pub mod usage;
pub mod workflows;

pub use tasks::{TaskEvent, TaskStore, TransitionFields};
pub use usage::UsageStore;
pub use workflows::WorkflowStore;
