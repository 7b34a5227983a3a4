//! The executor — a long-running scheduler service that pulls ready tasks
//! from the store, runs them on a bounded worker pool, and drives every
//! lifecycle transition.
//!
//! The executor is the single authority for task state changes; workers are
//! stateless between tasks and all mutations go through
//! `butler_store::TaskStore::transition`.

pub mod backoff;
pub mod cancel;
pub mod handler;
pub mod ready;
pub mod service;

pub use cancel::{CancelMap, CancelToken};
pub use handler::{BoolEvaluator, HandlerCtx, HandlerOutcome, TaskHandler};
pub use service::{Executor, ExecutorState};
