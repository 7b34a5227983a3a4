//! Shared domain types for the Butler core.
//!
//! Everything here is pure data: task and workflow models, trigger rules,
//! conversation transcripts, tool definitions, knowledge items, streaming
//! event types, the error taxonomy, and configuration. No I/O, no runtime
//! state — those live in the store/executor/runtime crates.

pub mod config;
pub mod conversation;
pub mod error;
pub mod knowledge;
pub mod stream;
pub mod task;
pub mod tool;
pub mod trigger;
pub mod usage;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
pub use task::{Condition, ExecutionMode, Task, TaskKind, TaskSpec, TaskStatus};
