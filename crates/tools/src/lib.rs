//! Tool registry and dispatcher.
//!
//! Tools are registered once at startup with a name, a JSON-Schema
//! parameter schema, capability flags, and a handler; the registry is
//! immutable afterwards. The dispatcher validates parameters, invokes the
//! handler with a cancellation token and principal context, and applies
//! the idempotent-only automatic retry policy.

pub mod builtins;
pub mod dispatch;
pub mod registry;

pub use dispatch::{DispatchOutcome, Dispatcher, ToolCtx, ToolHandler};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
