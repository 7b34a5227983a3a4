//! Trigger & scheduling service: cron, interval, event, and manual
//! triggers that enqueue tasks with at-most-once fire-key semantics.

pub mod cron;
pub mod service;

pub use service::{LoadProbe, NoLoad, TriggerService};
