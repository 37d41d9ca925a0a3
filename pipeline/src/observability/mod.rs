//! Observability Module
//!
//! Per-invocation counters and the summary table logged when an invocation ends.

mod invocation_tracker;
mod table;

pub use invocation_tracker::{InvocationOutcome, InvocationReport, InvocationTracker};
