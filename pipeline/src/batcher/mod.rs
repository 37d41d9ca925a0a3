//! Dynamic Classification Batcher
//!
//! Packs per-thread extraction output into token-bounded classification units
//! and drives the classification calls under a bounded fan-out. A cheap
//! relevance screen can run first to cut cost.

mod packing;
mod relevance;
mod runner;

pub use packing::{pack, pack_items, ClassificationUnit, Tier, UnitItem};
pub use relevance::{RelevanceFilter, Screened};
pub use runner::{BatchOutcome, ClassificationRunner};
