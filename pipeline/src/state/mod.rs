//! Durable pipeline state built on the object store: which batches are done,
//! the deferred residue slot, the raw batch inbox, quarantine and results.

mod batch_source;
mod ledger;
mod pending_slot;
mod quarantine;
mod results;

pub use batch_source::RawBatchSource;
pub use ledger::BatchLedger;
pub use pending_slot::PendingSlot;
pub use quarantine::{Quarantine, QuarantineRecord, FAILED_MAX_RETRIES};
pub use results::ResultsStore;
