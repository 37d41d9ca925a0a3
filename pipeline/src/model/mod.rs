pub mod classification;
pub mod extraction;
pub mod pending_work;
pub mod raw_batch;

pub use classification::{
    Category, Classification, ClassificationRecord, DocumentFields, RawClassification,
};
pub use extraction::{ExtractionResult, Provenance, ThreadDocument};
pub use pending_work::{BatchMetadata, PendingWork, ResidueEmail};
pub use raw_batch::{Attachment, BatchId, EmailRecord, RawBatch, ThreadMap};

use serde::{Deserialize, Deserializer};

/// Treat an explicit `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
