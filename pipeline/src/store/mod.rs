//! Durable Store
//!
//! Object storage abstraction used for every piece of pipeline state: raw
//! batches, the ledger, the pending-work slot, quarantine and results.
//! Every write is last-writer-wins.

pub mod codec;
mod fs;
mod layout;
mod memory;
mod retrying;

pub use fs::FsStore;
pub use layout::StoreLayout;
pub use memory::MemoryStore;
pub use retrying::RetryingStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode '{key}': {message}")]
    Codec { key: String, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }

    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Fully replaces the object at `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Keys under `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Read and decode a JSON object, compressed or not.
pub async fn get_json<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> StoreResult<T> {
    let bytes = store.get(key).await?;
    codec::decode_json(&bytes).map_err(|message| StoreError::Codec {
        key: key.to_string(),
        message,
    })
}

/// Encode as gzip-compressed JSON and write.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let bytes = codec::encode_json(value).map_err(|message| StoreError::Codec {
        key: key.to_string(),
        message,
    })?;
    store.put(key, bytes).await
}
