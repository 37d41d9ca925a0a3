use std::sync::Arc;

use async_trait::async_trait;
use lib_utils::{retry, RetryPolicy};

use super::{DurableStore, StoreError, StoreResult};

/// Retries transient I/O failures of the wrapped store with backoff.
/// Missing objects and decode failures are returned on the first attempt.
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn DurableStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn DurableStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl DurableStore for RetryingStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        retry(&self.policy, "store_get", StoreError::is_transient, |_| {
            self.inner.get(key)
        })
        .await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        retry(&self.policy, "store_put", StoreError::is_transient, |_| {
            self.inner.put(key, bytes.clone())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        retry(&self.policy, "store_delete", StoreError::is_transient, |_| {
            self.inner.delete(key)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        retry(&self.policy, "store_list", StoreError::is_transient, |_| {
            self.inner.list(prefix)
        })
        .await
    }
}
