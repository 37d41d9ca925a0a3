use std::sync::Arc;

use crate::{
    error::PipelineResult,
    model::PendingWork,
    store::{get_json, put_json, DurableStore, StoreLayout},
};

/// Single-slot holder for deferred work, stored under one fixed key.
///
/// Objects left by older producers under the `pending/` prefix are still
/// picked up: the first one found is moved into the fixed key.
#[derive(Clone)]
pub struct PendingSlot {
    store: Arc<dyn DurableStore>,
    key: String,
    legacy_prefix: String,
}

impl PendingSlot {
    pub fn new(store: Arc<dyn DurableStore>, layout: &StoreLayout) -> Self {
        Self {
            store,
            key: layout.pending_key(),
            legacy_prefix: layout.legacy_pending_prefix(),
        }
    }

    pub async fn peek(&self) -> PipelineResult<Option<PendingWork>> {
        match get_json::<PendingWork>(self.store.as_ref(), &self.key).await {
            Ok(work) => return Ok(Some(work)),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                // Residue is recoverable: the original batch is not in the ledger yet
                tracing::warn!("Pending slot unreadable, ignoring it: {}", e);
                return Ok(None);
            }
        }

        self.adopt_legacy().await
    }

    async fn adopt_legacy(&self) -> PipelineResult<Option<PendingWork>> {
        let keys = match self.store.list(&self.legacy_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Could not list {}: {}", self.legacy_prefix, e);
                return Ok(None);
            }
        };
        let Some(first) = keys.first() else {
            return Ok(None);
        };
        if keys.len() > 1 {
            tracing::warn!(
                "Found {} pending objects under {}, using {}",
                keys.len(),
                self.legacy_prefix,
                first
            );
        }

        let work = match get_json::<PendingWork>(self.store.as_ref(), first).await {
            Ok(work) => work,
            Err(e) => {
                tracing::warn!("Legacy pending object {} unreadable: {}", first, e);
                return Ok(None);
            }
        };

        self.save(&work).await?;
        self.store.delete(first).await?;
        tracing::info!("Moved legacy pending object {} into {}", first, self.key);
        Ok(Some(work))
    }

    /// Overwrites whatever is in the slot.
    pub async fn save(&self, work: &PendingWork) -> PipelineResult<()> {
        put_json(self.store.as_ref(), &self.key, work).await?;
        Ok(())
    }

    pub async fn clear(&self) -> PipelineResult<()> {
        self.store.delete(&self.key).await?;
        Ok(())
    }
}
