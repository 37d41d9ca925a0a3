use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineResult,
    model::BatchId,
    store::{get_json, put_json, DurableStore, StoreLayout, StoreResult},
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerObject {
    #[serde(default)]
    processed_batches: BTreeSet<BatchId>,
}

/// Record of raw batches that are fully classified.
///
/// A missing or unreadable ledger is a cold start for reads: it only causes
/// re-classification, and classification records are additive. Marking is
/// stricter, since writing back a set built from a failed read would drop
/// every entry already recorded.
#[derive(Clone)]
pub struct BatchLedger {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl BatchLedger {
    pub fn new(store: Arc<dyn DurableStore>, layout: &StoreLayout) -> Self {
        Self {
            store,
            key: layout.ledger_key(),
        }
    }

    pub async fn processed_set(&self) -> BTreeSet<BatchId> {
        match get_json::<LedgerObject>(self.store.as_ref(), &self.key).await {
            Ok(ledger) => ledger.processed_batches,
            Err(e) if e.is_not_found() => {
                tracing::info!("No ledger at {}, starting cold", self.key);
                BTreeSet::new()
            }
            Err(e) => {
                tracing::warn!("Ledger unreadable, treating as empty: {}", e);
                BTreeSet::new()
            }
        }
    }

    /// Current set for a read-modify-write. Only a missing or undecodable
    /// object reads as empty; I/O failures propagate.
    async fn load_for_update(&self) -> StoreResult<BTreeSet<BatchId>> {
        match get_json::<LedgerObject>(self.store.as_ref(), &self.key).await {
            Ok(ledger) => Ok(ledger.processed_batches),
            Err(e) if e.is_not_found() => Ok(BTreeSet::new()),
            Err(e) if !e.is_transient() => {
                tracing::warn!("Overwriting undecodable ledger at {}: {}", self.key, e);
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_processed(&self, batch_id: &BatchId) -> bool {
        self.processed_set().await.contains(batch_id)
    }

    /// Read, add, write. Read I/O failures and write failures propagate.
    pub async fn mark_processed(&self, batch_id: &BatchId) -> PipelineResult<()> {
        let mut processed_batches = self.load_for_update().await?;
        if !processed_batches.insert(batch_id.clone()) {
            tracing::debug!("Batch {} already in ledger", batch_id);
            return Ok(());
        }
        put_json(
            self.store.as_ref(),
            &self.key,
            &LedgerObject { processed_batches },
        )
        .await?;
        tracing::info!("Marked batch {} processed", batch_id);
        Ok(())
    }
}
