use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineResult,
    model::{BatchId, ResidueEmail},
    store::{put_json, DurableStore, StoreLayout},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub status: String,
    pub original_batch_filename: BatchId,
    pub retry_count: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub emails: Vec<ResidueEmail>,
}

pub const FAILED_MAX_RETRIES: &str = "failed_max_retries";

/// Terminal location for residue that exhausted its retry ceiling.
#[derive(Clone)]
pub struct Quarantine {
    store: Arc<dyn DurableStore>,
    layout: StoreLayout,
}

impl Quarantine {
    pub fn new(store: Arc<dyn DurableStore>, layout: &StoreLayout) -> Self {
        Self {
            store,
            layout: layout.clone(),
        }
    }

    pub async fn put(
        &self,
        batch_id: &BatchId,
        emails: Vec<ResidueEmail>,
        retry_count: u32,
        reason: &str,
    ) -> PipelineResult<String> {
        let key = self.layout.quarantine_key(batch_id);
        let record = QuarantineRecord {
            status: FAILED_MAX_RETRIES.to_string(),
            original_batch_filename: batch_id.clone(),
            retry_count,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            emails,
        };
        put_json(self.store.as_ref(), &key, &record).await?;
        tracing::warn!(
            "Quarantined {} residue emails of {} after {} attempts ({}) at {}",
            record.emails.len(),
            batch_id,
            retry_count,
            reason,
            key
        );
        Ok(key)
    }
}
