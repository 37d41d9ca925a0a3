use std::sync::Arc;

use crate::{
    error::PipelineResult,
    model::ClassificationRecord,
    store::{get_json, put_json, DurableStore, StoreLayout},
};

/// Append-only list of classification records.
#[derive(Clone)]
pub struct ResultsStore {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl ResultsStore {
    pub fn new(store: Arc<dyn DurableStore>, layout: &StoreLayout) -> Self {
        Self {
            store,
            key: layout.results_key(),
        }
    }

    /// Missing list reads as empty. Any other read failure is an error,
    /// since writing back would drop the records already stored.
    pub async fn load(&self) -> PipelineResult<Vec<ClassificationRecord>> {
        match get_json(self.store.as_ref(), &self.key).await {
            Ok(records) => Ok(records),
            Err(e) if e.is_not_found() => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    /// Read full list, append, write full list. Returns the new total.
    pub async fn append(&self, records: &[ClassificationRecord]) -> PipelineResult<usize> {
        if records.is_empty() {
            return Ok(self.load().await?.len());
        }
        let mut all = self.load().await?;
        all.extend_from_slice(records);
        put_json(self.store.as_ref(), &self.key, &all).await?;
        tracing::info!(
            "Appended {} classification records ({} total)",
            records.len(),
            all.len()
        );
        Ok(all.len())
    }
}
