use std::{collections::BTreeSet, sync::Arc};

use crate::{
    error::PipelineResult,
    model::{BatchId, RawBatch, ThreadMap},
    store::{get_json, DurableStore, StoreLayout},
};

/// Enumerates and loads raw batches written by the upstream collector.
#[derive(Clone)]
pub struct RawBatchSource {
    store: Arc<dyn DurableStore>,
    layout: StoreLayout,
}

impl RawBatchSource {
    pub fn new(store: Arc<dyn DurableStore>, layout: &StoreLayout) -> Self {
        Self {
            store,
            layout: layout.clone(),
        }
    }

    pub async fn list_all(&self) -> PipelineResult<Vec<BatchId>> {
        let keys = self.store.list(&self.layout.raw_prefix()).await?;
        let mut ids: Vec<BatchId> = keys
            .iter()
            .filter_map(|key| self.layout.batch_id_from_key(key))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Batches not in `processed`, oldest first.
    pub async fn list_unprocessed(
        &self,
        processed: &BTreeSet<BatchId>,
    ) -> PipelineResult<Vec<BatchId>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|id| !processed.contains(id))
            .collect())
    }

    pub async fn load(&self, batch_id: &BatchId) -> PipelineResult<RawBatch> {
        let threads: ThreadMap =
            get_json(self.store.as_ref(), &self.layout.raw_key(batch_id)).await?;
        tracing::info!("Loaded batch {} with {} threads", batch_id, threads.len());
        Ok(RawBatch {
            id: batch_id.clone(),
            threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{put_json, MemoryStore, StoreError};
    use crate::error::PipelineError;
    use serde_json::json;

    fn source() -> (MemoryStore, RawBatchSource) {
        let store = MemoryStore::new();
        let source = RawBatchSource::new(Arc::new(store.clone()), &StoreLayout::new("p"));
        (store, source)
    }

    #[tokio::test]
    async fn test_unprocessed_oldest_first() {
        let (store, source) = source();
        for name in ["batch_003.json.gz", "batch_001.json", "batch_002.json.gz", "readme.txt"] {
            store.put(&format!("p/raw/{}", name), b"{}".to_vec()).await.unwrap();
        }

        let processed = BTreeSet::from([BatchId::new("batch_002.json.gz")]);
        let ids = source.list_unprocessed(&processed).await.unwrap();
        assert_eq!(
            ids,
            vec![BatchId::new("batch_001.json"), BatchId::new("batch_003.json.gz")]
        );
    }

    #[tokio::test]
    async fn test_load_either_encoding() {
        let (store, source) = source();
        let body = json!({"t1": [{"subject": "Statement", "attachment_names": ["a.pdf"],
                                   "attachment_payloads": ["JVBERi0="]}],
                          "t0": []});
        put_json(&store, "p/raw/batch_1.json.gz", &body).await.unwrap();
        store
            .put("p/raw/batch_2.json", serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();

        for name in ["batch_1.json.gz", "batch_2.json"] {
            let batch = source.load(&BatchId::new(name)).await.unwrap();
            assert_eq!(batch.threads.len(), 2);
            assert_eq!(batch.threads["t1"][0].subject, "Statement");
        }
    }

    #[tokio::test]
    async fn test_load_corrupt_is_codec_error() {
        let (store, source) = source();
        store.put("p/raw/batch_1.json", b"[1, 2".to_vec()).await.unwrap();
        let err = source.load(&BatchId::new("batch_1.json")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Codec { .. })));
    }
}
