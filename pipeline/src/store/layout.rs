use crate::model::BatchId;

/// Object keys of one logical pipeline, all under a shared prefix.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    prefix: String,
}

impl StoreLayout {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };
        Self { prefix }
    }

    pub fn raw_prefix(&self) -> String {
        format!("{}raw/", self.prefix)
    }

    pub fn raw_key(&self, batch_id: &BatchId) -> String {
        format!("{}{}", self.raw_prefix(), batch_id)
    }

    /// Batch name from a key under `raw_prefix`, if it looks like a batch object.
    pub fn batch_id_from_key(&self, key: &str) -> Option<BatchId> {
        let name = key.strip_prefix(&self.raw_prefix())?;
        let is_json = name.ends_with(".json") || name.ends_with(".json.gz");
        (is_json && !name.contains('/')).then(|| BatchId::new(name))
    }

    pub fn ledger_key(&self) -> String {
        format!("{}state/processed_batches.json.gz", self.prefix)
    }

    pub fn pending_key(&self) -> String {
        format!("{}state/pending_work.json.gz", self.prefix)
    }

    /// Directory used by older producers for the pending slot.
    pub fn legacy_pending_prefix(&self) -> String {
        format!("{}pending/", self.prefix)
    }

    pub fn quarantine_key(&self, batch_id: &BatchId) -> String {
        format!("{}quarantine/{}.json.gz", self.prefix, batch_id.stem())
    }

    pub fn results_key(&self) -> String {
        format!("{}classified/results.json.gz", self.prefix)
    }
}
