use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BatchId, EmailRecord, ExtractionResult, ThreadMap};

/// One residue email. Carries the extraction results already paid for, so a
/// resumed thread does not go through OCR again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidueEmail {
    pub thread_id: String,
    #[serde(flatten)]
    pub record: EmailRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extractions: Vec<ExtractionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub original_batch_filename: BatchId,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    /// Threads that qualified for classification when the batch was first loaded.
    pub original_count: usize,
    /// Threads still outstanding.
    pub remaining_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// The single in-flight residue of a raw batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWork {
    pub emails: Vec<ResidueEmail>,
    #[serde(rename = "_batch_metadata")]
    pub batch_metadata: BatchMetadata,
}

/// Cached extraction results of a thread, keyed by (email_index, attachment_index).
pub type ExtractionCache = HashMap<(usize, usize), ExtractionResult>;

impl PendingWork {
    pub fn build(
        batch_id: &BatchId,
        residue: &ThreadMap,
        cached: &HashMap<String, Vec<ExtractionResult>>,
        retry_count: u32,
        original_count: usize,
        last_failure: Option<String>,
    ) -> Self {
        let emails = residue
            .iter()
            .flat_map(|(thread_id, emails)| {
                let thread_cache = cached.get(thread_id);
                emails.iter().enumerate().map(move |(email_index, record)| {
                    let extractions = thread_cache
                        .map(|results| {
                            results
                                .iter()
                                .filter(|r| r.email_index == email_index)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    ResidueEmail {
                        thread_id: thread_id.clone(),
                        record: record.clone(),
                        extractions,
                    }
                })
            })
            .collect();

        Self {
            emails,
            batch_metadata: BatchMetadata {
                original_batch_filename: batch_id.clone(),
                timestamp: Utc::now(),
                retry_count,
                original_count,
                remaining_count: residue.len(),
                last_failure,
            },
        }
    }

    /// Regroup residue emails by thread, keeping first-seen thread order.
    pub fn threads(&self) -> ThreadMap {
        let mut threads = ThreadMap::new();
        for email in &self.emails {
            threads
                .entry(email.thread_id.clone())
                .or_default()
                .push(email.record.clone());
        }
        threads
    }

    /// Cached extraction results per thread, with email indexes renumbered to
    /// match `threads()`.
    pub fn extraction_cache(&self) -> HashMap<String, ExtractionCache> {
        let mut position: HashMap<&str, usize> = HashMap::new();
        let mut caches: HashMap<String, ExtractionCache> = HashMap::new();

        for email in &self.emails {
            let slot = position.entry(email.thread_id.as_str()).or_insert(0);
            let email_index = *slot;
            *slot += 1;

            if email.extractions.is_empty() {
                continue;
            }
            let cache = caches.entry(email.thread_id.clone()).or_default();
            for result in &email.extractions {
                let mut result = result.clone();
                result.email_index = email_index;
                cache.insert((email_index, result.attachment_index), result);
            }
        }
        caches
    }
}
