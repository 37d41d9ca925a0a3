use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::null_as_default;

/// Name of a raw batch object, e.g. `batch_20240105T120000Z.json.gz`.
/// Producers embed a sortable timestamp, so string order is age order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name without the `.json` / `.json.gz` suffix.
    pub fn stem(&self) -> &str {
        self.0
            .strip_suffix(".json.gz")
            .or_else(|| self.0.strip_suffix(".json"))
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub date: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub from: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subject: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachment_names: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachment_payloads: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Attachment<'a> {
    pub index: usize,
    pub name: &'a str,
    pub payload: &'a str,
}

impl EmailRecord {
    /// Names and payloads paired by position. An unpaired tail on either side
    /// is dropped.
    pub fn attachments(&self) -> Vec<Attachment<'_>> {
        let names = self.attachment_names.len();
        let payloads = self.attachment_payloads.len();
        if names != payloads {
            tracing::warn!(
                "Attachment count mismatch on '{}': {} names, {} payloads, pairing {}",
                self.subject,
                names,
                payloads,
                names.min(payloads)
            );
        }

        self.attachment_names
            .iter()
            .zip(self.attachment_payloads.iter())
            .enumerate()
            .map(|(index, (name, payload))| Attachment {
                index,
                name,
                payload,
            })
            .collect()
    }

    /// True when at least one paired attachment decodes to a non-empty payload.
    pub fn has_decodable_attachment(&self) -> bool {
        self.attachments()
            .iter()
            .any(|a| lib_utils::b64::decode_lenient(a.payload).is_ok_and(|b| !b.is_empty()))
    }
}

/// thread_id -> emails, in producer order.
pub type ThreadMap = IndexMap<String, Vec<EmailRecord>>;

#[derive(Debug, Clone)]
pub struct RawBatch {
    pub id: BatchId,
    pub threads: ThreadMap,
}

impl RawBatch {
    /// Only the threads with at least one decodable attachment.
    pub fn qualifying_threads(&self) -> ThreadMap {
        self.threads
            .iter()
            .filter(|(_, emails)| emails.iter().any(EmailRecord::has_decodable_attachment))
            .map(|(id, emails)| (id.clone(), emails.clone()))
            .collect()
    }
}
