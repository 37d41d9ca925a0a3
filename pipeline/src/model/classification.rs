use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use super::{extraction::Provenance, null_as_default, raw_batch::BatchId, ThreadDocument};

/// Fixed document taxonomy. Anything the model answers outside of it is `NA`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Category {
    BankStatement,
    CreditCardStatement,
    Invoice,
    Receipt,
    Payslip,
    TaxDocument,
    InsurancePolicy,
    UtilityBill,
    LoanDocument,
    InvestmentStatement,
    PensionStatement,
    IdentityDocument,
    Contract,
    #[serde(rename = "NA")]
    #[strum(serialize = "NA")]
    NA,
}

impl Category {
    /// Labels offered to the model, excluding `NA`.
    pub fn labels() -> Vec<&'static str> {
        Category::iter()
            .filter(|c| *c != Category::NA)
            .map(|c| <&'static str>::from(c))
            .collect()
    }

    fn from_label(label: &str) -> Category {
        let label = label.trim().replace([' ', '-'], "_");
        label.parse().unwrap_or(Category::NA)
    }
}

/// One entry as the model returns it. Every field may be missing or null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClassification {
    #[serde(default, deserialize_with = "null_as_default")]
    pub thread_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub document_date: Option<String>,
    #[serde(default)]
    pub amount: Option<serde_json::Value>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub account_reference: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFields {
    pub issuer: Option<String>,
    pub document_date: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub account_reference: Option<String>,
}

/// Normalized classifier output for one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub thread_id: String,
    pub category: Category,
    pub fields: DocumentFields,
    pub summary: String,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !is_null_word(v))
}

fn is_null_word(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "null" | "none" | "n/a" | "na" | "unknown"
    )
}

impl RawClassification {
    /// Single ingress normalization: unknown, empty and null-like labels
    /// become `NA`, empty structured fields become `None`.
    pub fn normalize(self) -> Classification {
        let category = clean(self.category)
            .map(|label| Category::from_label(&label))
            .unwrap_or(Category::NA);

        let amount = match self.amount {
            Some(serde_json::Value::String(s)) => clean(Some(s)),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Classification {
            thread_id: self.thread_id.trim().to_string(),
            category,
            fields: DocumentFields {
                issuer: clean(self.issuer),
                document_date: clean(self.document_date),
                amount,
                currency: clean(self.currency),
                account_reference: clean(self.account_reference),
            },
            summary: clean(self.summary).unwrap_or_default(),
        }
    }
}

/// Persisted output for one thread. Appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub thread_id: String,
    pub category: Category,
    #[serde(flatten)]
    pub fields: DocumentFields,
    pub summary: String,
    pub sender: String,
    pub subject: String,
    pub email_date: String,
    pub attachment_names: Vec<String>,
    pub provenance: Vec<Provenance>,
    pub batch_id: BatchId,
    pub classified_at: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn new(batch_id: &BatchId, document: &ThreadDocument, result: Classification) -> Self {
        Self {
            thread_id: document.thread_id.clone(),
            category: result.category,
            fields: result.fields,
            summary: result.summary,
            sender: document.sender.clone(),
            subject: document.subject.clone(),
            email_date: document.date.clone(),
            attachment_names: document.attachment_names(),
            provenance: document.provenances(),
            batch_id: batch_id.clone(),
            classified_at: Utc::now(),
        }
    }
}
