pub mod mistral;

use std::sync::LazyLock;

use async_trait::async_trait;
use indoc::formatdoc;
use itertools::Itertools;
use serde::Deserialize;

use crate::{
    batcher::ClassificationUnit,
    error::PipelineResult,
    model::{Category, RawClassification},
};

/// Cheap screening input: subject plus the start of the extracted text.
#[derive(Debug, Clone)]
pub struct RelevanceItem {
    pub thread_id: String,
    pub subject: String,
    pub text_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelevanceVerdict {
    pub thread_id: String,
    #[serde(default = "default_relevant")]
    pub relevant: bool,
}

fn default_relevant() -> bool {
    true
}

/// The language model behind the pipeline, as an opaque function.
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    /// One entry per thread of `unit`.
    async fn classify(&self, unit: &ClassificationUnit) -> PipelineResult<Vec<RawClassification>>;

    /// Relevance verdicts for a group of threads.
    async fn screen(&self, items: &[RelevanceItem]) -> PipelineResult<Vec<RelevanceVerdict>>;
}

pub fn classification_system_prompt() -> String {
    let taxonomy = Category::labels()
        .iter()
        .map(|label| format!("  • \"{}\"", label))
        .join("\n");

    formatdoc! {r#"
        You are a document classification engine for financial and identity paperwork.
        Each document is the text extracted from the PDF attachments of one email thread.

        Instructions:
        Read the sender, subject and document text.
        Choose the single best category from the taxonomy below.
        If no category clearly fits, use "NA". Do not invent categories.
        Extract issuer, document_date (YYYY-MM-DD), amount, currency and account_reference when present, otherwise null.
        Write a one sentence summary.

        Taxonomy (authoritative):
        {taxonomy}

        Respond only with a JSON object {{"results": [...]}} holding exactly one entry per thread_id given,
        each with the keys thread_id, category, issuer, document_date, amount, currency, account_reference and summary.
        Do not provide explanations."#
    }
}

pub static CLASSIFICATION_PROMPT_TOKENS: LazyLock<usize> =
    LazyLock::new(|| tokenizer::token_count(&classification_system_prompt()));

pub fn classification_user_prompt(unit: &ClassificationUnit) -> String {
    let documents = unit
        .items
        .iter()
        .map(|item| {
            formatdoc! {r#"
                <document thread_id="{}">
                <sender>{}</sender>
                <subject>{}</subject>
                <text>{}</text>
                </document>"#,
                item.thread_id,
                item.sender,
                item.subject,
                item.text,
            }
        })
        .join("\n");

    formatdoc! {r#"
        Classify the following {} document(s).

        {documents}"#,
        unit.items.len()
    }
}

pub fn relevance_system_prompt() -> String {
    formatdoc! {r#"
        You screen email attachments before an expensive classification step.
        A thread is relevant when its attachment could be a financial or identity document
        (statements, invoices, receipts, payslips, tax forms, policies, bills, contracts, IDs).
        Marketing, newsletters, tickets, photos and personal letters are not relevant.
        When unsure, answer relevant.

        Respond only with a JSON object {{"results": [{{"thread_id": "...", "relevant": true}}]}}
        holding one entry per thread_id given."#
    }
}

pub fn relevance_user_prompt(items: &[RelevanceItem]) -> String {
    items
        .iter()
        .map(|item| {
            formatdoc! {r#"
                <thread id="{}">
                <subject>{}</subject>
                <text>{}</text>
                </thread>"#,
                item.thread_id,
                item.subject,
                item.text_prefix,
            }
        })
        .join("\n")
}
