use std::collections::HashMap;

use futures::{future::join_all, stream, StreamExt};

use crate::{
    deadline::Deadline,
    extract::ExtractionCascade,
    model::{pending_work::ExtractionCache, EmailRecord, ExtractionResult, ThreadDocument, ThreadMap},
};

#[derive(Debug, Default)]
pub struct ExtractedThreads {
    /// In input order.
    pub documents: Vec<ThreadDocument>,
    /// Threads whose extraction was not started before the deadline.
    pub not_started: Vec<String>,
    pub reused: usize,
}

enum ThreadExtraction {
    Done { document: ThreadDocument, reused: usize },
    NotStarted(String),
}

fn needs_work(emails: &[EmailRecord], cache: Option<&ExtractionCache>) -> bool {
    emails.iter().enumerate().any(|(email_index, email)| {
        email
            .attachments()
            .iter()
            .any(|a| !cache.is_some_and(|c| c.contains_key(&(email_index, a.index))))
    })
}

async fn extract_thread(
    cascade: &ExtractionCascade,
    thread_id: &str,
    emails: &[EmailRecord],
    cache: Option<&ExtractionCache>,
    max_thread_chars: usize,
    deadline: &Deadline,
) -> ThreadExtraction {
    if deadline.expired() && needs_work(emails, cache) {
        return ThreadExtraction::NotStarted(thread_id.to_string());
    }

    let mut reused = 0;
    let mut pending = Vec::new();
    let mut results: Vec<ExtractionResult> = Vec::new();
    for (email_index, email) in emails.iter().enumerate() {
        for attachment in email.attachments() {
            match cache.and_then(|c| c.get(&(email_index, attachment.index))) {
                Some(cached) => {
                    reused += 1;
                    results.push(cached.clone());
                }
                None => pending.push(cascade.extract(email_index, attachment, deadline)),
            }
        }
    }
    results.extend(join_all(pending).await);
    results.sort_by_key(|r| (r.email_index, r.attachment_index));

    ThreadExtraction::Done {
        document: ThreadDocument::new(thread_id.to_string(), emails, results, max_thread_chars),
        reused,
    }
}

/// Extract every attachment of every thread, at most `concurrency` threads at
/// a time. Cached results are reused without touching the cascade.
pub async fn extract_threads(
    cascade: &ExtractionCascade,
    threads: &ThreadMap,
    cache: &HashMap<String, ExtractionCache>,
    concurrency: usize,
    max_thread_chars: usize,
    deadline: &Deadline,
) -> ExtractedThreads {
    let extracted: Vec<ThreadExtraction> = stream::iter(threads.iter())
        .map(|(thread_id, emails)| {
            extract_thread(
                cascade,
                thread_id,
                emails,
                cache.get(thread_id),
                max_thread_chars,
                deadline,
            )
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut out = ExtractedThreads::default();
    for item in extracted {
        match item {
            ThreadExtraction::Done { document, reused } => {
                out.reused += reused;
                out.documents.push(document);
            }
            ThreadExtraction::NotStarted(thread_id) => out.not_started.push(thread_id),
        }
    }

    if !out.not_started.is_empty() {
        tracing::info!(
            "Budget exhausted during extraction, {} threads not started",
            out.not_started.len()
        );
    }
    if out.reused > 0 {
        tracing::debug!("Reused {} cached extractions", out.reused);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use lib_utils::RetryPolicy;

    use super::*;
    use crate::{
        extract::{CloudOcr, ExtractionPools},
        model::Provenance,
        pipeline_config::ExtractionConfig,
        testing::{email, native_payload, scanned_payload, thread_map, FakeNative, FakeOcr},
    };

    fn cascade(cloud: Arc<FakeOcr>) -> ExtractionCascade {
        ExtractionCascade::new(
            ExtractionConfig::default(),
            Arc::new(FakeNative),
            Some(cloud as Arc<dyn CloudOcr>),
            None,
            ExtractionPools::new(2, 2),
            RetryPolicy::once(),
            Duration::from_secs(1),
        )
    }

    fn threads() -> ThreadMap {
        thread_map(vec![
            (
                "t1".to_string(),
                vec![
                    email("first", &[("a.pdf", native_payload("alpha"))]),
                    email("second", &[("b.pdf", scanned_payload()), ("c.pdf", scanned_payload())]),
                ],
            ),
            ("t2".to_string(), vec![email("only", &[("d.pdf", scanned_payload())])]),
        ])
    }

    #[tokio::test]
    async fn test_extracts_in_input_order() {
        let ocr = Arc::new(FakeOcr::returning("scanned"));
        let out = extract_threads(
            &cascade(ocr.clone()),
            &threads(),
            &HashMap::new(),
            4,
            10_000,
            &Deadline::new(Duration::from_secs(10)),
        )
        .await;

        assert_eq!(out.documents.len(), 2);
        assert_eq!(out.documents[0].thread_id, "t1");
        let names = out.documents[0].attachment_names();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);
        assert_eq!(out.documents[0].sender, "billing@example.com");
        assert_eq!(ocr.calls(), 4);
    }

    #[tokio::test]
    async fn test_cached_results_skip_the_cascade() {
        let ocr = Arc::new(FakeOcr::returning("fresh"));
        let mut cache: HashMap<String, ExtractionCache> = HashMap::new();
        cache.entry("t2".to_string()).or_default().insert(
            (0, 0),
            ExtractionResult {
                email_index: 0,
                attachment_index: 0,
                attachment_name: "d.pdf".to_string(),
                text: "cached".to_string(),
                provenance: Provenance::CloudOcr,
                truncated: false,
            },
        );

        let out = extract_threads(
            &cascade(ocr.clone()),
            &threads(),
            &cache,
            4,
            10_000,
            &Deadline::new(Duration::from_secs(10)),
        )
        .await;

        assert_eq!(out.reused, 1);
        assert_eq!(ocr.calls(), 3);
        assert!(out.documents[1].text.contains("cached"));
    }

    #[tokio::test]
    async fn test_expired_deadline_starts_only_cached_threads() {
        let ocr = Arc::new(FakeOcr::returning("fresh"));
        let mut cache: HashMap<String, ExtractionCache> = HashMap::new();
        cache.entry("t2".to_string()).or_default().insert(
            (0, 0),
            ExtractionResult::error(0, 0, "d.pdf", "not_pdf"),
        );

        let out = extract_threads(
            &cascade(ocr.clone()),
            &threads(),
            &cache,
            4,
            10_000,
            &Deadline::new(Duration::ZERO),
        )
        .await;

        assert_eq!(out.not_started, vec!["t1".to_string()]);
        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.documents[0].thread_id, "t2");
        assert_eq!(ocr.calls(), 0);
    }
}
