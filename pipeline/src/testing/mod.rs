//! Fakes and fixtures shared by unit and scenario tests.
#![cfg(test)]

use std::{
    collections::HashSet,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    batcher::ClassificationUnit,
    error::{PipelineError, PipelineResult},
    extract::{CloudOcr, LocalOcr, NativeExtractor},
    model::{EmailRecord, RawClassification, ThreadDocument, ThreadMap},
    orchestrator::ReinvocationSignal,
    prompt::{DocumentClassifier, RelevanceItem, RelevanceVerdict},
    store::{put_json, DurableStore, MemoryStore, StoreError, StoreLayout, StoreResult},
};

// ============================================================================
// Payloads
// ============================================================================

/// A "PDF" whose text layer `FakeNative` reads back as `text`.
pub fn native_payload(text: &str) -> String {
    lib_utils::b64::encode(format!("%PDF-1.4\nTEXT:{}", text).as_bytes())
}

/// A PDF with no text layer.
pub fn scanned_payload() -> String {
    lib_utils::b64::encode(b"%PDF-1.4\n%scanned image only")
}

/// Valid base64 of bytes that are not a PDF.
pub fn corrupt_payload() -> String {
    lib_utils::b64::encode(b"GIF89a definitely not a document")
}

/// Reads the marker text `FakeNative` understands out of fixture PDFs.
pub struct FakeNative;

impl NativeExtractor for FakeNative {
    fn first_page_text(&self, pdf: &[u8]) -> PipelineResult<String> {
        let content = String::from_utf8_lossy(pdf);
        if content.contains("PANIC") {
            panic!("parser blew up");
        }
        if content.contains("BROKEN") {
            return Err(PipelineError::Ocr("broken xref table".to_string()));
        }
        Ok(content
            .split_once("TEXT:")
            .map(|(_, text)| text.to_string())
            .unwrap_or_default())
    }
}

// ============================================================================
// OCR
// ============================================================================

enum OcrMode {
    Returning(String),
    Failing,
    Flaky { failures: usize, text: String },
}

pub struct FakeOcr {
    mode: OcrMode,
    calls: AtomicUsize,
}

impl FakeOcr {
    pub fn returning(text: &str) -> Self {
        Self::with_mode(OcrMode::Returning(text.to_string()))
    }

    /// Non-retryable engine failure on every call.
    pub fn failing() -> Self {
        Self::with_mode(OcrMode::Failing)
    }

    /// Rate limited for the first `failures` calls, then succeeds.
    pub fn flaky(failures: usize, text: &str) -> Self {
        Self::with_mode(OcrMode::Flaky {
            failures,
            text: text.to_string(),
        })
    }

    fn with_mode(mode: OcrMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> PipelineResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            OcrMode::Returning(text) => Ok(text.clone()),
            OcrMode::Failing => Err(PipelineError::Ocr("engine failure".to_string())),
            OcrMode::Flaky { failures, text } => {
                if call < *failures {
                    Err(PipelineError::RateLimited("slow down".to_string()))
                } else {
                    Ok(text.clone())
                }
            }
        }
    }
}

#[async_trait]
impl CloudOcr for FakeOcr {
    async fn prepare(&self, pdf: &[u8]) -> PipelineResult<Vec<u8>> {
        Ok(pdf.to_vec())
    }

    async fn ocr_prepared(&self, _upload: &[u8]) -> PipelineResult<String> {
        self.answer()
    }
}

#[async_trait]
impl LocalOcr for FakeOcr {
    async fn ocr_first_page(&self, _pdf: &[u8]) -> PipelineResult<String> {
        self.answer()
    }
}

// ============================================================================
// Classifier
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClassifierMode {
    Echo,
    Hang,
    Fail,
}

/// Scripted classifier. Echo mode answers every thread as an invoice.
pub struct FakeClassifier {
    mode: ClassifierMode,
    failing_for: HashSet<String>,
    irrelevant: HashSet<String>,
    classify_calls: AtomicUsize,
    screen_calls: AtomicUsize,
    classified: Mutex<Vec<String>>,
}

impl FakeClassifier {
    fn with_mode(mode: ClassifierMode) -> Self {
        Self {
            mode,
            failing_for: HashSet::new(),
            irrelevant: HashSet::new(),
            classify_calls: AtomicUsize::new(0),
            screen_calls: AtomicUsize::new(0),
            classified: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::with_mode(ClassifierMode::Echo)
    }

    /// Never answers; callers hit their timeout.
    pub fn hanging() -> Self {
        Self::with_mode(ClassifierMode::Hang)
    }

    pub fn failing() -> Self {
        Self::with_mode(ClassifierMode::Fail)
    }

    /// Fail any unit that contains one of `ids`.
    pub fn failing_for(mut self, ids: &[&str]) -> Self {
        self.failing_for = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn irrelevant(mut self, ids: &[&str]) -> Self {
        self.irrelevant = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn screen_calls(&self) -> usize {
        self.screen_calls.load(Ordering::SeqCst)
    }

    /// Every thread id ever sent for classification, in call order.
    pub fn classified_ids(&self) -> Vec<String> {
        self.classified
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentClassifier for FakeClassifier {
    async fn classify(&self, unit: &ClassificationUnit) -> PipelineResult<Vec<RawClassification>> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut ids) = self.classified.lock() {
            ids.extend(unit.thread_ids());
        }

        match self.mode {
            ClassifierMode::Hang => std::future::pending::<()>().await,
            ClassifierMode::Fail => return Err(PipelineError::Api("scripted failure".to_string())),
            ClassifierMode::Echo => {}
        }
        if unit
            .items
            .iter()
            .any(|item| self.failing_for.contains(&item.thread_id))
        {
            return Err(PipelineError::Api("scripted failure".to_string()));
        }

        Ok(unit
            .items
            .iter()
            .map(|item| RawClassification {
                thread_id: item.thread_id.clone(),
                category: Some("invoice".to_string()),
                issuer: Some(item.sender.clone()),
                summary: Some(format!("Invoice: {}", item.subject)),
                ..Default::default()
            })
            .collect())
    }

    async fn screen(&self, items: &[RelevanceItem]) -> PipelineResult<Vec<RelevanceVerdict>> {
        self.screen_calls.fetch_add(1, Ordering::SeqCst);
        if self.mode == ClassifierMode::Hang {
            std::future::pending::<()>().await;
        }
        Ok(items
            .iter()
            .map(|item| RelevanceVerdict {
                thread_id: item.thread_id.clone(),
                relevant: !self.irrelevant.contains(&item.thread_id),
            })
            .collect())
    }
}

// ============================================================================
// Re-invocation signal
// ============================================================================

#[derive(Default)]
pub struct FakeSignal {
    sent: Mutex<Vec<String>>,
}

impl FakeSignal {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReinvocationSignal for FakeSignal {
    async fn signal(&self, pipeline_id: &str) -> PipelineResult<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(pipeline_id.to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

/// A `MemoryStore` whose next N gets or puts fail with a timed-out I/O error.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_gets: Arc<AtomicUsize>,
    failing_puts: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize, key: &str) -> StoreResult<()> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::io(
                key,
                io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        Self::take_failure(&self.failing_gets, key)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        Self::take_failure(&self.failing_puts, key)?;
        self.inner.put(key, bytes).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn email(subject: &str, attachments: &[(&str, String)]) -> EmailRecord {
    EmailRecord {
        body: format!("Please find attached: {}", subject),
        date: "2024-03-01T09:00:00Z".to_string(),
        from: "billing@example.com".to_string(),
        subject: subject.to_string(),
        attachment_names: attachments.iter().map(|(n, _)| n.to_string()).collect(),
        attachment_payloads: attachments.iter().map(|(_, p)| p.clone()).collect(),
    }
}

/// A thread with one native-text PDF.
pub fn native_thread(id: &str) -> (String, Vec<EmailRecord>) {
    (
        id.to_string(),
        vec![email(
            &format!("Invoice {}", id),
            &[("invoice.pdf", native_payload(&format!("Invoice for {}", id)))],
        )],
    )
}

pub fn thread_map(threads: Vec<(String, Vec<EmailRecord>)>) -> ThreadMap {
    threads.into_iter().collect()
}

pub fn thread_document(thread_id: &str, text: &str) -> ThreadDocument {
    ThreadDocument {
        thread_id: thread_id.to_string(),
        sender: "billing@example.com".to_string(),
        subject: format!("Subject {}", thread_id),
        date: "2024-03-01".to_string(),
        text: text.to_string(),
        extractions: Vec::new(),
    }
}

/// Store `threads` as a gzip raw batch named `name`.
pub async fn put_raw_batch(
    store: &dyn DurableStore,
    layout: &StoreLayout,
    name: &str,
    threads: &ThreadMap,
) {
    let key = layout.raw_key(&crate::model::BatchId::new(name));
    put_json(store, &key, threads)
        .await
        .expect("raw batch written");
}
