//! End-to-end runs of the orchestration loop against an in-memory store.

use std::{collections::HashSet, sync::Arc, time::Duration};

use lib_utils::RetryPolicy;

use super::*;
use crate::{
    extract::{CloudOcr, ExtractionPools},
    model::{Category, Provenance},
    state::{QuarantineRecord, FAILED_MAX_RETRIES},
    store::{get_json, MemoryStore},
    testing::{
        corrupt_payload, email, native_payload, native_thread, put_raw_batch, scanned_payload,
        thread_map, FakeClassifier, FakeNative, FakeOcr, FakeSignal, FlakyStore,
    },
};

struct Harness {
    cfg: PipelineConfig,
    store: Arc<MemoryStore>,
    layout: StoreLayout,
    ocr: Arc<FakeOcr>,
    signal: Arc<FakeSignal>,
}

impl Harness {
    fn new() -> Self {
        let mut cfg = PipelineConfig::default();
        cfg.storage.prefix = "pipelines/test".to_string();
        cfg.orchestration.pipeline_id = "test".to_string();
        cfg.orchestration.classification_timeout_ms = 40;
        cfg.relevance.enabled = false;
        cfg.retry.max_attempts = 2;
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 2;

        Self {
            layout: StoreLayout::new(&cfg.storage.prefix),
            cfg,
            store: Arc::new(MemoryStore::new()),
            ocr: Arc::new(FakeOcr::returning("scanned page text")),
            signal: Arc::new(FakeSignal::default()),
        }
    }

    fn orchestrator(&self, classifier: Arc<FakeClassifier>) -> Orchestrator {
        self.orchestrator_on(self.store.clone(), classifier)
    }

    fn orchestrator_on(
        &self,
        store: Arc<dyn DurableStore>,
        classifier: Arc<FakeClassifier>,
    ) -> Orchestrator {
        let cascade = ExtractionCascade::new(
            self.cfg.extraction.clone(),
            Arc::new(FakeNative),
            Some(self.ocr.clone() as Arc<dyn CloudOcr>),
            None,
            ExtractionPools::new(4, 2),
            RetryPolicy::once(),
            Duration::from_secs(1),
        );
        Orchestrator::new(
            &self.cfg,
            store,
            cascade,
            classifier,
            self.signal.clone(),
        )
    }

    async fn run(&self, classifier: &Arc<FakeClassifier>) -> InvocationReport {
        self.run_with(classifier, Deadline::new(Duration::from_secs(10)))
            .await
    }

    async fn run_with(
        &self,
        classifier: &Arc<FakeClassifier>,
        deadline: Deadline,
    ) -> InvocationReport {
        self.orchestrator(classifier.clone())
            .run_invocation(&deadline)
            .await
            .expect("invocation succeeds")
    }

    async fn add_batch(&self, name: &str, threads: &ThreadMap) {
        put_raw_batch(self.store.as_ref(), &self.layout, name, threads).await;
    }

    fn ledger(&self) -> BatchLedger {
        BatchLedger::new(self.store.clone(), &self.layout)
    }

    fn pending(&self) -> PendingSlot {
        PendingSlot::new(self.store.clone(), &self.layout)
    }

    async fn records(&self) -> Vec<ClassificationRecord> {
        ResultsStore::new(self.store.clone(), &self.layout)
            .load()
            .await
            .expect("results readable")
    }

    async fn quarantine(&self, name: &str) -> QuarantineRecord {
        get_json(
            self.store.as_ref(),
            &self.layout.quarantine_key(&BatchId::new(name)),
        )
        .await
        .expect("quarantine object")
    }
}

const BATCH_A: &str = "batch_20240301T000000.json.gz";
const BATCH_B: &str = "batch_20240302T000000.json.gz";

fn scenario_one_batch() -> ThreadMap {
    thread_map(vec![
        (
            "t-pdfs".to_string(),
            vec![email(
                "March statement and scan",
                &[
                    ("statement.pdf", native_payload("Account statement March 2024")),
                    ("scan.pdf", scanned_payload()),
                ],
            )],
        ),
        ("t-none".to_string(), vec![email("Lunch on Friday?", &[])]),
        (
            "t-corrupt".to_string(),
            vec![email("Broken file", &[("broken.pdf", corrupt_payload())])],
        ),
    ])
}

#[tokio::test]
async fn test_scenario_mixed_batch_is_classified_in_one_pass() {
    let h = Harness::new();
    h.add_batch(BATCH_A, &scenario_one_batch()).await;
    let classifier = Arc::new(FakeClassifier::echo());

    let report = h.run(&classifier).await;

    assert_eq!(report.outcome, InvocationOutcome::Drained);
    assert_eq!(report.batches_completed, 1);
    let records = h.records().await;
    assert_eq!(records.len(), 2);

    let ids: HashSet<&str> = records.iter().map(|r| r.thread_id.as_str()).collect();
    assert_eq!(ids, HashSet::from(["t-pdfs", "t-corrupt"]));

    let pdfs = records.iter().find(|r| r.thread_id == "t-pdfs").unwrap();
    assert_eq!(pdfs.category, Category::Invoice);
    assert_eq!(pdfs.attachment_names, vec!["statement.pdf", "scan.pdf"]);
    assert!(pdfs.provenance.iter().all(|p| *p == Provenance::CloudOcr));
    let corrupt = records.iter().find(|r| r.thread_id == "t-corrupt").unwrap();
    assert_eq!(
        corrupt.provenance,
        vec![Provenance::Error("not_pdf".to_string())]
    );

    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
    assert!(h.pending().peek().await.unwrap().is_none());
    assert!(h.signal.sent().is_empty());
}

#[tokio::test]
async fn test_scenario_batch_without_attachments_makes_no_calls() {
    let h = Harness::new();
    let threads = thread_map(vec![
        ("t1".to_string(), vec![email("hello", &[])]),
        (
            "t2".to_string(),
            vec![email("empty payload", &[("x.pdf", String::new())])],
        ),
    ]);
    h.add_batch(BATCH_A, &threads).await;
    let classifier = Arc::new(FakeClassifier::echo());

    let report = h.run(&classifier).await;

    assert_eq!(report.empty_batches, 1);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
    assert_eq!(classifier.classify_calls(), 0);
    assert_eq!(classifier.screen_calls(), 0);
    assert_eq!(h.ocr.calls(), 0);
    assert!(h.records().await.is_empty());
}

#[tokio::test]
async fn test_scenario_timeouts_defer_then_quarantine_at_ceiling() {
    let mut h = Harness::new();
    h.cfg.orchestration.budget_ms = 400;
    let threads = thread_map((0..4).map(|i| native_thread(&format!("t{}", i))).collect());
    h.add_batch(BATCH_A, &threads).await;
    let classifier = Arc::new(FakeClassifier::hanging());

    let budget = h.cfg.orchestration.budget();
    let first = h.run_with(&classifier, Deadline::new(budget)).await;
    assert_eq!(first.outcome, InvocationOutcome::Deferred);
    let pending = h.pending().peek().await.unwrap().expect("pending work saved");
    assert_eq!(pending.batch_metadata.retry_count, 1);
    assert_eq!(pending.batch_metadata.remaining_count, 4);
    assert_eq!(pending.batch_metadata.original_count, 4);
    assert_eq!(h.signal.sent(), vec!["test".to_string()]);

    for attempt in 2..=4 {
        let report = h.run_with(&classifier, Deadline::new(budget)).await;
        assert_eq!(report.outcome, InvocationOutcome::Deferred);
        let pending = h.pending().peek().await.unwrap().unwrap();
        assert_eq!(pending.batch_metadata.retry_count, attempt);
        assert!(!h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
    }

    let fifth = h.run_with(&classifier, Deadline::new(budget)).await;
    assert_eq!(fifth.batches_quarantined, 1);
    assert_eq!(fifth.outcome, InvocationOutcome::Drained);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
    assert!(h.pending().peek().await.unwrap().is_none());

    let quarantined = h.quarantine(BATCH_A).await;
    assert_eq!(quarantined.status, FAILED_MAX_RETRIES);
    assert_eq!(quarantined.retry_count, 5);
    assert_eq!(quarantined.emails.len(), 4);
    assert_eq!(quarantined.reason, "classification_timeout");
}

#[tokio::test]
async fn test_retry_ceiling_termination() {
    let mut h = Harness::new();
    h.cfg.orchestration.retry_ceiling = 3;
    h.add_batch(BATCH_A, &thread_map(vec![native_thread("t1")])).await;
    let classifier = Arc::new(FakeClassifier::failing());

    for expected in 1..=2 {
        let report = h.run(&classifier).await;
        assert_eq!(report.outcome, InvocationOutcome::Deferred);
        let pending = h.pending().peek().await.unwrap().unwrap();
        assert_eq!(pending.batch_metadata.retry_count, expected);
    }

    let report = h.run(&classifier).await;
    assert_eq!(report.batches_quarantined, 1);
    assert_eq!(h.quarantine(BATCH_A).await.retry_count, 3);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);

    // Never re-enters pending work
    let calls = classifier.classify_calls();
    let report = h.run(&classifier).await;
    assert_eq!(report.outcome, InvocationOutcome::Drained);
    assert_eq!(classifier.classify_calls(), calls);
    assert!(h.pending().peek().await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_invocation_is_a_no_op() {
    let h = Harness::new();
    h.add_batch(BATCH_A, &scenario_one_batch()).await;
    let classifier = Arc::new(FakeClassifier::echo());
    h.run(&classifier).await;

    let writes = h.store.write_count();
    let records = h.records().await.len();
    let ledger = h.ledger().processed_set().await;
    let calls = classifier.classify_calls();

    let report = h.run(&classifier).await;

    assert_eq!(report.outcome, InvocationOutcome::Drained);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.records().await.len(), records);
    assert_eq!(h.ledger().processed_set().await, ledger);
    assert_eq!(classifier.classify_calls(), calls);
}

#[tokio::test]
async fn test_processed_batches_are_never_classified_again() {
    let h = Harness::new();
    h.add_batch(BATCH_A, &thread_map(vec![native_thread("a1"), native_thread("a2")]))
        .await;
    h.add_batch(BATCH_B, &thread_map(vec![native_thread("b1")]))
        .await;
    let classifier = Arc::new(FakeClassifier::echo());

    let report = h.run(&classifier).await;
    assert_eq!(report.batches_completed, 2);

    // A stale slot pointing at a processed batch is dropped, not replayed
    let stale = PendingWork::build(
        &BatchId::new(BATCH_A),
        &thread_map(vec![native_thread("a1")]),
        &HashMap::new(),
        1,
        2,
        None,
    );
    h.pending().save(&stale).await.unwrap();
    let report = h.run(&classifier).await;
    assert_eq!(report.stale_pending_cleared, 1);
    assert!(h.pending().peek().await.unwrap().is_none());

    let mut sent = classifier.classified_ids();
    sent.sort();
    assert_eq!(sent, vec!["a1", "a2", "b1"]);
    assert_eq!(h.records().await.len(), 3);
}

#[tokio::test]
async fn test_residue_is_conserved() {
    let h = Harness::new();
    let threads = thread_map((0..25).map(|i| native_thread(&format!("t{:02}", i))).collect());
    h.add_batch(BATCH_A, &threads).await;
    let classifier = Arc::new(FakeClassifier::echo().failing_for(&["t03", "t21"]));

    let report = h.run(&classifier).await;

    let records = h.records().await;
    let pending = h.pending().peek().await.unwrap().unwrap();
    let residue: HashSet<String> = pending.threads().keys().cloned().collect();
    assert_eq!(records.len() + residue.len(), 25);
    assert_eq!(pending.batch_metadata.remaining_count, residue.len());
    assert_eq!(report.residue_threads, residue.len());
    assert!(residue.contains("t03") && residue.contains("t21"));
    assert!(records
        .iter()
        .all(|r| !residue.contains(&r.thread_id)));
}

#[tokio::test]
async fn test_resumed_residue_reuses_cached_extraction() {
    let mut h = Harness::new();
    h.cfg.batching.small_batch_items = 1;
    h.add_batch(
        BATCH_A,
        &thread_map(vec![native_thread("t1"), native_thread("t2")]),
    )
    .await;
    let first = Arc::new(FakeClassifier::echo().failing_for(&["t2"]));

    h.run(&first).await;
    let ocr_calls = h.ocr.calls();
    assert_eq!(ocr_calls, 2);
    let pending = h.pending().peek().await.unwrap().unwrap();
    assert_eq!(pending.emails.len(), 1);
    assert_eq!(pending.emails[0].extractions.len(), 1);

    let second = Arc::new(FakeClassifier::echo());
    let report = h.run(&second).await;
    assert_eq!(report.batches_completed, 1);
    assert_eq!(h.ocr.calls(), ocr_calls);
    assert_eq!(second.classified_ids(), vec!["t2"]);
    assert!(h.pending().peek().await.unwrap().is_none());
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
}

#[tokio::test]
async fn test_scanned_pdf_never_accepted_as_native() {
    let mut h = Harness::new();
    h.cfg.extraction.native_accept_threshold = Some(1);
    h.add_batch(
        BATCH_A,
        &thread_map(vec![(
            "t1".to_string(),
            vec![email("scan", &[("scan.pdf", scanned_payload())])],
        )]),
    )
    .await;

    h.run(&Arc::new(FakeClassifier::echo())).await;
    let records = h.records().await;
    assert_eq!(records[0].provenance, vec![Provenance::CloudOcr]);
}

#[tokio::test]
async fn test_irrelevant_threads_are_dropped_without_records() {
    let mut h = Harness::new();
    h.cfg.relevance.enabled = true;
    h.add_batch(
        BATCH_A,
        &thread_map(vec![native_thread("keep"), native_thread("newsletter")]),
    )
    .await;
    let classifier = Arc::new(FakeClassifier::echo().irrelevant(&["newsletter"]));

    let report = h.run(&classifier).await;

    assert_eq!(report.threads_irrelevant, 1);
    assert_eq!(classifier.classified_ids(), vec!["keep"]);
    assert_eq!(h.records().await.len(), 1);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
}

#[tokio::test]
async fn test_budget_exhausted_between_batches_signals() {
    let h = Harness::new();
    h.add_batch(BATCH_A, &thread_map(vec![native_thread("t1")])).await;
    let classifier = Arc::new(FakeClassifier::echo());

    let report = h.run_with(&classifier, Deadline::new(Duration::ZERO)).await;

    assert_eq!(report.outcome, InvocationOutcome::BudgetExhausted);
    assert!(report.reinvocation_signalled);
    assert_eq!(h.signal.sent(), vec!["test".to_string()]);
    assert_eq!(classifier.classify_calls(), 0);
    assert!(!h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
}

#[tokio::test]
async fn test_undecodable_batch_is_quarantined() {
    let h = Harness::new();
    let key = h.layout.raw_key(&BatchId::new(BATCH_A));
    h.store.put(&key, b"\x1f\x8bnot really gzip".to_vec()).await.unwrap();
    h.add_batch(BATCH_B, &thread_map(vec![native_thread("b1")])).await;

    let report = h.run(&Arc::new(FakeClassifier::echo())).await;

    assert_eq!(report.batches_quarantined, 1);
    assert_eq!(report.batches_completed, 1);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
    assert!(h.quarantine(BATCH_A).await.reason.starts_with("undecodable_batch"));
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let h = Harness::new();
    h.add_batch(BATCH_A, &thread_map(vec![native_thread("t1"), native_thread("t2")]))
        .await;
    let flaky = FlakyStore::new((*h.store).clone());
    let classifier = Arc::new(FakeClassifier::echo());

    flaky.fail_next_gets(1);
    flaky.fail_next_puts(1);
    let report = h
        .orchestrator_on(Arc::new(flaky.clone()), classifier.clone())
        .run_invocation(&Deadline::new(Duration::from_secs(10)))
        .await
        .expect("transient store errors are retried");

    assert_eq!(report.outcome, InvocationOutcome::Drained);
    assert_eq!(classifier.classify_calls(), 1);
    assert_eq!(h.records().await.len(), 2);
    assert!(h.ledger().is_processed(&BatchId::new(BATCH_A)).await);
}
