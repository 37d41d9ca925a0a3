//! Orchestration Loop
//!
//! One invocation drains as many batches as the wall-clock budget allows:
//! - resume the pending slot if it holds residue, else load the oldest
//!   unprocessed raw batch
//! - extract, screen for relevance, classify
//! - append records, then either mark the batch processed, save residue and
//!   hand off to a new invocation, or quarantine residue at the retry ceiling
//!
//! Control flow is sequential; parallelism lives in the extraction pools and
//! the classification runner.

mod signal;
mod threads;

#[cfg(test)]
mod scenarios;

pub use signal::{LogOnlySignal, PubSubSignal, ReinvocationSignal};

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    batcher::{pack, ClassificationRunner, RelevanceFilter},
    deadline::Deadline,
    error::{PipelineError, PipelineResult},
    extract::ExtractionCascade,
    model::{
        pending_work::ExtractionCache, BatchId, ClassificationRecord, ExtractionResult,
        PendingWork, ThreadDocument, ThreadMap,
    },
    observability::{InvocationOutcome, InvocationReport, InvocationTracker},
    pipeline_config::{BatchingConfig, PipelineConfig},
    prompt::DocumentClassifier,
    state::{BatchLedger, PendingSlot, Quarantine, RawBatchSource, ResultsStore},
    store::{DurableStore, RetryingStore, StoreError, StoreLayout},
};

use threads::extract_threads;

/// The input of one loop iteration: a fresh batch or resumed residue.
struct WorkItem {
    batch_id: BatchId,
    threads: ThreadMap,
    cache: HashMap<String, ExtractionCache>,
    previous_retries: u32,
    original_count: usize,
    resumed: bool,
}

enum Step {
    /// The batch is finished (processed or quarantined); take the next one.
    Continue,
    /// Residue was saved; this invocation must stop.
    Deferred,
}

pub struct Orchestrator {
    pipeline_id: String,
    retry_ceiling: u32,
    extraction_threads: usize,
    max_thread_chars: usize,
    batching: BatchingConfig,
    ledger: BatchLedger,
    pending: PendingSlot,
    source: RawBatchSource,
    results: ResultsStore,
    quarantine: Quarantine,
    cascade: ExtractionCascade,
    relevance: RelevanceFilter,
    runner: ClassificationRunner,
    signal: Arc<dyn ReinvocationSignal>,
}

impl Orchestrator {
    pub fn new(
        cfg: &PipelineConfig,
        store: Arc<dyn DurableStore>,
        cascade: ExtractionCascade,
        classifier: Arc<dyn DocumentClassifier>,
        signal: Arc<dyn ReinvocationSignal>,
    ) -> Self {
        let layout = StoreLayout::new(&cfg.storage.prefix);
        let call_timeout = cfg.orchestration.classification_timeout();
        let store: Arc<dyn DurableStore> = Arc::new(RetryingStore::new(store, cfg.retry.policy()));

        Self {
            pipeline_id: cfg.orchestration.pipeline_id.clone(),
            retry_ceiling: cfg.orchestration.retry_ceiling.max(1),
            extraction_threads: cfg.concurrency.extraction_threads,
            max_thread_chars: cfg.batching.max_thread_chars,
            batching: cfg.batching.clone(),
            ledger: BatchLedger::new(store.clone(), &layout),
            pending: PendingSlot::new(store.clone(), &layout),
            source: RawBatchSource::new(store.clone(), &layout),
            results: ResultsStore::new(store.clone(), &layout),
            quarantine: Quarantine::new(store, &layout),
            cascade,
            relevance: RelevanceFilter::new(
                classifier.clone(),
                cfg.relevance.clone(),
                cfg.concurrency.classification,
                call_timeout,
            ),
            runner: ClassificationRunner::new(
                classifier,
                cfg.concurrency.classification,
                call_timeout,
                cfg.retry.policy(),
            ),
            signal,
        }
    }

    /// Run one invocation until no work remains, residue is deferred, or the
    /// budget runs out. Store write failures abort the invocation.
    pub async fn run_invocation(&self, deadline: &Deadline) -> PipelineResult<InvocationReport> {
        let mut tracker = InvocationTracker::new(&self.pipeline_id);
        tracing::info!(
            "Invocation of pipeline {} started, budget {:?}",
            self.pipeline_id,
            deadline.remaining()
        );

        let outcome = loop {
            if deadline.expired() {
                break self.on_budget_exhausted(&mut tracker).await?;
            }

            let Some(work) = self.next_work(deadline, &mut tracker).await? else {
                if deadline.expired() {
                    break self.on_budget_exhausted(&mut tracker).await?;
                }
                break InvocationOutcome::Drained;
            };

            match self.process(work, deadline, &mut tracker).await? {
                Step::Continue => continue,
                Step::Deferred => {
                    self.request_reinvocation(&mut tracker).await;
                    break InvocationOutcome::Deferred;
                }
            }
        };

        let report = tracker.finish(outcome);
        tracing::info!("\n{}", report.summary_table());
        Ok(report)
    }

    async fn on_budget_exhausted(
        &self,
        tracker: &mut InvocationTracker,
    ) -> PipelineResult<InvocationOutcome> {
        let has_pending = self.pending.peek().await?.is_some();
        let processed = self.ledger.processed_set().await;
        let unprocessed = self.source.list_unprocessed(&processed).await?.len();

        if !has_pending && unprocessed == 0 {
            return Ok(InvocationOutcome::Drained);
        }
        tracing::info!(
            "Budget exhausted with {} unprocessed batches{}",
            unprocessed,
            if has_pending { " and pending work" } else { "" }
        );
        self.request_reinvocation(tracker).await;
        Ok(InvocationOutcome::BudgetExhausted)
    }

    /// Fire and forget: a lost signal delays the pipeline but loses nothing.
    async fn request_reinvocation(&self, tracker: &mut InvocationTracker) {
        match self.signal.signal(&self.pipeline_id).await {
            Ok(()) => tracker.reinvocation_signalled(),
            Err(e) => tracing::error!(
                "Failed to request re-invocation of {}: {}",
                self.pipeline_id,
                e
            ),
        }
    }

    /// Pending residue first, then the oldest unprocessed batch with at least
    /// one attachment. Batches without attachments are marked processed on
    /// the way.
    async fn next_work(
        &self,
        deadline: &Deadline,
        tracker: &mut InvocationTracker,
    ) -> PipelineResult<Option<WorkItem>> {
        if let Some(pending) = self.pending.peek().await? {
            let meta = &pending.batch_metadata;
            let batch_id = meta.original_batch_filename.clone();

            if self.ledger.is_processed(&batch_id).await {
                tracing::warn!(
                    "Pending work for {} is stale, batch already processed. Clearing it",
                    batch_id
                );
                self.pending.clear().await?;
                tracker.stale_pending_cleared();
            } else {
                tracing::info!(
                    "Resuming {} residue threads of {} (attempt {}, {} originally)",
                    meta.remaining_count,
                    batch_id,
                    meta.retry_count + 1,
                    meta.original_count
                );
                return Ok(Some(WorkItem {
                    threads: pending.threads(),
                    cache: pending.extraction_cache(),
                    previous_retries: meta.retry_count,
                    original_count: meta.original_count,
                    resumed: true,
                    batch_id,
                }));
            }
        }

        let processed = self.ledger.processed_set().await;
        for batch_id in self.source.list_unprocessed(&processed).await? {
            if deadline.expired() {
                return Ok(None);
            }

            let batch = match self.source.load(&batch_id).await {
                Ok(batch) => batch,
                Err(PipelineError::Store(e @ StoreError::Codec { .. })) => {
                    tracing::error!("Raw batch {} cannot be decoded: {}", batch_id, e);
                    self.quarantine
                        .put(&batch_id, Vec::new(), 0, &format!("undecodable_batch: {}", e))
                        .await?;
                    self.ledger.mark_processed(&batch_id).await?;
                    tracker.batch_quarantined();
                    continue;
                }
                Err(e) => return Err(e),
            };

            let qualifying = batch.qualifying_threads();
            if qualifying.is_empty() {
                tracing::info!(
                    "Batch {} has no threads with attachments, marking processed",
                    batch_id
                );
                self.ledger.mark_processed(&batch_id).await?;
                tracker.empty_batch();
                continue;
            }

            tracing::info!(
                "Batch {}: {} of {} threads carry attachments",
                batch_id,
                qualifying.len(),
                batch.threads.len()
            );
            return Ok(Some(WorkItem {
                original_count: qualifying.len(),
                threads: qualifying,
                cache: HashMap::new(),
                previous_retries: 0,
                resumed: false,
                batch_id,
            }));
        }

        Ok(None)
    }

    async fn process(
        &self,
        work: WorkItem,
        deadline: &Deadline,
        tracker: &mut InvocationTracker,
    ) -> PipelineResult<Step> {
        // Extract
        let extracted = extract_threads(
            &self.cascade,
            &work.threads,
            &work.cache,
            self.extraction_threads,
            self.max_thread_chars,
            deadline,
        )
        .await;
        tracker.extractions(extracted.documents.iter().flat_map(|d| d.extractions.iter()));
        let not_started = extracted.not_started;

        // Filter relevant
        let screened = self.relevance.screen(extracted.documents, deadline).await;
        tracker.irrelevant(screened.dropped.len());

        // Classify
        let units = pack(&screened.kept, &self.batching);
        let mut outcome = self.runner.run(units, deadline).await;
        tracker.classification(&outcome);

        // Persist before touching the ledger
        let documents: HashMap<&str, &ThreadDocument> = screened
            .kept
            .iter()
            .map(|d| (d.thread_id.as_str(), d))
            .collect();
        let records: Vec<ClassificationRecord> = std::mem::take(&mut outcome.classified)
            .into_iter()
            .filter_map(|c| {
                let document = documents.get(c.thread_id.as_str())?;
                Some(ClassificationRecord::new(&work.batch_id, document, c))
            })
            .collect();
        if !records.is_empty() {
            self.results.append(&records).await?;
            tracker.records_persisted(records.len());
        }

        let residue_ids: HashSet<&str> = not_started
            .iter()
            .chain(outcome.unclassified.iter())
            .map(String::as_str)
            .collect();

        tracing::info!(
            "Batch {}: {} threads in, {} classified, {} irrelevant, {} residue",
            work.batch_id,
            work.threads.len(),
            records.len(),
            screened.dropped.len(),
            residue_ids.len()
        );

        if residue_ids.is_empty() {
            self.ledger.mark_processed(&work.batch_id).await?;
            if work.resumed {
                self.pending.clear().await?;
            }
            tracker.batch_completed();
            return Ok(Step::Continue);
        }

        let residue: ThreadMap = work
            .threads
            .iter()
            .filter(|(id, _)| residue_ids.contains(id.as_str()))
            .map(|(id, emails)| (id.clone(), emails.clone()))
            .collect();
        tracker.residue(residue.len());

        // Extraction results ride along so the next attempt does not pay for OCR again
        let mut cached: HashMap<String, Vec<ExtractionResult>> = screened
            .kept
            .iter()
            .filter(|d| residue.contains_key(&d.thread_id))
            .map(|d| (d.thread_id.clone(), d.extractions.clone()))
            .collect();
        for thread_id in &not_started {
            if let Some(cache) = work.cache.get(thread_id) {
                cached.insert(thread_id.clone(), cache.values().cloned().collect());
            }
        }

        let retry_count = work.previous_retries + 1;
        let reason = outcome
            .last_failure
            .clone()
            .unwrap_or_else(|| "budget_exhausted".to_string());
        let pending = PendingWork::build(
            &work.batch_id,
            &residue,
            &cached,
            retry_count,
            work.original_count,
            Some(reason.clone()),
        );

        if retry_count >= self.retry_ceiling {
            self.quarantine
                .put(&work.batch_id, pending.emails, retry_count, &reason)
                .await?;
            self.ledger.mark_processed(&work.batch_id).await?;
            if work.resumed {
                self.pending.clear().await?;
            }
            tracker.batch_quarantined();
            return Ok(Step::Continue);
        }

        self.pending.save(&pending).await?;
        tracing::info!(
            "Saved {} residue threads of {} as pending work (attempt {} of {}, {})",
            residue.len(),
            work.batch_id,
            retry_count,
            self.retry_ceiling,
            reason
        );
        Ok(Step::Deferred)
    }
}
