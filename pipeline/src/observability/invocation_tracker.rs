use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::{batcher::BatchOutcome, model::ExtractionResult};

use super::table::{format_elapsed, Table};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// No unprocessed batch and no pending work left.
    Drained,
    /// Residue was saved to the pending slot and a re-invocation requested.
    Deferred,
    /// Budget ran out between batches with unprocessed batches remaining.
    BudgetExhausted,
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationOutcome::Drained => "drained",
            InvocationOutcome::Deferred => "deferred",
            InvocationOutcome::BudgetExhausted => "budget_exhausted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub pipeline_id: String,
    pub outcome: InvocationOutcome,
    pub batches_completed: usize,
    pub empty_batches: usize,
    pub batches_quarantined: usize,
    pub stale_pending_cleared: usize,
    pub records_persisted: usize,
    pub threads_irrelevant: usize,
    pub residue_threads: usize,
    pub units_sent: usize,
    pub units_failed: usize,
    pub units_preempted: usize,
    /// Extraction tier tag -> attachment count.
    pub provenance: BTreeMap<String, usize>,
    pub reinvocation_signalled: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

impl InvocationReport {
    pub fn summary_table(&self) -> String {
        let mut table = Table::new(
            format!("Invocation {} ({})", self.pipeline_id, self.outcome),
            &["Metric", "Value"],
        );
        let metrics = [
            ("Batches completed", self.batches_completed.to_string()),
            ("Empty batches", self.empty_batches.to_string()),
            ("Batches quarantined", self.batches_quarantined.to_string()),
            ("Records persisted", self.records_persisted.to_string()),
            ("Irrelevant threads", self.threads_irrelevant.to_string()),
            ("Residue threads", self.residue_threads.to_string()),
            (
                "Units sent / failed / preempted",
                format!(
                    "{} / {} / {}",
                    self.units_sent, self.units_failed, self.units_preempted
                ),
            ),
        ];
        for (label, value) in metrics {
            table.row([label.to_string(), value]);
        }
        for (tier, count) in &self.provenance {
            table.row([format!("Extraction: {}", tier), count.to_string()]);
        }
        table.row(["Elapsed".to_string(), format_elapsed(self.elapsed)]);
        table.render()
    }
}

/// Counters accumulated over one invocation by the orchestration loop.
#[derive(Debug)]
pub struct InvocationTracker {
    pipeline_id: String,
    started: Instant,
    batches_completed: usize,
    empty_batches: usize,
    batches_quarantined: usize,
    stale_pending_cleared: usize,
    records_persisted: usize,
    threads_irrelevant: usize,
    residue_threads: usize,
    units_sent: usize,
    units_failed: usize,
    units_preempted: usize,
    provenance: BTreeMap<String, usize>,
    reinvocation_signalled: bool,
}

impl InvocationTracker {
    pub fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            started: Instant::now(),
            batches_completed: 0,
            empty_batches: 0,
            batches_quarantined: 0,
            stale_pending_cleared: 0,
            records_persisted: 0,
            threads_irrelevant: 0,
            residue_threads: 0,
            units_sent: 0,
            units_failed: 0,
            units_preempted: 0,
            provenance: BTreeMap::new(),
            reinvocation_signalled: false,
        }
    }

    pub fn batch_completed(&mut self) {
        self.batches_completed += 1;
    }

    pub fn empty_batch(&mut self) {
        self.empty_batches += 1;
    }

    pub fn batch_quarantined(&mut self) {
        self.batches_quarantined += 1;
    }

    pub fn stale_pending_cleared(&mut self) {
        self.stale_pending_cleared += 1;
    }

    pub fn records_persisted(&mut self, count: usize) {
        self.records_persisted += count;
    }

    pub fn irrelevant(&mut self, count: usize) {
        self.threads_irrelevant += count;
    }

    pub fn residue(&mut self, count: usize) {
        self.residue_threads += count;
    }

    pub fn extractions<'a>(&mut self, results: impl IntoIterator<Item = &'a ExtractionResult>) {
        for result in results {
            *self
                .provenance
                .entry(result.provenance.tier().to_string())
                .or_default() += 1;
        }
    }

    pub fn classification(&mut self, outcome: &BatchOutcome) {
        self.units_sent += outcome.units_sent;
        self.units_failed += outcome.units_failed;
        self.units_preempted += outcome.units_preempted;
    }

    pub fn reinvocation_signalled(&mut self) {
        self.reinvocation_signalled = true;
    }

    pub fn finish(self, outcome: InvocationOutcome) -> InvocationReport {
        InvocationReport {
            pipeline_id: self.pipeline_id,
            outcome,
            batches_completed: self.batches_completed,
            empty_batches: self.empty_batches,
            batches_quarantined: self.batches_quarantined,
            stale_pending_cleared: self.stale_pending_cleared,
            records_persisted: self.records_persisted,
            threads_irrelevant: self.threads_irrelevant,
            residue_threads: self.residue_threads,
            units_sent: self.units_sent,
            units_failed: self.units_failed,
            units_preempted: self.units_preempted,
            provenance: self.provenance,
            reinvocation_signalled: self.reinvocation_signalled,
            elapsed: self.started.elapsed(),
        }
    }
}
