use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use lib_utils::{retry, RetryPolicy};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    deadline::Deadline,
    error::{PipelineError, PipelineResult},
    model::{Classification, RawClassification},
    prompt::DocumentClassifier,
};

use super::ClassificationUnit;

/// Result of running a set of units. Every input thread lands in exactly one
/// of `classified` or `unclassified`.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub classified: Vec<Classification>,
    pub unclassified: Vec<String>,
    pub last_failure: Option<String>,
    pub units_sent: usize,
    pub units_failed: usize,
    pub units_preempted: usize,
}

impl BatchOutcome {
    fn fail(&mut self, thread_ids: Vec<String>, reason: String) {
        self.unclassified.extend(thread_ids);
        self.last_failure = Some(reason);
    }
}

/// Issues classification calls under a bounded fan-out.
pub struct ClassificationRunner {
    classifier: Arc<dyn DocumentClassifier>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

fn is_retryable(error: &PipelineError) -> bool {
    error.is_retryable() || matches!(error, PipelineError::InvalidResponse(_))
}

/// Check the answer covers exactly the threads of the unit. The first entry
/// for a duplicated thread id wins.
fn validate(
    unit_ids: &[String],
    answer: Vec<RawClassification>,
) -> PipelineResult<Vec<Classification>> {
    let expected: HashSet<&str> = unit_ids.iter().map(String::as_str).collect();
    let mut seen: HashMap<String, Classification> = HashMap::new();

    for entry in answer {
        if !expected.contains(entry.thread_id.as_str()) {
            return Err(PipelineError::InvalidResponse(format!(
                "unexpected thread id {}",
                entry.thread_id
            )));
        }
        if seen.contains_key(&entry.thread_id) {
            tracing::debug!("Duplicate entry for {}, keeping the first", entry.thread_id);
            continue;
        }
        seen.insert(entry.thread_id.clone(), entry.normalize());
    }

    if seen.len() != expected.len() {
        return Err(PipelineError::InvalidResponse(format!(
            "answered {} of {} threads",
            seen.len(),
            expected.len()
        )));
    }

    Ok(unit_ids
        .iter()
        .filter_map(|id| seen.remove(id))
        .collect())
}

impl ClassificationRunner {
    pub fn new(
        classifier: Arc<dyn DocumentClassifier>,
        concurrency: usize,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            classifier,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            call_timeout,
            retry,
        }
    }

    /// Run `units`, checking the deadline before each one is issued. Units not
    /// issued in time, and units whose call failed after retries, come back
    /// whole in `unclassified`.
    pub async fn run(&self, units: Vec<ClassificationUnit>, deadline: &Deadline) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut in_flight: HashMap<usize, Vec<String>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut units = units.into_iter().enumerate();

        while let Some((index, unit)) = units.next() {
            if deadline.expired() {
                self.preempt(index, unit, units.by_ref().map(|(_, u)| u), &mut outcome);
                break;
            }

            let permit = match tokio::time::timeout(
                deadline.remaining(),
                self.permits.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    self.preempt(index, unit, units.by_ref().map(|(_, u)| u), &mut outcome);
                    break;
                }
            };

            let unit_ids = unit.thread_ids();
            in_flight.insert(index, unit_ids.clone());
            outcome.units_sent += 1;

            let classifier = self.classifier.clone();
            let call_timeout = self.call_timeout;
            let policy = self.retry.clone().with_deadline(deadline.instant());
            tasks.spawn(async move {
                let _permit = permit;
                let label = format!("classify_{}_unit_{}", unit.tier, index);
                let result = retry(&policy, &label, is_retryable, |_| {
                    let classifier = classifier.clone();
                    let unit = &unit;
                    let unit_ids = &unit_ids;
                    async move {
                        let answer = tokio::time::timeout(call_timeout, classifier.classify(unit))
                            .await
                            .map_err(|_| PipelineError::Timeout(call_timeout))??;
                        validate(unit_ids, answer)
                    }
                })
                .await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Classification task aborted: {}", e);
                    outcome.last_failure = Some("task_aborted".to_string());
                    continue;
                }
            };
            let Some(unit_ids) = in_flight.remove(&index) else {
                continue;
            };
            match result {
                Ok(classified) => outcome.classified.extend(classified),
                Err(e) => {
                    tracing::warn!(
                        "Classification unit {} failed, returning {} threads: {}",
                        index,
                        unit_ids.len(),
                        e
                    );
                    outcome.units_failed += 1;
                    outcome.fail(unit_ids, format!("classification_{}", e.reason()));
                }
            }
        }

        // Units whose task never reported back
        for (_, unit_ids) in in_flight.drain() {
            outcome.units_failed += 1;
            outcome.unclassified.extend(unit_ids);
        }

        outcome
    }

    fn preempt(
        &self,
        index: usize,
        first: ClassificationUnit,
        rest: impl Iterator<Item = ClassificationUnit>,
        outcome: &mut BatchOutcome,
    ) {
        let mut count = 0;
        for unit in std::iter::once(first).chain(rest) {
            count += 1;
            outcome.units_preempted += 1;
            outcome.fail(unit.thread_ids(), "budget_exhausted".to_string());
        }
        tracing::info!(
            "Budget exhausted, {} classification units from #{} not issued",
            count,
            index
        );
    }
}
