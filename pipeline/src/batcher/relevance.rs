use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{stream, StreamExt};

use crate::{
    deadline::Deadline,
    error::PipelineError,
    model::{extraction::truncate_chars, ThreadDocument},
    pipeline_config::RelevanceConfig,
    prompt::{DocumentClassifier, RelevanceItem},
};

/// Threads kept for full classification and the ids screened out.
#[derive(Debug, Default)]
pub struct Screened {
    pub kept: Vec<ThreadDocument>,
    pub dropped: Vec<String>,
}

/// Cheap pre-classification screen on subject plus a text prefix.
///
/// Fails open: a group whose call errors or times out is kept whole, and a
/// thread missing from the answer is kept.
pub struct RelevanceFilter {
    classifier: Arc<dyn DocumentClassifier>,
    cfg: RelevanceConfig,
    concurrency: usize,
    call_timeout: Duration,
}

impl RelevanceFilter {
    pub fn new(
        classifier: Arc<dyn DocumentClassifier>,
        cfg: RelevanceConfig,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            cfg,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    fn item(&self, document: &ThreadDocument) -> RelevanceItem {
        let (text_prefix, _) = truncate_chars(&document.text, self.cfg.prefix_chars);
        RelevanceItem {
            thread_id: document.thread_id.clone(),
            subject: document.subject.clone(),
            text_prefix,
        }
    }

    pub async fn screen(&self, documents: Vec<ThreadDocument>, deadline: &Deadline) -> Screened {
        if !self.cfg.enabled || documents.is_empty() {
            return Screened {
                kept: documents,
                dropped: Vec::new(),
            };
        }
        if deadline.expired() {
            tracing::debug!("Skipping relevance screen, budget exhausted");
            return Screened {
                kept: documents,
                dropped: Vec::new(),
            };
        }

        let groups: Vec<Vec<RelevanceItem>> = documents
            .chunks(self.cfg.group_size.max(1))
            .map(|chunk| chunk.iter().map(|d| self.item(d)).collect())
            .collect();

        let verdicts: HashMap<String, bool> = stream::iter(groups)
            .map(|group| async move {
                if deadline.expired() {
                    return Vec::new();
                }
                let answer = tokio::time::timeout(self.call_timeout, self.classifier.screen(&group))
                    .await
                    .map_err(|_| PipelineError::Timeout(self.call_timeout))
                    .and_then(|r| r);
                match answer {
                    Ok(verdicts) => verdicts,
                    Err(e) => {
                        tracing::warn!(
                            "Relevance screen failed for {} threads, keeping them: {}",
                            group.len(),
                            e
                        );
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .flat_map(stream::iter)
            .fold(HashMap::new(), |mut acc, verdict| async move {
                acc.entry(verdict.thread_id).or_insert(verdict.relevant);
                acc
            })
            .await;

        let (kept, dropped): (Vec<_>, Vec<_>) = documents
            .into_iter()
            .partition(|d| verdicts.get(&d.thread_id).copied().unwrap_or(true));
        let dropped: Vec<String> = dropped.into_iter().map(|d| d.thread_id).collect();

        if !dropped.is_empty() {
            tracing::info!(
                "Relevance screen dropped {} of {} threads",
                dropped.len(),
                dropped.len() + kept.len()
            );
        }
        Screened { kept, dropped }
    }
}
