use std::sync::atomic::Ordering::Relaxed;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::time::Duration;

use leaky_bucket::RateLimiter;

use crate::pipeline_config::{ApiConfig, BucketLimits};

#[derive(Clone)]
pub struct RateLimiters {
    prompt: Arc<RateLimiter>,
    tokens: Arc<RateLimiter>,
    ocr_pages: Arc<RateLimiter>,
    backoff: Arc<AtomicBool>,
    backoff_duration: Duration,
}

fn bucket(limits: &BucketLimits, initial: usize) -> RateLimiter {
    RateLimiter::builder()
        .initial(initial)
        .interval(Duration::from_millis(limits.refill_interval_ms.max(1) as u64))
        .max(limits.max.max(1))
        .refill(limits.refill_amount.max(1))
        .build()
}

impl RateLimiters {
    pub fn new(prompt: &BucketLimits, tokens: &BucketLimits, ocr_pages: &BucketLimits) -> Self {
        Self {
            prompt: Arc::new(bucket(prompt, 1)),
            // Start with half capacity to avoid burst
            tokens: Arc::new(bucket(tokens, tokens.max / 2)),
            ocr_pages: Arc::new(bucket(ocr_pages, 1)),
            backoff: Arc::new(AtomicBool::new(false)),
            backoff_duration: Duration::from_secs(60),
        }
    }

    pub fn from_config(api: &ApiConfig) -> Self {
        Self::new(&api.prompt_limits, &api.token_limits, &api.ocr_page_limits)
    }

    /// Effectively unlimited, for tests.
    #[cfg(test)]
    pub fn unlimited() -> Self {
        let wide = BucketLimits {
            max: 1_000_000,
            refill_interval_ms: 1,
            refill_amount: 1_000_000,
        };
        Self {
            prompt: Arc::new(bucket(&wide, wide.max)),
            tokens: Arc::new(bucket(&wide, wide.max)),
            ocr_pages: Arc::new(bucket(&wide, wide.max)),
            backoff: Arc::new(AtomicBool::new(false)),
            backoff_duration: Duration::from_secs(60),
        }
    }

    async fn wait_backoff(&self) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }
    }

    pub async fn acquire_one(&self) {
        self.wait_backoff().await;
        self.prompt.acquire_one().await;
    }

    /// Acquire tokens for estimated token usage before making an API call
    pub async fn acquire_tokens(&self, estimated_tokens: usize) {
        self.wait_backoff().await;
        // A single request larger than the bucket would wait forever
        let amount = estimated_tokens.min(self.tokens.max());
        self.tokens.acquire(amount).await;
    }

    pub async fn acquire_ocr_page(&self) {
        self.wait_backoff().await;
        self.ocr_pages.acquire_one().await;
    }

    pub fn trigger_backoff(&self) {
        if self.backoff.swap(true, Relaxed) {
            return;
        }
        tracing::info!("Triggering backoff...");
        let self_ = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(self_.backoff_duration).await;
            tracing::info!("Backoff expired");
            self_.backoff.store(false, Relaxed);
        });
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff.load(Relaxed)
    }

    pub fn get_status(&self) -> String {
        let prompt_bucket = format!("{}/{}", self.prompt.balance(), self.prompt.max());
        let token_bucket = format!("{}/{}", self.tokens.balance(), self.tokens.max());
        let ocr_bucket = format!("{}/{}", self.ocr_pages.balance(), self.ocr_pages.max());
        let status = format!(
            "prompts: {} tokens: {} ocr pages: {}",
            prompt_bucket, token_bucket, ocr_bucket
        );
        if self.in_backoff() {
            format!("{} (BACKOFF)", status)
        } else {
            status
        }
    }
}
