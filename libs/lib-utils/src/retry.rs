//! Exponential backoff with jitter for retrying the smallest failing unit
//! (one OCR page, one classification batch, one store read).

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio::time::Instant;

/// Upper bound on any single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Retries are abandoned when the next sleep would end past this instant.
    pub deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.min(MAX_BACKOFF),
            jitter: true,
            deadline: None,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    /// With jitter the delay is drawn from [delay/2, delay].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let half = delay / 2;
        let spread = (delay - half).as_millis() as u64;
        let extra = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(extra)
    }

    fn fits_deadline(&self, delay: Duration) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() + delay < deadline,
            None => true,
        }
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, exhausts
/// `policy.max_attempts`, or the next backoff would cross the deadline.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::debug!("{}: non-retryable error on attempt {}: {}", label, attempt, err);
            return Err(err);
        }

        if attempt >= max_attempts {
            tracing::warn!(
                "{}: giving up after {} attempts: {}",
                label,
                attempt,
                err
            );
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        if !policy.fits_deadline(delay) {
            tracing::warn!(
                "{}: not retrying, backoff of {:?} would pass the deadline: {}",
                label,
                delay,
                err
            );
            return Err(err);
        }

        tracing::info!(
            "{}: retrying after {:?} (attempt {}/{}): {}",
            label,
            delay,
            attempt + 1,
            max_attempts,
            err
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
