use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wall-clock budget of one invocation.
///
/// Checked at boundaries only (before starting a thread's extraction, before
/// issuing a classification unit). Calls already in flight run to their own
/// timeout. Cancelling the token (SIGTERM) expires the deadline immediately.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            cancel: CancellationToken::new(),
        }
    }

    pub fn instant(&self) -> Instant {
        self.started + self.budget
    }

    pub fn remaining(&self) -> Duration {
        if self.cancel.is_cancelled() {
            return Duration::ZERO;
        }
        self.instant().saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
