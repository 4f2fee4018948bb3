use std::time::Duration;
use tracing::info;

/// Delay escalation factor applied on each observed rate limit.
const BACKOFF_FACTOR: f64 = 1.5;

/// Run-global pacing between batch submissions. The delay models a shared
/// downstream quota: throttling escalates it multiplicatively up to a hard
/// ceiling, and it is never decreased for the remainder of the run.
#[derive(Debug)]
pub struct RateGovernor {
    delay: Duration,
    ceiling: Duration,
    hits: u64,
}

impl RateGovernor {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            delay: initial.min(ceiling),
            ceiling,
            hits: 0,
        }
    }

    /// Suspend for the current inter-batch delay.
    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Record an observed rate limit and escalate the delay, sticky for the
    /// rest of the run.
    pub fn on_rate_limited(&mut self) {
        self.hits += 1;
        // mul_f64(0 * 1.5) stays zero; step off the floor so throttling bites
        // even when the run started with no delay. At the ceiling the delay
        // holds, never decreases.
        self.delay = if self.delay.is_zero() {
            Duration::from_millis(100).min(self.ceiling)
        } else {
            self.delay.mul_f64(BACKOFF_FACTOR).min(self.ceiling)
        };
        info!(delay_ms = self.delay.as_millis() as u64, "rate limited; inter-batch delay escalated");
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}
