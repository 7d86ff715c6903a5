use std::time::{Duration, Instant};

/// Running totals for one invocation of the rebalancer.
#[derive(Debug, Clone)]
pub struct RebalanceSession {
    started_at: Instant,
    pub total_fees_spent: u64,
    pub total_amount_moved: u64,
    pub total_attempts: u64,
}

impl RebalanceSession {
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            total_fees_spent: 0,
            total_amount_moved: 0,
            total_attempts: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whole seconds elapsed are compared, so a 300s timeout allows
    /// iterations to start up to 299.999s in.
    pub fn timed_out(&self, timeout_secs: u64) -> bool {
        self.elapsed().as_secs() >= timeout_secs
    }

    pub fn record_success(&mut self, amount_sats: u64, fee_sats: u64) {
        self.total_fees_spent += fee_sats;
        self.total_amount_moved += amount_sats;
        self.total_attempts += 1;
    }
}
