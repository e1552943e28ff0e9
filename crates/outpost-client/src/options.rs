use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Retry transport failures for V2 and later services.
    pub retries_enabled: bool,
    /// Total budget for one retried call, including the first attempt.
    pub retry_duration: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long Finish may keep running after the caller cancels.
    pub abandon_finish_after: Duration,
    pub disable_v3_alpha: bool,
    pub poll_backoff: PollBackoff,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries_enabled: true,
            retry_duration: Duration::from_secs(150),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            abandon_finish_after: Duration::from_secs(60),
            disable_v3_alpha: false,
            poll_backoff: PollBackoff::default(),
        }
    }
}

/// Delay between status polls, doubling per iteration up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl PollBackoff {
    pub fn delay(&self, iteration: u32) -> Duration {
        let capped = iteration.min(31);
        let mult = 1u32 << capped.saturating_sub(1);
        self.initial.saturating_mul(mult).min(self.max)
    }
}
