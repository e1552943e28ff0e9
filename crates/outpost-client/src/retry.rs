use crate::error::{ClientError, ClientResult, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A retry is only attempted while more than this much budget would remain
/// after the backoff sleep.
pub const RETRY_IF_REMAINING_AT_LEAST: Duration = Duration::from_secs(1);

/// Passed to the retry observer before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub error: TransportError,
    pub sleep: Duration,
    pub retry_count: u32,
    pub retry_duration: Duration,
    pub elapsed: Duration,
}

/// Outcome of one attempt, reported whether it finished or was cut off by
/// the retry budget.
#[derive(Debug, Clone, Copy)]
pub struct AttemptOutcome<'a> {
    pub started: Instant,
    pub error: Option<&'a ClientError>,
    pub cancelled: bool,
}

/// Passed to the timeout observer when the retry budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimeout {
    pub retry_duration: Duration,
    pub elapsed: Duration,
    pub retry_count: u32,
}

/// Retries transport failures with capped exponential backoff until a total
/// time budget is spent.
#[derive(Debug, Clone)]
pub struct RpcCallRetryHandler {
    retry_duration: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RpcCallRetryHandler {
    pub fn new(retry_duration: Duration) -> Self {
        Self {
            retry_duration,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn retry_duration(&self) -> Duration {
        self.retry_duration
    }

    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let capped = retry_count.min(31);
        let mult = 1u64 << capped.saturating_sub(1);
        let millis = self.initial_backoff.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.max_backoff.as_millis() as u64))
    }

    /// Runs `action` until it succeeds, fails with a non-transport error,
    /// the caller cancels, or the budget is exhausted.
    ///
    /// The first attempt runs unbounded; every later attempt is limited to
    /// what is left of the budget.
    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        operation: &str,
        mut action: F,
        mut on_attempt: impl FnMut(&AttemptOutcome<'_>),
        mut on_retry: impl FnMut(&RetryAttempt),
        on_timeout: impl FnOnce(&RetryTimeout),
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut retry_count = 0u32;
        let mut last_error: Option<TransportError> = None;

        loop {
            attempts += 1;
            let attempt_started = Instant::now();
            let result = if attempts == 1 {
                action(cancel.clone()).await
            } else {
                let remaining = self.retry_duration.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, action(cancel.child_token())).await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = self.timed_out(operation, started, attempts, last_error);
                        on_attempt(&AttemptOutcome {
                            started: attempt_started,
                            error: Some(&err),
                            cancelled: cancel.is_cancelled(),
                        });
                        on_timeout(&RetryTimeout {
                            retry_duration: self.retry_duration,
                            elapsed: started.elapsed(),
                            retry_count,
                        });
                        return Err(err);
                    }
                }
            };
            on_attempt(&AttemptOutcome {
                started: attempt_started,
                error: result.as_ref().err(),
                cancelled: cancel.is_cancelled(),
            });

            let err = match result {
                Ok(value) => return Ok(value),
                Err(ClientError::Transport(err)) if !cancel.is_cancelled() => err,
                Err(err) => return Err(err),
            };

            let sleep = self.backoff_delay(retry_count + 1);
            let elapsed = started.elapsed();
            let remaining = self
                .retry_duration
                .checked_sub(elapsed)
                .and_then(|left| left.checked_sub(sleep))
                .unwrap_or_default();
            if remaining <= RETRY_IF_REMAINING_AT_LEAST {
                on_timeout(&RetryTimeout {
                    retry_duration: self.retry_duration,
                    elapsed,
                    retry_count,
                });
                return Err(self.timed_out(operation, started, attempts, Some(err)));
            }

            retry_count += 1;
            on_retry(&RetryAttempt {
                error: err.clone(),
                sleep,
                retry_count,
                retry_duration: self.retry_duration,
                elapsed,
            });
            last_error = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::cancelled(operation)),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    fn timed_out(
        &self,
        operation: &str,
        started: Instant,
        attempts: u32,
        last_error: Option<TransportError>,
    ) -> ClientError {
        ClientError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            attempts,
            last_error,
        }
    }
}
