use crate::error::ClientResult;
use crate::metrics::{ClientObserver, ClientOperationMetricsBuilder, RpcCall, RpcCallMetricsBuilder};
use crate::no_retries::RpcCallNoRetriesHandler;
use crate::retry::RpcCallRetryHandler;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs RPC actions through the retry or no-retry handler, recording
/// per-call metrics and reporting them to the observer.
#[derive(Clone)]
pub struct RpcCallExecutor {
    retry_handler: RpcCallRetryHandler,
    no_retries: RpcCallNoRetriesHandler,
    observer: Arc<dyn ClientObserver>,
}

impl RpcCallExecutor {
    pub fn new(retry_handler: RpcCallRetryHandler, observer: Arc<dyn ClientObserver>) -> Self {
        Self {
            retry_handler,
            no_retries: RpcCallNoRetriesHandler,
            observer,
        }
    }

    pub fn retry_duration(&self) -> Duration {
        self.retry_handler.retry_duration()
    }

    pub async fn execute<T, F, Fut>(
        &self,
        retries_enabled: bool,
        rpc_call: RpcCall,
        action: F,
        operation_metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if retries_enabled {
            self.execute_with_retries(rpc_call, action, operation_metrics, cancel)
                .await
        } else {
            self.execute_with_no_retries(rpc_call, action, None, operation_metrics, cancel)
                .await
        }
    }

    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        action: F,
        operation_metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut metrics =
            RpcCallMetricsBuilder::start_with_retries(rpc_call, self.retry_handler.retry_duration());
        let recorder = &metrics;

        let result = self
            .retry_handler
            .execute_with_retries(
                rpc_call.name,
                action,
                |attempt| recorder.with_attempt(attempt.started, attempt.error, attempt.cancelled),
                |retry| {
                    let remaining = retry.retry_duration.saturating_sub(retry.elapsed);
                    info!(
                        "An error occurred communicating with the agent. This action will be retried after {} seconds. Retry attempt {}. Retries will be performed for up to {} seconds.",
                        retry.sleep.as_secs(),
                        retry.retry_count,
                        remaining.as_secs()
                    );
                    debug!(rpc = %rpc_call, error = %retry.error, "rpc call failed");
                },
                |timeout| {
                    if timeout.retry_count > 0 {
                        info!(
                            "Could not communicate with the agent after {} seconds. No more retries will be attempted.",
                            timeout.elapsed.as_secs()
                        );
                    } else {
                        info!(
                            "Could not communicate with the agent after {} seconds.",
                            timeout.elapsed.as_secs()
                        );
                    }
                },
                cancel,
            )
            .await;

        if let Err(err) = &result {
            metrics.failure(err, cancel.is_cancelled());
        }
        self.report(metrics, operation_metrics);
        result
    }

    /// One attempt. `abandon_after` lets the call be given up that long
    /// after `cancel` fires.
    pub async fn execute_with_no_retries<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        action: F,
        abandon_after: Option<Duration>,
        operation_metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut metrics = RpcCallMetricsBuilder::start_without_retries(rpc_call);
        let started = Instant::now();

        let result = self
            .no_retries
            .execute_with_no_retries(
                rpc_call.name,
                action,
                abandon_after.is_some(),
                abandon_after.unwrap_or_default(),
                cancel,
            )
            .await;

        metrics.with_attempt(started, result.as_ref().err(), cancel.is_cancelled());
        if let Err(err) = &result {
            metrics.failure(err, cancel.is_cancelled());
        }
        self.report(metrics, operation_metrics);
        result
    }

    fn report(&self, metrics: RpcCallMetricsBuilder, operation_metrics: &ClientOperationMetricsBuilder) {
        let metrics = metrics.build();
        self.observer.rpc_call_completed(&metrics);
        operation_metrics.with_rpc_call(metrics);
    }
}
