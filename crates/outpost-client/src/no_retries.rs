use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs a single attempt, optionally giving up on it some time after the
/// caller cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcCallNoRetriesHandler;

impl RpcCallNoRetriesHandler {
    /// Without `abandon` the action is awaited directly and sees `cancel`
    /// itself. With `abandon`, a grace timer of `abandon_after` starts once
    /// `cancel` fires; if it expires first the call fails with
    /// [`ClientError::Abandoned`] and the in-flight action is left to finish
    /// on its own.
    pub async fn execute_with_no_retries<T, F, Fut>(
        &self,
        operation: &str,
        action: F,
        abandon: bool,
        abandon_after: Duration,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if !abandon {
            return action(cancel.clone()).await;
        }

        // Only an abandon stops the action; the caller's token starts the timer.
        let abandoned = CancellationToken::new();
        let mut task = tokio::spawn(action(abandoned.clone()));

        let grace = async {
            cancel.cancelled().await;
            tokio::time::sleep(abandon_after).await;
        };

        tokio::select! {
            biased;
            joined = &mut task => joined.unwrap_or_else(|err| {
                Err(ClientError::Protocol {
                    message: format!("{operation} task failed: {err}"),
                })
            }),
            _ = grace => {
                debug!(operation, abandon_after_ms = abandon_after.as_millis() as u64, "abandoning rpc call");
                abandoned.cancel();
                watch_abandoned(operation.to_string(), task);
                Err(ClientError::Abandoned {
                    operation: operation.to_string(),
                    abandon_after_ms: abandon_after.as_millis() as u64,
                })
            }
        }
    }
}

fn watch_abandoned<T: Send + 'static>(operation: String, task: JoinHandle<ClientResult<T>>) {
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(_)) => debug!(operation = %operation, "abandoned rpc call completed"),
            Ok(Err(err)) => debug!(operation = %operation, error = %err, "abandoned rpc call failed"),
            Err(err) => warn!(operation = %operation, error = %err, "abandoned rpc call panicked"),
        }
    });
}
