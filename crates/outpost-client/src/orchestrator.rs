use crate::error::{ClientError, ClientResult};
use crate::executor::{
    CommandContext, ExecuteScriptCommand, ScriptOperationResult, ScriptServiceExecutor, ScriptStatus,
};
use crate::metrics::{ClientObserver, ClientOperationMetricsBuilder, TracingObserver};
use crate::options::ClientOptions;
use crate::transport::Transport;
use outpost_protocol::{
    CapabilitiesResponse, ProcessOutput, ProcessState, ScriptServiceVersion, ScriptTicket,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExecutionResult {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    /// Every output line received over the life of the execution.
    pub logs: Vec<ProcessOutput>,
}

/// Entry point for running scripts on an agent: negotiates the service
/// version, then drives start, polling, cancellation and cleanup.
pub struct ScriptClient<T: Transport> {
    executor: Arc<ScriptServiceExecutor<T>>,
    observer: Arc<dyn ClientObserver>,
}

impl<T: Transport> ScriptClient<T> {
    pub fn new(transport: T, options: ClientOptions) -> Self {
        Self::with_observer(transport, options, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        transport: T,
        options: ClientOptions,
        observer: Arc<dyn ClientObserver>,
    ) -> Self {
        let executor = ScriptServiceExecutor::new(Arc::new(transport), options, observer.clone());
        Self {
            executor: Arc::new(executor),
            observer,
        }
    }

    pub fn executor(&self) -> &ScriptServiceExecutor<T> {
        &self.executor
    }

    pub async fn capabilities(&self, cancel: &CancellationToken) -> ClientResult<CapabilitiesResponse> {
        let metrics = ClientOperationMetricsBuilder::start("get_capabilities");
        self.executor.capabilities(&metrics, cancel).await
    }

    pub async fn service_version(&self, cancel: &CancellationToken) -> ClientResult<ScriptServiceVersion> {
        let metrics = ClientOperationMetricsBuilder::start("get_capabilities");
        self.executor.service_version(&metrics, cancel).await
    }

    /// Single status read for a ticket, starting after `after` lines.
    pub async fn get_status(
        &self,
        ticket: ScriptTicket,
        after: u64,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let metrics = ClientOperationMetricsBuilder::start("get_status");
        let service = self.executor.service_version(&metrics, cancel).await?;
        let context = CommandContext {
            ticket,
            next_log_sequence: after,
            service,
        };
        self.executor.get_status(&context, &metrics, cancel).await
    }

    pub async fn cancel_script(
        &self,
        ticket: ScriptTicket,
        after: u64,
    ) -> ClientResult<ScriptOperationResult> {
        let metrics = ClientOperationMetricsBuilder::start("cancel_script");
        let service = self
            .executor
            .service_version(&metrics, &CancellationToken::new())
            .await?;
        let context = CommandContext {
            ticket,
            next_log_sequence: after,
            service,
        };
        self.executor.cancel_script(&context, &metrics).await
    }

    /// Runs `command` to completion, handing every status to `on_status`.
    ///
    /// Once `cancel` fires the script is cancelled on the agent and its
    /// workspace cleaned up before [`ClientError::Cancelled`] is returned.
    pub async fn execute_script(
        &self,
        command: ExecuteScriptCommand,
        mut on_status: impl FnMut(&ScriptStatus) + Send,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        let span = info_span!("execute_script", ticket = %command.ticket, task_id = %command.task_id);
        let metrics = ClientOperationMetricsBuilder::start("execute_script");
        let result = self
            .run(&command, &mut on_status, &metrics, cancel)
            .instrument(span)
            .await;
        self.observer
            .execute_script_completed(&metrics.build(&result));
        result
    }

    async fn run(
        &self,
        command: &ExecuteScriptCommand,
        on_status: &mut (impl FnMut(&ScriptStatus) + Send),
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        let started = match self.executor.start_script(command, metrics, cancel).await {
            Ok(started) => started,
            Err(ClientError::CancelledAfterPotentiallyStarting { ticket, service }) => {
                debug!("start may have reached the agent; cancelling before returning");
                ScriptOperationResult::started(ticket, service)
            }
            Err(err) => return Err(err),
        };

        let mut logs = Vec::new();
        let mut observe = |status: &ScriptStatus| {
            logs.extend(status.logs.iter().cloned());
            on_status(status);
        };
        observe(&started.status);

        let last = self
            .observe_until_complete(started, &mut observe, metrics, cancel)
            .await?;

        let final_status = match self.executor.finish(&last.context, metrics, cancel).await? {
            Some(status) => {
                observe(&status);
                status
            }
            None => last.status,
        };

        if cancel.is_cancelled() {
            return Err(ClientError::cancelled("script execution"));
        }

        Ok(ScriptExecutionResult {
            ticket: last.context.ticket,
            state: final_status.state,
            exit_code: final_status.exit_code,
            logs,
        })
    }

    async fn observe_until_complete(
        &self,
        started: ScriptOperationResult,
        observe: &mut (impl FnMut(&ScriptStatus) + Send),
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let backoff = self.executor.options().poll_backoff;
        let mut iteration = 0;
        let mut cancel_iteration = 0;
        let mut last = started;

        while last.status.state != ProcessState::Complete {
            if cancel.is_cancelled() {
                last = self.executor.cancel_script(&last.context, metrics).await?;
            } else {
                match self.executor.get_status(&last.context, metrics, cancel).await {
                    Ok(result) => last = result,
                    Err(_) if cancel.is_cancelled() => continue,
                    Err(err) => {
                        self.cancel_in_background(last.context.clone());
                        return Err(err);
                    }
                }
            }

            observe(&last.status);
            if last.status.state == ProcessState::Complete {
                break;
            }

            if cancel.is_cancelled() {
                cancel_iteration += 1;
                tokio::time::sleep(backoff.delay(cancel_iteration)).await;
            } else {
                iteration += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(backoff.delay(iteration)) => {}
                }
            }
        }

        Ok(last)
    }

    /// Last attempt to stop a script whose status can no longer be read.
    fn cancel_in_background(&self, context: CommandContext) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let metrics = ClientOperationMetricsBuilder::start("cancel_script");
            if let Err(err) = executor.cancel_script(&context, &metrics).await {
                debug!(ticket = %context.ticket, error = %err, "background cancel failed");
            }
        });
    }
}
