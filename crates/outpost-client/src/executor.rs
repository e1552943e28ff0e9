use crate::error::{ClientError, ClientResult};
use crate::metrics::{ClientObserver, ClientOperationMetricsBuilder, RpcCall};
use crate::options::ClientOptions;
use crate::retry::RpcCallRetryHandler;
use crate::rpc::RpcCallExecutor;
use crate::transport::Transport;
use crate::version::{ScriptServiceVersionSelector, fetch_capabilities};
use outpost_protocol::{
    CapabilitiesResponse, NO_MUTEX_TIMEOUT_MS, ProcessOutput, ProcessState, Request, Response,
    ScriptFile, ScriptIsolationLevel, ScriptServiceVersion, ScriptStatusResponse, ScriptTicket,
    StartScriptCommand, StartScriptCommandV1, StartScriptCommandV2, StartScriptResponseV1,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A script to run, independent of the service version that will carry it.
#[derive(Debug, Clone)]
pub struct ExecuteScriptCommand {
    pub ticket: ScriptTicket,
    pub task_id: String,
    pub script_body: String,
    pub arguments: Vec<String>,
    pub files: Vec<ScriptFile>,
    pub isolation: ScriptIsolationLevel,
    pub isolation_mutex_name: Option<String>,
    /// `None` waits for the isolation mutex indefinitely.
    pub isolation_mutex_timeout: Option<Duration>,
    /// Lets the agent hold the start response until a quick script finishes.
    pub duration_to_wait: Option<Duration>,
}

impl ExecuteScriptCommand {
    pub fn new(task_id: impl Into<String>, script_body: impl Into<String>) -> Self {
        Self {
            ticket: ScriptTicket::new(),
            task_id: task_id.into(),
            script_body: script_body.into(),
            arguments: Vec::new(),
            files: Vec::new(),
            isolation: ScriptIsolationLevel::NoIsolation,
            isolation_mutex_name: None,
            isolation_mutex_timeout: None,
            duration_to_wait: None,
        }
    }

    fn to_start_command(&self, service: ScriptServiceVersion) -> StartScriptCommand {
        if service == ScriptServiceVersion::V1 {
            return StartScriptCommand::V1(StartScriptCommandV1 {
                script_body: self.script_body.clone(),
                isolation: self.isolation,
                isolation_mutex_name: self.isolation_mutex_name.clone(),
                arguments: self.arguments.clone(),
                task_id: self.task_id.clone(),
                files: self.files.clone(),
            });
        }

        let command = StartScriptCommandV2 {
            ticket: self.ticket.clone(),
            script_body: self.script_body.clone(),
            isolation: self.isolation,
            isolation_mutex_timeout_ms: self
                .isolation_mutex_timeout
                .map_or(NO_MUTEX_TIMEOUT_MS, |timeout| {
                    (timeout.as_millis() as u64).min(NO_MUTEX_TIMEOUT_MS)
                }),
            isolation_mutex_name: self.isolation_mutex_name.clone(),
            arguments: self.arguments.clone(),
            task_id: self.task_id.clone(),
            duration_to_wait_ms: self.duration_to_wait.map(|d| d.as_millis() as u64),
            files: self.files.clone(),
        };
        match service {
            ScriptServiceVersion::V3Alpha => StartScriptCommand::V3Alpha(command),
            ScriptServiceVersion::KubernetesV1 => StartScriptCommand::KubernetesV1(command),
            _ => StartScriptCommand::V2(command),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatus {
    pub state: ProcessState,
    pub exit_code: i32,
    pub logs: Vec<ProcessOutput>,
}

impl ScriptStatus {
    fn pending() -> Self {
        Self {
            state: ProcessState::Pending,
            exit_code: 0,
            logs: Vec::new(),
        }
    }
}

/// What the next call for a script needs to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub ticket: ScriptTicket,
    pub next_log_sequence: u64,
    pub service: ScriptServiceVersion,
}

#[derive(Debug, Clone)]
pub struct ScriptOperationResult {
    pub status: ScriptStatus,
    pub context: CommandContext,
}

impl ScriptOperationResult {
    pub(crate) fn started(ticket: ScriptTicket, service: ScriptServiceVersion) -> Self {
        Self {
            status: ScriptStatus::pending(),
            context: CommandContext {
                ticket,
                next_log_sequence: 0,
                service,
            },
        }
    }

    fn from_response(response: ScriptStatusResponse, service: ScriptServiceVersion) -> Self {
        Self {
            status: ScriptStatus {
                state: response.state,
                exit_code: response.exit_code,
                logs: response.logs,
            },
            context: CommandContext {
                ticket: response.ticket,
                next_log_sequence: response.next_log_sequence,
                service,
            },
        }
    }
}

/// Maps start/poll/cancel/finish onto the negotiated script service.
pub struct ScriptServiceExecutor<T: Transport> {
    transport: Arc<T>,
    rpc: RpcCallExecutor,
    options: ClientOptions,
    selector: ScriptServiceVersionSelector,
}

impl<T: Transport> ScriptServiceExecutor<T> {
    pub fn new(transport: Arc<T>, options: ClientOptions, observer: Arc<dyn ClientObserver>) -> Self {
        let retry_handler = RpcCallRetryHandler::new(options.retry_duration)
            .with_backoff(options.initial_backoff, options.max_backoff);
        Self {
            transport,
            rpc: RpcCallExecutor::new(retry_handler, observer),
            options,
            selector: ScriptServiceVersionSelector::default(),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Version chosen by the first successful negotiation, if any.
    pub fn negotiated_version(&self) -> Option<ScriptServiceVersion> {
        self.selector.selected()
    }

    pub async fn service_version(
        &self,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        self.selector
            .determine(&self.transport, &self.rpc, &self.options, metrics, cancel)
            .await
    }

    pub async fn capabilities(
        &self,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<CapabilitiesResponse> {
        fetch_capabilities(&self.transport, &self.rpc, &self.options, metrics, cancel).await
    }

    fn retries_for(&self, service: ScriptServiceVersion) -> bool {
        self.options.retries_enabled && !service.is_legacy()
    }

    /// Starts the script. A cancellation that leaves the agent possibly
    /// running it is reported as
    /// [`ClientError::CancelledAfterPotentiallyStarting`] so the caller can
    /// cancel and finish it.
    pub async fn start_script(
        &self,
        command: &ExecuteScriptCommand,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let service = self.service_version(metrics, cancel).await?;
        let request = Request::StartScript {
            command: command.to_start_command(service),
        };
        let rpc_call = RpcCall::for_request(&request);

        if service.is_legacy() {
            let data = self
                .rpc
                .execute(
                    false,
                    rpc_call,
                    |ct| invoke(self.transport.clone(), request.clone(), ct),
                    metrics,
                    cancel,
                )
                .await
                .map_err(|err| {
                    if cancel.is_cancelled() {
                        ClientError::cancelled(rpc_call.name)
                    } else {
                        err
                    }
                })?;
            let response: StartScriptResponseV1 = decode(data, "start script response")?;
            return Ok(ScriptOperationResult::started(response.ticket, service));
        }

        // Attempts that may have reached the agent.
        let connected = Arc::new(AtomicI64::new(0));
        let result = self
            .rpc
            .execute(
                self.retries_for(service),
                rpc_call,
                |ct| {
                    let transport = self.transport.clone();
                    let request = request.clone();
                    let connected = connected.clone();
                    async move {
                        connected.fetch_add(1, Ordering::SeqCst);
                        let result = invoke(transport, request, ct).await;
                        if result.as_ref().is_err_and(ClientError::is_connecting) {
                            connected.fetch_sub(1, Ordering::SeqCst);
                        }
                        result
                    }
                },
                metrics,
                cancel,
            )
            .await;

        match result {
            Ok(data) => {
                let response: ScriptStatusResponse = decode(data, "script status")?;
                Ok(ScriptOperationResult::from_response(response, service))
            }
            Err(err) if cancel.is_cancelled() => {
                let retried = connected.load(Ordering::SeqCst) > 1;
                if !err.is_connecting() || retried {
                    debug!(ticket = %command.ticket, error = %err, "start cancelled after it may have reached the agent");
                    Err(ClientError::CancelledAfterPotentiallyStarting {
                        ticket: command.ticket.clone(),
                        service,
                    })
                } else {
                    Err(ClientError::cancelled(rpc_call.name))
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_status(
        &self,
        context: &CommandContext,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let request = Request::GetStatus {
            service: context.service,
            ticket: context.ticket.clone(),
            last_log_sequence: context.next_log_sequence,
        };
        let data = self
            .rpc
            .execute(
                self.retries_for(context.service),
                RpcCall::for_request(&request),
                |ct| invoke(self.transport.clone(), request.clone(), ct),
                metrics,
                cancel,
            )
            .await?;
        let response: ScriptStatusResponse = decode(data, "script status")?;
        Ok(ScriptOperationResult::from_response(response, context.service))
    }

    /// Asks the agent to stop the script. Deliberately not tied to any
    /// caller cancellation.
    pub async fn cancel_script(
        &self,
        context: &CommandContext,
        metrics: &ClientOperationMetricsBuilder,
    ) -> ClientResult<ScriptOperationResult> {
        let request = Request::CancelScript {
            service: context.service,
            ticket: context.ticket.clone(),
            last_log_sequence: context.next_log_sequence,
        };
        let data = self
            .rpc
            .execute_with_no_retries(
                RpcCall::for_request(&request),
                |ct| invoke(self.transport.clone(), request.clone(), ct),
                None,
                metrics,
                &CancellationToken::new(),
            )
            .await?;
        let response: ScriptStatusResponse = decode(data, "script status")?;
        Ok(ScriptOperationResult::from_response(response, context.service))
    }

    /// Cleans up the script's workspace on the agent.
    ///
    /// The legacy service reports the final status here, so its call is
    /// never abandoned and its failures are returned. For the other
    /// services cleanup is best effort: the call is abandoned
    /// `abandon_finish_after` once `cancel` fires and failures are only
    /// logged.
    pub async fn finish(
        &self,
        context: &CommandContext,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<ScriptStatus>> {
        let request = Request::CompleteScript {
            service: context.service,
            ticket: context.ticket.clone(),
            last_log_sequence: context.next_log_sequence,
        };
        let rpc_call = RpcCall::for_request(&request);
        let action = |ct| invoke(self.transport.clone(), request.clone(), ct);

        if context.service.is_legacy() {
            let data = self
                .rpc
                .execute_with_no_retries(rpc_call, action, None, metrics, &CancellationToken::new())
                .await?;
            let response: ScriptStatusResponse = decode(data, "script status")?;
            return Ok(Some(
                ScriptOperationResult::from_response(response, context.service).status,
            ));
        }

        let result = self
            .rpc
            .execute_with_no_retries(
                rpc_call,
                action,
                Some(self.options.abandon_finish_after),
                metrics,
                cancel,
            )
            .await;
        if let Err(err) = result {
            warn!(ticket = %context.ticket, "Failed to cleanup the script working directory on the agent");
            debug!(ticket = %context.ticket, error = %err, "complete script failed");
        }
        Ok(None)
    }
}

pub(crate) async fn invoke<T: Transport>(
    transport: Arc<T>,
    request: Request,
    cancel: CancellationToken,
) -> ClientResult<Option<serde_json::Value>> {
    match transport.send(request, cancel).await? {
        Response::Ok { data } => Ok(data),
        Response::Error { message, code } => Err(ClientError::Agent { code, message }),
        Response::Hello { .. } => Err(ClientError::Protocol {
            message: "agent sent a hello in place of a response".to_string(),
        }),
    }
}

pub(crate) fn decode<R: DeserializeOwned>(
    data: Option<serde_json::Value>,
    what: &str,
) -> ClientResult<R> {
    let data = data.ok_or_else(|| ClientError::Protocol {
        message: format!("agent returned no {what}"),
    })?;
    serde_json::from_value(data).map_err(|err| ClientError::Protocol {
        message: format!("failed to parse {what}: {err}"),
    })
}
