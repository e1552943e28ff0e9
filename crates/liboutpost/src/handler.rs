use std::sync::Arc;
use std::time::Duration;

use outpost_protocol::{
    CapabilitiesResponse, NO_MUTEX_TIMEOUT_MS, Request, Response, ScriptServiceVersion,
    ScriptTicket, StartScriptCommand, StartScriptCommandV1, StartScriptCommandV2,
    StartScriptResponseV1,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::process::{ProcessRunner, ShellRunner};
use crate::service::{ScriptService, StartScript};
use crate::workspace::{WorkspaceSettings, WorkspaceSpec};

/// Maps each protocol generation's request shape onto the shared
/// [`ScriptService`] and turns the results back into wire responses.
#[derive(Debug)]
pub struct AgentHandler<R: ProcessRunner = ShellRunner> {
    service: Arc<ScriptService<R>>,
    supported: Vec<ScriptServiceVersion>,
}

impl<R: ProcessRunner> AgentHandler<R> {
    /// The Kubernetes service is only advertised when `kubernetes` is set.
    pub fn new(service: Arc<ScriptService<R>>, kubernetes: bool) -> Self {
        let mut supported = vec![
            ScriptServiceVersion::V1,
            ScriptServiceVersion::V2,
            ScriptServiceVersion::V3Alpha,
        ];
        if kubernetes {
            supported.push(ScriptServiceVersion::KubernetesV1);
        }
        Self { service, supported }
    }

    pub fn service(&self) -> &Arc<ScriptService<R>> {
        &self.service
    }

    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            supported_services: self
                .supported
                .iter()
                .map(|version| version.service_name().to_string())
                .collect(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let (service, method) = request.rpc_name();
        debug!(service, method, "handling request");
        match self.dispatch(request).await {
            Ok(data) => Response::ok(data),
            Err(err) => {
                warn!(service, method, "request failed: {err}");
                let (code, message) = err.to_error_code();
                Response::error(code, message)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> AgentResult<Option<Value>> {
        match request {
            Request::GetCapabilities => Ok(Some(serde_json::to_value(self.capabilities())?)),
            Request::StartScript { command } => {
                self.ensure_supported(command.service())?;
                match command {
                    StartScriptCommand::V1(command) => {
                        let ticket = ScriptTicket::new();
                        self.service
                            .start_script(start_v1(ticket.clone(), command))
                            .await?;
                        Ok(Some(serde_json::to_value(StartScriptResponseV1 { ticket })?))
                    }
                    StartScriptCommand::V2(command)
                    | StartScriptCommand::V3Alpha(command)
                    | StartScriptCommand::KubernetesV1(command) => {
                        let status = self.service.start_script(start_v2(command)).await?;
                        Ok(Some(serde_json::to_value(status)?))
                    }
                }
            }
            Request::GetStatus {
                service,
                ticket,
                last_log_sequence,
            } => {
                self.ensure_supported(service)?;
                let status = self.service.get_status(&ticket, last_log_sequence)?;
                Ok(Some(serde_json::to_value(status)?))
            }
            Request::CancelScript {
                service,
                ticket,
                last_log_sequence,
            } => {
                self.ensure_supported(service)?;
                let status = self.service.cancel_script(&ticket, last_log_sequence)?;
                Ok(Some(serde_json::to_value(status)?))
            }
            Request::CompleteScript {
                service,
                ticket,
                last_log_sequence,
            } => {
                self.ensure_supported(service)?;
                let status = self.service.complete_script(&ticket, last_log_sequence)?;
                if service.is_legacy() {
                    Ok(Some(serde_json::to_value(status)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn ensure_supported(&self, version: ScriptServiceVersion) -> AgentResult<()> {
        if self.supported.contains(&version) {
            Ok(())
        } else {
            Err(AgentError::UnsupportedService(version))
        }
    }
}

fn start_v1(ticket: ScriptTicket, command: StartScriptCommandV1) -> StartScript {
    StartScript {
        ticket,
        task_id: command.task_id,
        spec: WorkspaceSpec {
            script_body: command.script_body,
            settings: WorkspaceSettings {
                isolation: command.isolation,
                isolation_mutex_timeout_ms: NO_MUTEX_TIMEOUT_MS,
                isolation_mutex_name: command.isolation_mutex_name,
                arguments: command.arguments,
            },
            files: command.files,
        },
        duration_to_wait: None,
    }
}

fn start_v2(command: StartScriptCommandV2) -> StartScript {
    StartScript {
        ticket: command.ticket,
        task_id: command.task_id,
        spec: WorkspaceSpec {
            script_body: command.script_body,
            settings: WorkspaceSettings {
                isolation: command.isolation,
                isolation_mutex_timeout_ms: command.isolation_mutex_timeout_ms,
                isolation_mutex_name: command.isolation_mutex_name,
                arguments: command.arguments,
            },
            files: command.files,
        },
        duration_to_wait: command.duration_to_wait_ms.map(Duration::from_millis),
    }
}
