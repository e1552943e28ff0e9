use std::sync::{Arc, Mutex, PoisonError};

use outpost_protocol::{ProcessOutputSource, ProcessState, ScriptTicket, exit_codes};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::isolation::{IsolationCoordinator, IsolationError};
use crate::output::{OutputSink, ScriptLog, ScriptLogWriter};
use crate::process::{ProcessError, ProcessInvocation, ProcessRunner};
use crate::state::{ScriptState, ScriptStateStore};
use crate::workspace::ScriptWorkspace;

pub const TICKET_ENV_VAR: &str = "OUTPOST_TICKET";
pub const TASK_ID_ENV_VAR: &str = "OUTPOST_TASK_ID";

/// One execution of a workspace's bootstrap script.
///
/// Failures inside the execution never escape: they are written to the
/// script's output and turned into one of the sentinel exit codes.
#[derive(Debug)]
pub struct RunningScript {
    ticket: ScriptTicket,
    task_id: String,
    workspace: ScriptWorkspace,
    state_store: Arc<ScriptStateStore>,
    cancel: CancellationToken,
    status: Mutex<(ProcessState, i32)>,
}

impl RunningScript {
    pub fn new(
        workspace: ScriptWorkspace,
        state_store: Arc<ScriptStateStore>,
        task_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ticket: workspace.ticket().clone(),
            task_id: task_id.into(),
            workspace,
            state_store,
            cancel,
            status: Mutex::new((ProcessState::Pending, 0)),
        }
    }

    pub fn ticket(&self) -> &ScriptTicket {
        &self.ticket
    }

    pub fn state(&self) -> ProcessState {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    pub fn exit_code(&self) -> i32 {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    pub fn log(&self) -> ScriptLog {
        self.workspace.log()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for isolation, runs the script and records the outcome.
    pub async fn execute<R: ProcessRunner>(
        &self,
        runner: &R,
        coordinator: &IsolationCoordinator,
    ) -> i32 {
        let exit_code = match self.workspace.log().writer() {
            Ok(writer) => self.run_isolated(runner, coordinator, Arc::new(writer)).await,
            Err(err) => {
                error!(ticket = %self.ticket, "could not open script log: {err}");
                exit_codes::FATAL
            }
        };

        self.record(|state| state.complete(exit_code), None);
        self.set_status(ProcessState::Complete, exit_code);
        info!(ticket = %self.ticket, exit_code, "script completed");
        exit_code
    }

    async fn run_isolated<R: ProcessRunner>(
        &self,
        runner: &R,
        coordinator: &IsolationCoordinator,
        writer: Arc<ScriptLogWriter>,
    ) -> i32 {
        let settings = match self.workspace.settings() {
            Ok(settings) => settings,
            Err(err) => {
                error!(ticket = %self.ticket, "could not read workspace settings: {err}");
                return exit_codes::FATAL;
            }
        };

        let lease = coordinator
            .acquire(
                settings.isolation,
                settings.mutex_name(),
                settings.mutex_timeout(),
                &self.task_id,
                &self.cancel,
                |message| writer.emit(ProcessOutputSource::StdOut, message),
            )
            .await;
        let _lease = match lease {
            Ok(lease) => lease,
            Err(IsolationError::Cancelled { .. }) => {
                writer.emit(ProcessOutputSource::StdOut, "Script execution canceled.");
                return exit_codes::CANCELED;
            }
            Err(IsolationError::TimedOut { .. }) => {
                writer.emit(ProcessOutputSource::StdOut, "Script execution timed out.");
                return exit_codes::TIMEOUT;
            }
        };

        self.set_status(ProcessState::Running, 0);
        self.record(ScriptState::start, Some(&writer));

        let invocation = ProcessInvocation {
            script: self.workspace.bootstrap_script_path(),
            args: settings.arguments.clone(),
            working_dir: self.workspace.working_directory().to_path_buf(),
            env: vec![
                (TICKET_ENV_VAR.to_string(), self.ticket.to_string()),
                (TASK_ID_ENV_VAR.to_string(), self.task_id.clone()),
            ],
        };
        let sink: Arc<dyn OutputSink> = writer.clone();
        match runner.run(invocation, sink, self.cancel.clone()).await {
            Ok(code) => code,
            Err(ProcessError::Cancelled) => {
                writer.emit(ProcessOutputSource::StdOut, "Script execution canceled.");
                exit_codes::CANCELED
            }
            Err(err) => {
                writer.emit(
                    ProcessOutputSource::StdErr,
                    &format!(
                        "An exception was thrown when invoking {}: {err}",
                        runner.program()
                    ),
                );
                exit_codes::INVOCATION_ERROR
            }
        }
    }

    /// Persists a state change. A failure is reported in the script output
    /// but does not affect the execution.
    fn record(&self, change: impl FnOnce(&mut ScriptState), writer: Option<&ScriptLogWriter>) {
        let Err(err) = self.state_store.update(change) else {
            return;
        };
        warn!(ticket = %self.ticket, "failed to save script state: {err}");
        let message = format!("Warning: An exception occurred saving the ScriptState: {err}");
        match writer {
            Some(writer) => writer.emit(ProcessOutputSource::StdOut, &message),
            None => {
                if let Ok(writer) = self.workspace.log().writer() {
                    writer.emit(ProcessOutputSource::StdOut, &message);
                }
            }
        }
    }

    fn set_status(&self, state: ProcessState, exit_code: i32) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = (state, exit_code);
    }
}
