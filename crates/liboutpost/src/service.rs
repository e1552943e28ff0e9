use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use outpost_protocol::{ProcessState, ScriptStatusResponse, ScriptTicket, exit_codes};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::AgentResult;
use crate::isolation::IsolationCoordinator;
use crate::process::{ProcessRunner, ShellRunner};
use crate::running::RunningScript;
use crate::state::ScriptStateStore;
use crate::workspace::{STATE_FILE_NAME, WorkspaceFactory, WorkspaceSpec};

const START_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A request to run a script under a client-chosen ticket.
#[derive(Debug, Clone)]
pub struct StartScript {
    pub ticket: ScriptTicket,
    pub task_id: String,
    pub spec: WorkspaceSpec,
    /// Block the start call this long, or until the script finishes.
    pub duration_to_wait: Option<Duration>,
}

/// In-memory bookkeeping for one ticket.
#[derive(Debug)]
struct ScriptRecord {
    start_mutex: Arc<tokio::sync::Mutex<()>>,
    state_store: Arc<ScriptStateStore>,
    cancel: CancellationToken,
    running: Mutex<Option<Arc<RunningScript>>>,
}

impl ScriptRecord {
    fn new(state_store: ScriptStateStore) -> Self {
        Self {
            start_mutex: Arc::new(tokio::sync::Mutex::new(())),
            state_store: Arc::new(state_store),
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> Option<Arc<RunningScript>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_running(&self, running: Arc<RunningScript>) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
    }
}

/// Ticket-keyed script lifecycle shared by every protocol generation.
///
/// Start is idempotent per ticket: retried starts return the status of the
/// execution that is already under way. Status falls back to the state
/// persisted in the workspace when the ticket is not known in memory, so a
/// restarted agent still answers for scripts it launched before.
#[derive(Debug)]
pub struct ScriptService<R: ProcessRunner = ShellRunner> {
    workspaces: WorkspaceFactory,
    coordinator: Arc<IsolationCoordinator>,
    runner: Arc<R>,
    records: DashMap<ScriptTicket, Arc<ScriptRecord>>,
}

impl<R: ProcessRunner> ScriptService<R> {
    pub fn new(
        workspaces: WorkspaceFactory,
        coordinator: Arc<IsolationCoordinator>,
        runner: Arc<R>,
    ) -> Self {
        Self {
            workspaces,
            coordinator,
            runner,
            records: DashMap::new(),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceFactory {
        &self.workspaces
    }

    pub async fn start_script(&self, command: StartScript) -> AgentResult<ScriptStatusResponse> {
        let ticket = command.ticket.clone();
        let dir = self.workspaces.workspace_path(&ticket)?;
        // A failed start forgets its record, so a start that queued behind
        // it must register a fresh one.
        let (record, _start) = loop {
            let record = Arc::clone(
                self.records
                    .entry(ticket.clone())
                    .or_insert_with(|| {
                        Arc::new(ScriptRecord::new(ScriptStateStore::for_path(
                            dir.join(STATE_FILE_NAME),
                        )))
                    })
                    .value(),
            );
            let guard = Arc::clone(&record.start_mutex).lock_owned().await;
            if self
                .record(&ticket)
                .is_some_and(|current| Arc::ptr_eq(&current, &record))
            {
                break (record, guard);
            }
        };

        let workspace = if record.state_store.exists() {
            let state = record.state_store.load()?;
            if state.has_started() || record.running().is_some() {
                debug!(ticket = %ticket, "script already started");
                return match record.running() {
                    Some(running) => live_status(&running, 0),
                    None => self.persisted_status(&ticket, 0),
                };
            }
            self.workspaces.get_workspace(&ticket)?
        } else {
            let prepared = self
                .workspaces
                .prepare_workspace(&ticket, &command.spec)
                .and_then(|workspace| {
                    record.state_store.create()?;
                    Ok(workspace)
                });
            match prepared {
                Ok(workspace) => workspace,
                Err(err) => {
                    warn!(ticket = %ticket, "failed to prepare workspace: {err}");
                    if let Ok(Some(partial)) = self.workspaces.existing_workspace(&ticket) {
                        let _ = partial.delete();
                    }
                    self.records
                        .remove_if(&ticket, |_, current| Arc::ptr_eq(current, &record));
                    return Err(err);
                }
            }
        };

        let running = Arc::new(RunningScript::new(
            workspace,
            Arc::clone(&record.state_store),
            command.task_id,
            record.cancel.clone(),
        ));
        record.set_running(Arc::clone(&running));
        self.launch(Arc::clone(&running));
        info!(ticket = %ticket, "script launched");

        if let Some(wait) = command.duration_to_wait {
            let started = Instant::now();
            while running.state() != ProcessState::Complete && started.elapsed() < wait {
                tokio::time::sleep(START_POLL_INTERVAL).await;
            }
        }

        live_status(&running, 0)
    }

    pub fn get_status(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: u64,
    ) -> AgentResult<ScriptStatusResponse> {
        let record = self.record(ticket);
        self.status(ticket, last_log_sequence, record.as_ref())
    }

    /// Signals the script to stop and reports its status without waiting.
    pub fn cancel_script(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: u64,
    ) -> AgentResult<ScriptStatusResponse> {
        let record = self.record(ticket);
        if let Some(record) = &record {
            info!(ticket = %ticket, "cancelling script");
            record.cancel.cancel();
        }
        self.status(ticket, last_log_sequence, record.as_ref())
    }

    /// Forgets the ticket and deletes its workspace, returning the last status.
    pub fn complete_script(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: u64,
    ) -> AgentResult<ScriptStatusResponse> {
        let status = self.get_status(ticket, last_log_sequence)?;
        if !ticket.is_valid() {
            return Ok(status);
        }

        if let Some((_, record)) = self.records.remove(ticket) {
            if record
                .running()
                .is_some_and(|running| running.state() != ProcessState::Complete)
            {
                warn!(ticket = %ticket, "completing a script that is still running, cancelling it");
                record.cancel.cancel();
            }
        }
        if let Some(workspace) = self.workspaces.existing_workspace(ticket)? {
            workspace.delete()?;
        }
        info!(ticket = %ticket, "script completed and workspace removed");
        Ok(status)
    }

    /// True while a start is in progress or the script has not finished.
    pub fn is_running(&self, ticket: &ScriptTicket) -> bool {
        let Some(record) = self.record(ticket) else {
            return false;
        };
        if record.start_mutex.try_lock().is_err() {
            return true;
        }
        record
            .running()
            .is_some_and(|running| running.state() != ProcessState::Complete)
    }

    fn record(&self, ticket: &ScriptTicket) -> Option<Arc<ScriptRecord>> {
        self.records.get(ticket).map(|entry| Arc::clone(entry.value()))
    }

    fn launch(&self, running: Arc<RunningScript>) {
        let runner = Arc::clone(&self.runner);
        let coordinator = Arc::clone(&self.coordinator);
        let span = info_span!("script", ticket = %running.ticket());
        tokio::spawn(
            async move {
                running.execute(runner.as_ref(), &coordinator).await;
            }
            .instrument(span),
        );
    }

    fn status(
        &self,
        ticket: &ScriptTicket,
        after: u64,
        record: Option<&Arc<ScriptRecord>>,
    ) -> AgentResult<ScriptStatusResponse> {
        if !ticket.is_valid() {
            return Ok(unknown_script(ticket, after));
        }

        if let Some(record) = record {
            if let Some(running) = record.running() {
                return live_status(&running, after);
            }
            // A start holding the mutex has not launched anything yet.
            let Ok(_guard) = record.start_mutex.try_lock() else {
                return Ok(ScriptStatusResponse {
                    ticket: ticket.clone(),
                    state: ProcessState::Pending,
                    exit_code: 0,
                    logs: Vec::new(),
                    next_log_sequence: after,
                });
            };
            if let Some(running) = record.running() {
                return live_status(&running, after);
            }
        }

        self.persisted_status(ticket, after)
    }

    fn persisted_status(&self, ticket: &ScriptTicket, after: u64) -> AgentResult<ScriptStatusResponse> {
        let Some(workspace) = self.workspaces.existing_workspace(ticket)? else {
            return Ok(unknown_script(ticket, after));
        };
        let (logs, next_log_sequence) = workspace.log().get_output(after)?;

        let store = ScriptStateStore::new(&workspace);
        if !store.exists() {
            return Ok(ScriptStatusResponse {
                ticket: ticket.clone(),
                state: ProcessState::Complete,
                exit_code: exit_codes::UNKNOWN_SCRIPT,
                logs,
                next_log_sequence,
            });
        }

        let mut state = store.load()?;
        if !state.has_completed() {
            // Nothing is driving this script any more.
            info!(ticket = %ticket, "script never reported completion, marking result unknown");
            state = store.update(|state| state.complete(exit_codes::UNKNOWN_RESULT))?;
        }
        Ok(ScriptStatusResponse {
            ticket: ticket.clone(),
            state: state.state,
            exit_code: state.exit_code.unwrap_or(exit_codes::UNKNOWN_RESULT),
            logs,
            next_log_sequence,
        })
    }
}

fn live_status(running: &RunningScript, after: u64) -> AgentResult<ScriptStatusResponse> {
    // State before output, so a Complete response carries every line.
    let state = running.state();
    let exit_code = running.exit_code();
    let (logs, next_log_sequence) = running.log().get_output(after)?;
    Ok(ScriptStatusResponse {
        ticket: running.ticket().clone(),
        state,
        exit_code,
        logs,
        next_log_sequence,
    })
}

fn unknown_script(ticket: &ScriptTicket, after: u64) -> ScriptStatusResponse {
    ScriptStatusResponse {
        ticket: ticket.clone(),
        state: ProcessState::Complete,
        exit_code: exit_codes::UNKNOWN_SCRIPT,
        logs: Vec::new(),
        next_log_sequence: after,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use outpost_protocol::{ProcessOutputSource, ScriptFile};

    use super::*;
    use crate::error::AgentError;
    use crate::masking::SensitiveValueMasker;
    use crate::test_support::FakeRunner;
    use crate::workspace::WorkspaceSettings;

    fn service(root: &Path, runner: Arc<FakeRunner>) -> ScriptService<FakeRunner> {
        ScriptService::new(
            WorkspaceFactory::new(root, Arc::new(SensitiveValueMasker::default())),
            Arc::new(IsolationCoordinator::new()),
            runner,
        )
    }

    fn start(ticket: &str) -> StartScript {
        StartScript {
            ticket: ScriptTicket::from_string(ticket),
            task_id: "ServerTasks-1".to_string(),
            spec: WorkspaceSpec {
                script_body: "echo hello".to_string(),
                settings: WorkspaceSettings {
                    arguments: vec!["arg-1".to_string()],
                    ..WorkspaceSettings::default()
                },
                files: Vec::new(),
            },
            duration_to_wait: None,
        }
    }

    async fn wait_for_complete(
        service: &ScriptService<FakeRunner>,
        ticket: &ScriptTicket,
    ) -> ScriptStatusResponse {
        let mut after = 0;
        let mut logs = Vec::new();
        loop {
            let status = service.get_status(ticket, after).expect("status");
            assert!(status.next_log_sequence >= after);
            after = status.next_log_sequence;
            logs.extend(status.logs.iter().cloned());
            if status.state == ProcessState::Complete {
                return ScriptStatusResponse { logs, ..status };
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn start_then_poll_to_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::exiting_with(0);
        let service = service(dir.path(), Arc::clone(&runner));
        let command = start("ticket-a");

        service.start_script(command.clone()).await.expect("start");
        let status = wait_for_complete(&service, &command.ticket).await;

        assert_eq!(status.exit_code, 0);
        let stdout: Vec<_> = status
            .logs
            .iter()
            .filter(|line| line.source == ProcessOutputSource::StdOut)
            .map(|line| line.text.as_str())
            .collect();
        assert_eq!(stdout, ["fake script started", "arg-1"]);
        assert!(!service.is_running(&command.ticket));
    }

    #[tokio::test]
    async fn retried_starts_spawn_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::until_cancelled();
        let service = service(dir.path(), Arc::clone(&runner));
        let command = start("ticket-b");

        let (first, second) = tokio::join!(
            service.start_script(command.clone()),
            service.start_script(command.clone())
        );
        let (first, second) = (first.expect("first"), second.expect("second"));
        assert_eq!(first.ticket, second.ticket);
        assert_ne!(first.state, ProcessState::Complete);
        assert_ne!(second.state, ProcessState::Complete);

        while runner.spawn_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.start_script(command.clone()).await.expect("third");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.spawn_count(), 1);
        assert!(service.is_running(&command.ticket));

        service.cancel_script(&command.ticket, 0).expect("cancel");
        let status = wait_for_complete(&service, &command.ticket).await;
        assert_eq!(status.exit_code, exit_codes::CANCELED);
    }

    #[tokio::test]
    async fn unknown_ticket_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), FakeRunner::exiting_with(0));
        for ticket in ["never-started", "../../etc"] {
            let ticket = ScriptTicket::from_string(ticket);
            let status = service.get_status(&ticket, 4).expect("status");
            assert_eq!(status.state, ProcessState::Complete);
            assert_eq!(status.exit_code, exit_codes::UNKNOWN_SCRIPT);
            assert_eq!(status.next_log_sequence, 4);
            service.cancel_script(&ticket, 0).expect("cancel");
        }
    }

    #[tokio::test]
    async fn cancel_complete_then_forget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::until_cancelled();
        let service = service(dir.path(), Arc::clone(&runner));
        let command = start("ticket-c");

        service.start_script(command.clone()).await.expect("start");
        while runner.spawn_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let running = service.get_status(&command.ticket, 0).expect("status");
        assert_eq!(running.state, ProcessState::Running);

        service.cancel_script(&command.ticket, running.next_log_sequence).expect("cancel");
        let done = wait_for_complete(&service, &command.ticket).await;
        assert_eq!(done.exit_code, exit_codes::CANCELED);

        let last = service.complete_script(&command.ticket, 0).expect("complete");
        assert_eq!(last.exit_code, exit_codes::CANCELED);
        assert!(!dir.path().join("ticket-c").exists());

        let forgotten = service.get_status(&command.ticket, 0).expect("status");
        assert_eq!(forgotten.exit_code, exit_codes::UNKNOWN_SCRIPT);
    }

    #[tokio::test]
    async fn waits_for_quick_scripts_when_asked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), FakeRunner::exiting_with(5));
        let command = StartScript {
            duration_to_wait: Some(Duration::from_secs(5)),
            ..start("ticket-d")
        };

        let status = service.start_script(command).await.expect("start");

        assert_eq!(status.state, ProcessState::Complete);
        assert_eq!(status.exit_code, 5);
        assert!(!status.logs.is_empty());
    }

    #[tokio::test]
    async fn bad_attachment_fails_start_before_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::exiting_with(0);
        let service = service(dir.path(), Arc::clone(&runner));
        let mut command = start("ticket-e");
        command.spec.files.push(ScriptFile {
            name: "../escape".to_string(),
            contents: Vec::new(),
        });

        let err = service.start_script(command.clone()).await.expect_err("start fails");

        assert!(matches!(err, AgentError::InvalidFileName(_)));
        assert_eq!(runner.spawn_count(), 0);
        assert!(!dir.path().join("ticket-e").exists());
        assert!(!service.records.contains_key(&command.ticket));
        assert!(!service.is_running(&command.ticket));
        let status = service.get_status(&command.ticket, 0).expect("status");
        assert_eq!(status.exit_code, exit_codes::UNKNOWN_SCRIPT);

        command.spec.files.clear();
        service.start_script(command.clone()).await.expect("clean start");
        assert!(service.records.contains_key(&command.ticket));
    }

    #[tokio::test]
    async fn invalid_ticket_fails_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), FakeRunner::exiting_with(0));
        let err = service
            .start_script(start("not/a/ticket"))
            .await
            .expect_err("invalid");
        assert!(matches!(err, AgentError::InvalidTicket(_)));
    }

    #[tokio::test]
    async fn restarted_agent_reports_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let command = start("ticket-f");
        {
            let first = service(dir.path(), FakeRunner::exiting_with(3));
            first.start_script(command.clone()).await.expect("start");
            wait_for_complete(&first, &command.ticket).await;
        }

        let runner = FakeRunner::exiting_with(0);
        let restarted = service(dir.path(), Arc::clone(&runner));
        let status = restarted.get_status(&command.ticket, 0).expect("status");
        assert_eq!(status.state, ProcessState::Complete);
        assert_eq!(status.exit_code, 3);
        assert!(!status.logs.is_empty());

        let again = restarted.start_script(command.clone()).await.expect("start again");
        assert_eq!(again.exit_code, 3);
        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_execution_completes_with_unknown_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = WorkspaceFactory::new(dir.path(), Arc::new(SensitiveValueMasker::default()));
        let ticket = ScriptTicket::from_string("ticket-g");
        let workspace = factory
            .prepare_workspace(&ticket, &start("ticket-g").spec)
            .expect("prepare");
        let store = ScriptStateStore::new(&workspace);
        store.create().expect("create");
        store.update(|state| state.start()).expect("start");

        let service = service(dir.path(), FakeRunner::exiting_with(0));
        let status = service.get_status(&ticket, 0).expect("status");

        assert_eq!(status.state, ProcessState::Complete);
        assert_eq!(status.exit_code, exit_codes::UNKNOWN_RESULT);
        assert_eq!(store.load().expect("state").exit_code, Some(exit_codes::UNKNOWN_RESULT));
    }
}
