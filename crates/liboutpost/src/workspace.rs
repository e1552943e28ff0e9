use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use outpost_protocol::{
    DEFAULT_ISOLATION_MUTEX_NAME, NO_MUTEX_TIMEOUT_MS, ScriptFile, ScriptIsolationLevel,
    ScriptTicket,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AgentError, AgentResult};
use crate::masking::SensitiveValueMasker;
use crate::output::ScriptLog;

pub const BOOTSTRAP_SCRIPT_FILE_NAME: &str = "Bootstrap.sh";
pub const LOG_FILE_NAME: &str = "Output.log";
pub const SETTINGS_FILE_NAME: &str = "workspace.json";
pub const STATE_FILE_NAME: &str = "scriptstate.json";

/// How the script in a workspace wants to be isolated and invoked.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSettings {
    pub isolation: ScriptIsolationLevel,
    pub isolation_mutex_timeout_ms: u64,
    #[serde(default)]
    pub isolation_mutex_name: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl WorkspaceSettings {
    pub fn mutex_timeout(&self) -> Duration {
        Duration::from_millis(self.isolation_mutex_timeout_ms)
    }

    pub fn mutex_name(&self) -> &str {
        self.isolation_mutex_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_ISOLATION_MUTEX_NAME)
    }
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            isolation: ScriptIsolationLevel::NoIsolation,
            isolation_mutex_timeout_ms: NO_MUTEX_TIMEOUT_MS,
            isolation_mutex_name: None,
            arguments: Vec::new(),
        }
    }
}

/// Everything needed to materialize a script on disk.
#[derive(Debug, Clone)]
pub struct WorkspaceSpec {
    pub script_body: String,
    pub settings: WorkspaceSettings,
    pub files: Vec<ScriptFile>,
}

/// Creates and locates per-ticket workspaces under a single root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceFactory {
    root: PathBuf,
    masker: Arc<SensitiveValueMasker>,
}

/// A ticket's working directory: bootstrap script, attached files, output
/// log, isolation settings and persisted state.
#[derive(Debug, Clone)]
pub struct ScriptWorkspace {
    ticket: ScriptTicket,
    dir: PathBuf,
    masker: Arc<SensitiveValueMasker>,
}

impl WorkspaceFactory {
    pub fn new(root: impl Into<PathBuf>, masker: Arc<SensitiveValueMasker>) -> Self {
        Self {
            root: root.into(),
            masker,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_path(&self, ticket: &ScriptTicket) -> AgentResult<PathBuf> {
        if !ticket.is_valid() {
            return Err(AgentError::InvalidTicket(ticket.to_string()));
        }
        Ok(self.root.join(ticket.as_str()))
    }

    /// Returns the workspace for `ticket`, creating its directory if needed.
    pub fn get_workspace(&self, ticket: &ScriptTicket) -> AgentResult<ScriptWorkspace> {
        let dir = self.workspace_path(ticket)?;
        fs::create_dir_all(&dir)?;
        Ok(self.workspace_at(ticket.clone(), dir))
    }

    /// Returns the workspace for `ticket` only if it already exists on disk.
    pub fn existing_workspace(&self, ticket: &ScriptTicket) -> AgentResult<Option<ScriptWorkspace>> {
        let dir = self.workspace_path(ticket)?;
        if dir.is_dir() {
            Ok(Some(self.workspace_at(ticket.clone(), dir)))
        } else {
            Ok(None)
        }
    }

    pub fn prepare_workspace(
        &self,
        ticket: &ScriptTicket,
        spec: &WorkspaceSpec,
    ) -> AgentResult<ScriptWorkspace> {
        let workspace = self.get_workspace(ticket)?;
        workspace.bootstrap_script(&spec.script_body)?;
        for file in &spec.files {
            workspace.write_file(&file.name, &file.contents)?;
        }
        workspace.save_settings(&spec.settings)?;
        debug!(ticket = %ticket, dir = %workspace.dir.display(), files = spec.files.len(), "workspace prepared");
        Ok(workspace)
    }

    /// Workspaces that were never finished: they still hold an output log or,
    /// failing that, a bootstrap script.
    pub fn uncompleted_workspaces(&self) -> AgentResult<Vec<ScriptWorkspace>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut workspaces = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let ticket = ScriptTicket::from_string(name);
            if !ticket.is_valid() {
                continue;
            }
            let workspace = self.workspace_at(ticket, entry.path());
            if workspace.log_file_path().exists() || workspace.bootstrap_script_path().exists() {
                workspaces.push(workspace);
            }
        }
        Ok(workspaces)
    }

    fn workspace_at(&self, ticket: ScriptTicket, dir: PathBuf) -> ScriptWorkspace {
        ScriptWorkspace {
            ticket,
            dir,
            masker: Arc::clone(&self.masker),
        }
    }
}

impl ScriptWorkspace {
    pub fn ticket(&self) -> &ScriptTicket {
        &self.ticket
    }

    pub fn working_directory(&self) -> &Path {
        &self.dir
    }

    pub fn bootstrap_script_path(&self) -> PathBuf {
        self.dir.join(BOOTSTRAP_SCRIPT_FILE_NAME)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    pub fn log(&self) -> ScriptLog {
        ScriptLog::new(self.log_file_path(), Arc::clone(&self.masker))
    }

    pub fn bootstrap_script(&self, body: &str) -> AgentResult<()> {
        let path = self.bootstrap_script_path();
        fs::write(&path, body.replace("\r\n", "\n"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// Writes an attached file next to the bootstrap script. Only plain file
    /// names are accepted.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> AgentResult<()> {
        let reserved = [
            BOOTSTRAP_SCRIPT_FILE_NAME,
            LOG_FILE_NAME,
            SETTINGS_FILE_NAME,
            STATE_FILE_NAME,
        ];
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
            || reserved.contains(&name)
        {
            return Err(AgentError::InvalidFileName(name.to_string()));
        }
        fs::write(self.dir.join(name), contents)?;
        Ok(())
    }

    pub fn settings(&self) -> AgentResult<WorkspaceSettings> {
        match fs::read(self.dir.join(SETTINGS_FILE_NAME)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(WorkspaceSettings::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save_settings(&self, settings: &WorkspaceSettings) -> AgentResult<()> {
        fs::write(
            self.dir.join(SETTINGS_FILE_NAME),
            serde_json::to_vec_pretty(settings)?,
        )?;
        Ok(())
    }

    pub fn delete(&self) -> AgentResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AgentError::Workspace(format!(
                "could not delete {}: {err}",
                self.dir.display()
            ))),
        }
    }
}
