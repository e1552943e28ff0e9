use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use outpost_protocol::ProcessState;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::now_ms;
use crate::workspace::ScriptWorkspace;

/// Persisted lifecycle of a script, stored beside its output log so status
/// survives an agent restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptState {
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl ScriptState {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Pending,
            exit_code: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.state = ProcessState::Running;
        self.started_at_ms.get_or_insert_with(now_ms);
    }

    pub fn complete(&mut self, exit_code: i32) {
        self.state = ProcessState::Complete;
        self.exit_code = Some(exit_code);
        self.completed_at_ms.get_or_insert_with(now_ms);
    }

    pub fn has_started(&self) -> bool {
        self.started_at_ms.is_some() || self.state != ProcessState::Pending
    }

    pub fn has_completed(&self) -> bool {
        self.state == ProcessState::Complete
    }
}

impl Default for ScriptState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and writes one workspace's state file. Saves go through a temp file
/// and rename so a reader never sees a half-written state.
#[derive(Debug)]
pub struct ScriptStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ScriptStateStore {
    pub fn new(workspace: &ScriptWorkspace) -> Self {
        Self::for_path(workspace.state_file_path())
    }

    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Writes a fresh pending state, replacing anything already there.
    pub fn create(&self) -> AgentResult<ScriptState> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = ScriptState::new();
        self.write(&state)?;
        Ok(state)
    }

    pub fn load(&self) -> AgentResult<ScriptState> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    pub fn save(&self, state: &ScriptState) -> AgentResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(state)
    }

    /// Load, modify and save under one lock.
    pub fn update(&self, modify: impl FnOnce(&mut ScriptState)) -> AgentResult<ScriptState> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.read()?;
        modify(&mut state);
        self.write(&state)?;
        Ok(state)
    }

    fn read(&self) -> AgentResult<ScriptState> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(AgentError::Workspace(format!(
                "script state not found at {}",
                self.path.display()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, state: &ScriptState) -> AgentResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
