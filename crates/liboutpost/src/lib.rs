pub mod cleaner;
pub mod error;
pub mod handler;
pub mod isolation;
pub mod masking;
pub mod output;
pub mod process;
pub mod running;
pub mod service;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use cleaner::WorkspaceCleaner;
pub use error::{AgentError, AgentResult};
pub use handler::AgentHandler;
pub use isolation::{IsolationCoordinator, IsolationError, IsolationLease};
pub use masking::SensitiveValueMasker;
pub use output::{OutputSink, ScriptLog, ScriptLogWriter};
pub use process::{ProcessError, ProcessInvocation, ProcessRunner, ShellRunner};
pub use running::RunningScript;
pub use service::{ScriptService, StartScript};
pub use state::{ScriptState, ScriptStateStore};
pub use workspace::{ScriptWorkspace, WorkspaceFactory, WorkspaceSettings, WorkspaceSpec};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn now_ms() -> u64 {
    epoch_ms(SystemTime::now())
}
