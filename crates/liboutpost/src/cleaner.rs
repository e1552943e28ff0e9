use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentResult;
use crate::process::ProcessRunner;
use crate::service::ScriptService;
use crate::workspace::ScriptWorkspace;

/// Deletes workspaces that were never completed by their client once their
/// files have gone untouched for `max_age`.
#[derive(Debug)]
pub struct WorkspaceCleaner<R: ProcessRunner> {
    service: Arc<ScriptService<R>>,
    max_age: Duration,
}

impl<R: ProcessRunner> WorkspaceCleaner<R> {
    pub fn new(service: Arc<ScriptService<R>>, max_age: Duration) -> Self {
        Self { service, max_age }
    }

    /// One cleaning pass. Returns how many workspaces were deleted.
    pub fn clean(&self) -> AgentResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        debug!(max_age = ?self.max_age, "cleaning old workspaces");

        let mut deleted = 0;
        for workspace in self.service.workspaces().uncompleted_workspaces()? {
            if self.service.is_running(workspace.ticket()) || !looks_old(&workspace, cutoff) {
                continue;
            }
            match workspace.delete() {
                Ok(()) => deleted += 1,
                Err(err) => warn!(
                    dir = %workspace.working_directory().display(),
                    "could not delete workspace: {err}"
                ),
            }
        }

        if deleted > 0 {
            info!("Deleted {deleted} workspace{}", if deleted == 1 { "" } else { "s" });
        } else {
            debug!("no workspaces need to be deleted");
        }
        Ok(deleted)
    }

    /// Cleans every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.clean() {
                        warn!("workspace cleaning failed: {err}");
                    }
                }
            }
        }
    }
}

/// The log decides when present; otherwise the bootstrap script does.
fn looks_old(workspace: &ScriptWorkspace, cutoff: SystemTime) -> bool {
    written_before(&workspace.log_file_path(), cutoff)
        .or_else(|| written_before(&workspace.bootstrap_script_path(), cutoff))
        .unwrap_or(false)
}

fn written_before(path: &Path, cutoff: SystemTime) -> Option<bool> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified < cutoff)
}
