use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use outpost_protocol::ScriptIsolationLevel;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const INITIAL_WAIT: Duration = Duration::from_millis(100);
const SUBSEQUENT_WAIT: Duration = Duration::from_secs(10 * 60);
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("acquiring isolation mutex {lock_name} was cancelled")]
    Cancelled { lock_name: String },

    #[error("could not acquire {lock_type} on {lock_name} within {timeout:?}")]
    TimedOut {
        lock_name: String,
        lock_type: &'static str,
        timeout: Duration,
    },
}

/// Process-wide registry of named reader/writer locks.
///
/// `NoIsolation` scripts share a read hold, `FullIsolation` scripts take the
/// write hold. Lock objects are created on first use and kept for the life of
/// the process; the holder bookkeeping is only used to explain contention.
#[derive(Debug, Default)]
pub struct IsolationCoordinator {
    locks: DashMap<String, Arc<TaskLock>>,
}

#[derive(Debug, Default)]
struct TaskLock {
    lock: Arc<RwLock<()>>,
    holders: Mutex<Holders>,
}

#[derive(Debug, Default)]
struct Holders {
    writer: Option<String>,
    readers: BTreeMap<String, usize>,
}

#[derive(Debug)]
enum HeldGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Scoped hold on an isolation lock. Dropping it clears this task from the
/// holder bookkeeping and then releases the lock.
#[derive(Debug)]
pub struct IsolationLease {
    task_lock: Arc<TaskLock>,
    guard: Option<HeldGuard>,
    level: ScriptIsolationLevel,
    lock_name: String,
    task_id: String,
}

impl IsolationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for `lock_name` at the requested level.
    ///
    /// The first attempt waits briefly; if the lock is busy a message naming
    /// the current holders is passed to `progress` and waiting continues until
    /// `timeout` elapses. Cancellation always wins over a timeout.
    pub async fn acquire(
        &self,
        level: ScriptIsolationLevel,
        lock_name: &str,
        timeout: Duration,
        task_id: &str,
        cancel: &CancellationToken,
        mut progress: impl FnMut(&str) + Send,
    ) -> Result<IsolationLease, IsolationError> {
        let task_lock = Arc::clone(self.locks.entry(lock_name.to_string()).or_default().value());
        let lock_type = lock_type(level);
        let log = |message: &str| {
            trace!(
                "[{task_id}] [{lock_name}] [{lock_type}] [{}] {message}",
                task_lock.report()
            );
        };

        log("Trying to acquire lock.");
        log(&format!("Trying to acquire lock with wait time of {timeout:?}."));

        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let mut interval = INITIAL_WAIT;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                held = tokio::time::timeout(interval.min(remaining), enter(&task_lock.lock, level)) => held.ok(),
            };

            if let Some(guard) = attempt {
                task_lock.add_holder(task_id, level);
                log("Lock acquired.");
                return Ok(IsolationLease {
                    task_lock: Arc::clone(&task_lock),
                    guard: Some(guard),
                    level,
                    lock_name: lock_name.to_string(),
                    task_id: task_id.to_string(),
                });
            }

            if cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }
            progress(&task_lock.busy_message(task_id, level == ScriptIsolationLevel::FullIsolation));
            interval = SUBSEQUENT_WAIT;
        }

        if cancel.is_cancelled() {
            log("Lock acquire canceled.");
            progress(&task_lock.canceled_message(task_id));
            return Err(IsolationError::Cancelled {
                lock_name: lock_name.to_string(),
            });
        }

        log(&format!("Failed to acquire lock within {timeout:?}."));
        progress(&task_lock.timed_out_message(timeout, task_id));
        Err(IsolationError::TimedOut {
            lock_name: lock_name.to_string(),
            lock_type,
            timeout,
        })
    }

    /// Human-readable description of who holds `lock_name`.
    pub fn report(&self, lock_name: &str) -> String {
        match self.locks.get(lock_name) {
            Some(task_lock) => task_lock.report(),
            None => "no locks".to_string(),
        }
    }
}

async fn enter(lock: &Arc<RwLock<()>>, level: ScriptIsolationLevel) -> HeldGuard {
    match level {
        ScriptIsolationLevel::FullIsolation => HeldGuard::Write(Arc::clone(lock).write_owned().await),
        ScriptIsolationLevel::NoIsolation => HeldGuard::Read(Arc::clone(lock).read_owned().await),
    }
}

fn lock_type(level: ScriptIsolationLevel) -> &'static str {
    match level {
        ScriptIsolationLevel::FullIsolation => "Write Lock",
        ScriptIsolationLevel::NoIsolation => "Read Lock",
    }
}

impl TaskLock {
    fn holders(&self) -> std::sync::MutexGuard<'_, Holders> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_holder(&self, task_id: &str, level: ScriptIsolationLevel) {
        let mut holders = self.holders();
        match level {
            ScriptIsolationLevel::FullIsolation => holders.writer = Some(task_id.to_string()),
            ScriptIsolationLevel::NoIsolation => {
                *holders.readers.entry(task_id.to_string()).or_default() += 1;
            }
        }
    }

    /// Removing a holder that is not recorded is a no-op.
    fn remove_holder(&self, task_id: &str, level: ScriptIsolationLevel) {
        let mut holders = self.holders();
        match level {
            ScriptIsolationLevel::FullIsolation => {
                if holders.writer.as_deref() == Some(task_id) {
                    holders.writer = None;
                }
            }
            ScriptIsolationLevel::NoIsolation => {
                if let Some(count) = holders.readers.get_mut(task_id) {
                    *count -= 1;
                    if *count == 0 {
                        holders.readers.remove(task_id);
                    }
                }
            }
        }
    }

    fn report(&self) -> String {
        let holders = self.holders();
        if let Some(writer) = &holders.writer {
            return format!("\"{writer}\" (has a write lock)");
        }
        match holders.readers.len() {
            0 => "no locks".to_string(),
            1 => format!("\"{}\" (has a read lock)", join_keys(&holders.readers)),
            _ => format!("\"{}\" (have read locks)", join_keys(&holders.readers)),
        }
    }

    /// Returns the holder list, whether several tasks hold the lock, and
    /// whether `task_id` is one of them.
    fn list_tasks(&self, task_id: &str) -> (String, bool, bool) {
        let holders = self.holders();
        if let Some(writer) = &holders.writer {
            return (writer.clone(), false, writer == task_id);
        }
        if holders.readers.is_empty() {
            return ("(error - task not found)".to_string(), false, false);
        }
        let names: Vec<&str> = holders
            .readers
            .keys()
            .map(|id| if id == task_id { "This Task" } else { id.as_str() })
            .collect();
        (
            readable_join(&names),
            holders.readers.len() > 1,
            holders.readers.contains_key(task_id),
        )
    }

    fn busy_message(&self, task_id: &str, waiting_on_write: bool) -> String {
        let (tasks, multiple, this_task_holds) = self.list_tasks(task_id);
        if multiple {
            return format!(
                "Waiting on scripts in tasks {tasks} to finish. This script requires that no other scripts are executing on this target at the same time."
            );
        }
        if this_task_holds {
            let who = if waiting_on_write { "this" } else { "another" };
            return format!(
                "Waiting on another script in this task to finish as {who} task requires that no other scripts are executing on this target at the same time."
            );
        }
        let who = if waiting_on_write { "this" } else { "that" };
        format!(
            "Waiting for the script in task {tasks} to finish as {who} script requires that no other scripts are executing on this target at the same time."
        )
    }

    fn canceled_message(&self, task_id: &str) -> String {
        let (tasks, multiple, _) = self.list_tasks(task_id);
        format!(
            "This task was canceled before it could start. {}",
            still_running(&tasks, multiple)
        )
    }

    fn timed_out_message(&self, timeout: Duration, task_id: &str) -> String {
        let (tasks, multiple, _) = self.list_tasks(task_id);
        let minutes = (timeout.as_secs_f64() / 60.0).round() as u64;
        format!(
            "This task waited more than {minutes} minutes and timed out. {}",
            still_running(&tasks, multiple)
        )
    }
}

impl Drop for IsolationLease {
    fn drop(&mut self) {
        trace!(
            "[{}] [{}] [{}] [{}] Releasing lock.",
            self.task_id,
            self.lock_name,
            lock_type(self.level),
            self.task_lock.report()
        );
        self.task_lock.remove_holder(&self.task_id, self.level);
        self.guard.take();
    }
}

fn still_running(tasks: &str, multiple: bool) -> String {
    if multiple {
        format!("Tasks {tasks} are still running.")
    } else {
        format!("Task {tasks} is still running.")
    }
}

fn join_keys(readers: &BTreeMap<String, usize>) -> String {
    readers.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// `a`, `a and b`, `a, b and c`.
fn readable_join(items: &[&str]) -> String {
    match items {
        [] => String::new(),
        [only] => only.to_string(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}
