use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use outpost_protocol::ProcessOutputSource;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::output::OutputSink;

/// How long to keep reading output after the process has gone, in case a
/// detached grandchild still holds the pipes open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longer lines are split and recorded as several entries.
pub const MAX_OUTPUT_LINE_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process was cancelled")]
    Cancelled,
}

/// A script to run and where to run it.
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Runs a script to completion, streaming its output into `output`.
///
/// Implementations must stop the process and return
/// [`ProcessError::Cancelled`] once `cancel` fires.
pub trait ProcessRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: ProcessInvocation,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<i32, ProcessError>> + Send;

    /// Program name used in invocation error messages.
    fn program(&self) -> String;
}

/// Runs bootstrap scripts with a shell in their own process group so that
/// cancellation takes down anything the script started.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl ShellRunner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("bash")
    }
}

impl ProcessRunner for ShellRunner {
    async fn run(
        &self,
        invocation: ProcessInvocation,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<i32, ProcessError> {
        let program = self.program();
        let mut command = Command::new(&self.shell);
        command
            .arg(&invocation.script)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        output.emit(
            ProcessOutputSource::Debug,
            &format!("Executing {program} {}", invocation.script.display()),
        );

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(?pid, script = %invocation.script.display(), "script process started");

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, ProcessOutputSource::StdOut, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, ProcessOutputSource::StdErr, Arc::clone(&output)));
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            if let Some(pid) = pid {
                if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    warn!(pid, "failed to kill script process group: {err}");
                }
            }
            if let Err(err) = child.kill().await {
                debug!("script process already gone: {err}");
            }
            drain(pumps).await;
            output.emit(ProcessOutputSource::Debug, "Script process was killed");
            return Err(ProcessError::Cancelled);
        };

        let status = status.map_err(|source| ProcessError::Wait {
            program: program.clone(),
            source,
        })?;
        drain(pumps).await;

        let code = exit_code(status);
        output.emit(
            ProcessOutputSource::Debug,
            &format!("Process exited with code {code}"),
        );
        Ok(code)
    }

    fn program(&self) -> String {
        self.shell.display().to_string()
    }
}

fn pump<R>(reader: R, source: ProcessOutputSource, output: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_OUTPUT_LINE_BYTES as u64);
            match limited.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    // Sinks write to disk.
                    let output = Arc::clone(&output);
                    let written =
                        tokio::task::spawn_blocking(move || output.emit(source, &line)).await;
                    if let Err(err) = written {
                        warn!(?source, "script output sink failed: {err}");
                    }
                }
                Err(err) => {
                    debug!(?source, "stopped reading script output: {err}");
                    break;
                }
            }
        }
    })
}

async fn drain(pumps: Vec<JoinHandle<()>>) {
    for mut handle in pumps {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CapturedOutput;

    fn invocation(dir: &std::path::Path, body: &str) -> ProcessInvocation {
        let script = dir.join("Bootstrap.sh");
        std::fs::write(&script, body).expect("write script");
        ProcessInvocation {
            script,
            args: vec!["first".to_string()],
            working_dir: dir.to_path_buf(),
            env: vec![("OUTPOST_TEST_VAR".to_string(), "from-env".to_string())],
        }
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let captured = Arc::new(CapturedOutput::default());
        let code = ShellRunner::default()
            .run(
                invocation(dir.path(), "echo \"arg $1\"\necho \"$OUTPOST_TEST_VAR\"\necho oops >&2\nexit 3\n"),
                captured.clone(),
                CancellationToken::new(),
            )
            .await
            .expect("run");

        assert_eq!(code, 3);
        assert_eq!(
            captured.texts(ProcessOutputSource::StdOut),
            ["arg first", "from-env"]
        );
        assert_eq!(captured.texts(ProcessOutputSource::StdErr), ["oops"]);
        assert!(
            captured
                .texts(ProcessOutputSource::Debug)
                .iter()
                .any(|line| line == "Process exited with code 3")
        );
    }

    #[derive(Default)]
    struct ThreadRecordingOutput {
        threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl OutputSink for ThreadRecordingOutput {
        fn emit(&self, source: ProcessOutputSource, _text: &str) {
            if source != ProcessOutputSource::Debug {
                self.threads
                    .lock()
                    .expect("threads")
                    .push(std::thread::current().id());
            }
        }
    }

    #[tokio::test]
    async fn script_output_is_written_off_the_runtime_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorded = Arc::new(ThreadRecordingOutput::default());
        ShellRunner::default()
            .run(
                invocation(dir.path(), "echo one\necho two >&2\n"),
                recorded.clone(),
                CancellationToken::new(),
            )
            .await
            .expect("run");

        let runtime_thread = std::thread::current().id();
        let threads = recorded.threads.lock().expect("threads");
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn long_lines_are_split() {
        let dir = tempfile::tempdir().expect("tempdir");
        let captured = Arc::new(CapturedOutput::default());
        let total = MAX_OUTPUT_LINE_BYTES * 3 + 10;
        let code = ShellRunner::default()
            .run(
                invocation(
                    dir.path(),
                    &format!("head -c {total} /dev/zero | tr '\\0' x\necho\necho after\n"),
                ),
                captured.clone(),
                CancellationToken::new(),
            )
            .await
            .expect("run");

        assert_eq!(code, 0);
        let lines = captured.texts(ProcessOutputSource::StdOut);
        assert_eq!(lines.len(), 5, "{:?}", lines.iter().map(String::len).collect::<Vec<_>>());
        assert!(lines.iter().all(|line| line.len() <= MAX_OUTPUT_LINE_BYTES));
        assert_eq!(lines[..4].iter().map(String::len).sum::<usize>(), total);
        assert_eq!(lines[4], "after");
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        let runner = ShellRunner::default();
        let run = runner.run(
            invocation(dir.path(), "echo started\nsleep 60\necho never\n"),
            Arc::new(CapturedOutput::default()),
            cancel.clone(),
        );

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(run, canceller)
        })
        .await
        .expect("cancel should not wait for the script");
        assert!(matches!(result, Err(ProcessError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = ShellRunner::new("/nonexistent/shell")
            .run(
                invocation(dir.path(), "true\n"),
                Arc::new(CapturedOutput::default()),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
