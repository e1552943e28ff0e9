use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use outpost_protocol::ProcessOutputSource;
use tokio_util::sync::CancellationToken;

use crate::output::OutputSink;
use crate::process::{ProcessError, ProcessInvocation, ProcessRunner};

/// Collects emitted lines in memory.
#[derive(Default)]
pub(crate) struct CapturedOutput {
    pub lines: Mutex<Vec<(ProcessOutputSource, String)>>,
}

impl CapturedOutput {
    pub fn texts(&self, source: ProcessOutputSource) -> Vec<String> {
        self.lines
            .lock()
            .expect("lines")
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl OutputSink for CapturedOutput {
    fn emit(&self, source: ProcessOutputSource, text: &str) {
        self.lines
            .lock()
            .expect("lines")
            .push((source, text.to_string()));
    }
}

/// Runner that never spawns anything: it echoes its arguments, then either
/// exits with `exit_code` or waits for cancellation.
#[derive(Default)]
pub(crate) struct FakeRunner {
    pub spawned: AtomicUsize,
    pub exit_code: i32,
    pub wait_for_cancel: bool,
    pub fail_to_spawn: bool,
}

impl FakeRunner {
    pub fn exiting_with(exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            ..Self::default()
        })
    }

    pub fn until_cancelled() -> Arc<Self> {
        Arc::new(Self {
            wait_for_cancel: true,
            ..Self::default()
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail_to_spawn: true,
            ..Self::default()
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl ProcessRunner for FakeRunner {
    async fn run(
        &self,
        invocation: ProcessInvocation,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<i32, ProcessError> {
        if self.fail_to_spawn {
            return Err(ProcessError::Spawn {
                program: self.program(),
                source: std::io::Error::other("no such shell"),
            });
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        output.emit(ProcessOutputSource::StdOut, "fake script started");
        for arg in &invocation.args {
            output.emit(ProcessOutputSource::StdOut, arg);
        }
        if self.wait_for_cancel {
            cancel.cancelled().await;
            return Err(ProcessError::Cancelled);
        }
        Ok(self.exit_code)
    }

    fn program(&self) -> String {
        "fake-shell".to_string()
    }
}
