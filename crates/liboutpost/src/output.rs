use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use outpost_protocol::{ProcessOutput, ProcessOutputSource};
use tracing::warn;

use crate::error::AgentResult;
use crate::masking::SensitiveValueMasker;
use crate::now_ms;

/// Destination for lines produced while a script runs.
pub trait OutputSink: Send + Sync {
    fn emit(&self, source: ProcessOutputSource, text: &str);
}

/// Append-only, sequenced script output stored as JSON lines.
///
/// Sequence numbers are implicit: the n-th complete record in the file is
/// sequence n. Readers re-scan from the start so a restarted agent can serve
/// output for a script it did not launch.
#[derive(Debug, Clone)]
pub struct ScriptLog {
    path: PathBuf,
    masker: Arc<SensitiveValueMasker>,
}

/// Serializes appends to one log file.
#[derive(Debug)]
pub struct ScriptLogWriter {
    file: Mutex<File>,
    masker: Arc<SensitiveValueMasker>,
}

impl ScriptLog {
    pub fn new(path: impl Into<PathBuf>, masker: Arc<SensitiveValueMasker>) -> Self {
        Self {
            path: path.into(),
            masker,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> AgentResult<ScriptLogWriter> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(ScriptLogWriter {
            file: Mutex::new(file),
            masker: Arc::clone(&self.masker),
        })
    }

    /// Returns every record with a sequence greater than `after`, and the
    /// highest sequence seen (`after` when nothing new has been written).
    pub fn get_output(&self, after: u64) -> AgentResult<(Vec<ProcessOutput>, u64)> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), after)),
            Err(err) => return Err(err.into()),
        };

        // A record without its trailing newline is still being written.
        let complete = match content.iter().rposition(|b| *b == b'\n') {
            Some(end) => &content[..=end],
            None => &[][..],
        };

        let mut lines = Vec::new();
        let mut seq = 0u64;
        for (index, raw) in complete.split(|b| *b == b'\n').enumerate() {
            if raw.is_empty() {
                continue;
            }
            match serde_json::from_slice::<ProcessOutput>(raw) {
                Ok(entry) => {
                    seq += 1;
                    if seq > after {
                        lines.push(entry);
                    }
                }
                Err(err) => {
                    warn!(path = %self.path.display(), line = index + 1, "corrupt script log record: {err}");
                    lines.push(ProcessOutput {
                        source: ProcessOutputSource::StdErr,
                        text: format!(
                            "Corrupt log at line {}, no more logs will be read",
                            index + 1
                        ),
                        occurred_at_ms: now_ms(),
                    });
                    break;
                }
            }
        }

        Ok((lines, after.max(seq)))
    }
}

impl ScriptLogWriter {
    pub fn write_output(&self, source: ProcessOutputSource, text: &str) -> AgentResult<()> {
        let entry = ProcessOutput {
            source,
            text: self.masker.mask(text).into_owned(),
            occurred_at_ms: now_ms(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl OutputSink for ScriptLogWriter {
    fn emit(&self, source: ProcessOutputSource, text: &str) {
        if let Err(err) = self.write_output(source, text) {
            warn!("failed to append script output: {err}");
        }
    }
}
