use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use outpost_protocol::{
    CapabilitiesResponse, ErrorCode, MAX_JSON_LINE_BYTES, NO_MUTEX_TIMEOUT_MS, ProcessOutputSource,
    ProcessState, Request, Response, ScriptFile, ScriptIsolationLevel, ScriptServiceVersion,
    ScriptStatusResponse, ScriptTicket, StartScriptCommand, StartScriptCommandV2, exit_codes,
};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

struct TestAgent {
    runtime: TempDir,
    socket_path: PathBuf,
    child: Child,
}

impl TestAgent {
    async fn spawn() -> Result<Self> {
        let runtime = tempfile::tempdir().context("failed to create temp runtime dir")?;
        let socket_path = runtime.path().join("outpost.sock");

        let child = Command::new(assert_cmd::cargo::cargo_bin!("outpost-agent"))
            .arg("--socket")
            .arg(&socket_path)
            .arg("--work-dir")
            .arg(runtime.path().join("work"))
            .env("XDG_RUNTIME_DIR", runtime.path())
            .env("XDG_CONFIG_HOME", runtime.path().join("config"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn outpost-agent")?;

        let start = Instant::now();
        loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    drop(stream);
                    break;
                }
                Err(_) if start.elapsed() <= Duration::from_secs(5) => {
                    sleep(Duration::from_millis(20)).await;
                }
                Err(err) => bail!(
                    "timed out waiting for agent at {}: {err}",
                    socket_path.display()
                ),
            }
        }

        Ok(Self {
            runtime,
            socket_path,
            child,
        })
    }

    fn work_dir(&self) -> PathBuf {
        self.runtime.path().join("work")
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct ProtocolClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl ProtocolClient {
    async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect {}", socket_path.display()))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            writer: FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
        };

        match client.next_response().await? {
            Response::Hello { .. } => Ok(client),
            other => bail!("expected hello, got {other:?}"),
        }
    }

    async fn next_response(&mut self) -> Result<Response> {
        let line = timeout(Duration::from_secs(10), self.reader.next())
            .await
            .context("timed out waiting for response")?
            .context("connection closed")??;
        Ok(serde_json::from_str(&line)?)
    }

    async fn send_line(&mut self, line: String) -> Result<Response> {
        self.writer.send(line).await?;
        self.next_response().await
    }

    async fn request(&mut self, req: Request) -> Result<Response> {
        self.send_line(serde_json::to_string(&req)?).await
    }

    async fn request_ok<T: serde::de::DeserializeOwned>(&mut self, req: Request) -> Result<T> {
        match self.request(req).await? {
            Response::Ok { data: Some(data) } => Ok(serde_json::from_value(data)?),
            other => bail!("expected ok with data, got {other:?}"),
        }
    }

    async fn status(&mut self, ticket: &ScriptTicket, after: u64) -> Result<ScriptStatusResponse> {
        self.request_ok(Request::GetStatus {
            service: ScriptServiceVersion::V2,
            ticket: ticket.clone(),
            last_log_sequence: after,
        })
        .await
    }
}

fn start_command(ticket: &ScriptTicket, body: &str) -> Request {
    Request::StartScript {
        command: StartScriptCommand::V2(StartScriptCommandV2 {
            ticket: ticket.clone(),
            script_body: body.to_string(),
            isolation: ScriptIsolationLevel::FullIsolation,
            isolation_mutex_timeout_ms: NO_MUTEX_TIMEOUT_MS,
            isolation_mutex_name: None,
            arguments: vec!["from-args".to_string()],
            task_id: "ServerTasks-100".to_string(),
            duration_to_wait_ms: None,
            files: vec![ScriptFile {
                name: "data.txt".to_string(),
                contents: b"from-file".to_vec(),
            }],
        }),
    }
}

#[tokio::test]
async fn capabilities_and_invalid_requests() -> Result<()> {
    let agent = TestAgent::spawn().await?;
    let mut client = ProtocolClient::connect(&agent.socket_path).await?;

    let caps: CapabilitiesResponse = client.request_ok(Request::GetCapabilities).await?;
    assert!(caps.supports(ScriptServiceVersion::V1));
    assert!(caps.supports(ScriptServiceVersion::V2));
    assert!(caps.supports(ScriptServiceVersion::V3Alpha));
    assert!(!caps.supports(ScriptServiceVersion::KubernetesV1));

    match client.send_line("{\"cmd\":\"nonsense\"}".to_string()).await? {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => bail!("expected error, got {other:?}"),
    }

    let status = client.status(&ScriptTicket::from_string("never-seen"), 0).await?;
    assert_eq!(status.state, ProcessState::Complete);
    assert_eq!(status.exit_code, exit_codes::UNKNOWN_SCRIPT);
    Ok(())
}

#[tokio::test]
async fn script_runs_to_completion_and_is_cleaned_up() -> Result<()> {
    let agent = TestAgent::spawn().await?;
    let mut client = ProtocolClient::connect(&agent.socket_path).await?;
    let ticket = ScriptTicket::new();

    let _: ScriptStatusResponse = client
        .request_ok(start_command(
            &ticket,
            "echo \"hello $1\"\ncat data.txt; echo\necho problem >&2\nexit 4\n",
        ))
        .await?;

    let mut after = 0;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let start = Instant::now();
    let final_status = loop {
        let status = client.status(&ticket, after).await?;
        assert!(status.next_log_sequence >= after);
        after = status.next_log_sequence;
        for line in &status.logs {
            match line.source {
                ProcessOutputSource::StdOut => stdout.push(line.text.clone()),
                ProcessOutputSource::StdErr => stderr.push(line.text.clone()),
                ProcessOutputSource::Debug => {}
            }
        }
        if status.state == ProcessState::Complete {
            break status;
        }
        if start.elapsed() > Duration::from_secs(10) {
            bail!("script did not finish");
        }
        sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(final_status.exit_code, 4);
    assert!(stdout.contains(&"hello from-args".to_string()), "{stdout:?}");
    assert!(stdout.contains(&"from-file".to_string()), "{stdout:?}");
    assert_eq!(stderr, ["problem"]);

    let complete = client
        .request(Request::CompleteScript {
            service: ScriptServiceVersion::V2,
            ticket: ticket.clone(),
            last_log_sequence: after,
        })
        .await?;
    assert!(matches!(complete, Response::Ok { data: None }));
    assert!(!agent.work_dir().join(ticket.as_str()).exists());

    let forgotten = client.status(&ticket, 0).await?;
    assert_eq!(forgotten.exit_code, exit_codes::UNKNOWN_SCRIPT);
    Ok(())
}

#[tokio::test]
async fn cancel_stops_a_running_script() -> Result<()> {
    let agent = TestAgent::spawn().await?;
    let mut client = ProtocolClient::connect(&agent.socket_path).await?;
    let ticket = ScriptTicket::new();

    let _: ScriptStatusResponse = client
        .request_ok(start_command(&ticket, "echo started\nsleep 60\n"))
        .await?;

    let start = Instant::now();
    loop {
        let status = client.status(&ticket, 0).await?;
        if status.logs.iter().any(|line| line.text == "started") {
            break;
        }
        if start.elapsed() > Duration::from_secs(10) {
            bail!("script never started");
        }
        sleep(Duration::from_millis(20)).await;
    }

    let _: ScriptStatusResponse = client
        .request_ok(Request::CancelScript {
            service: ScriptServiceVersion::V2,
            ticket: ticket.clone(),
            last_log_sequence: 0,
        })
        .await?;

    let start = Instant::now();
    let status = loop {
        let status = client.status(&ticket, 0).await?;
        if status.state == ProcessState::Complete {
            break status;
        }
        if start.elapsed() > Duration::from_secs(10) {
            bail!("cancelled script kept running");
        }
        sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(status.exit_code, exit_codes::CANCELED);
    assert!(
        status
            .logs
            .iter()
            .any(|line| line.text == "Script execution canceled.")
    );
    Ok(())
}

#[tokio::test]
async fn retried_start_does_not_run_twice() -> Result<()> {
    let agent = TestAgent::spawn().await?;
    let mut first = ProtocolClient::connect(&agent.socket_path).await?;
    let mut second = ProtocolClient::connect(&agent.socket_path).await?;
    let ticket = ScriptTicket::new();
    let body = "echo run >> runs.txt\n";

    let _: ScriptStatusResponse = first.request_ok(start_command(&ticket, body)).await?;
    let _: ScriptStatusResponse = second.request_ok(start_command(&ticket, body)).await?;

    let start = Instant::now();
    while first.status(&ticket, 0).await?.state != ProcessState::Complete {
        if start.elapsed() > Duration::from_secs(10) {
            bail!("script did not finish");
        }
        sleep(Duration::from_millis(20)).await;
    }

    let runs = std::fs::read_to_string(agent.work_dir().join(ticket.as_str()).join("runs.txt"))?;
    assert_eq!(runs.lines().count(), 1);
    Ok(())
}
