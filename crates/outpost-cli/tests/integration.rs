use anyhow::{Context, Result, bail};
use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use outpost_protocol::{
    ProcessOutput, ProcessOutputSource, ProcessState, Request, Response, ScriptServiceVersion,
    ScriptStatusResponse, ScriptTicket, StartScriptCommand,
};
use predicates::prelude::*;
use serde_json::json;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Binds before returning so the CLI never races the listener, then
/// serves `connections` one-request connections.
fn spawn_mock_agent<F>(
    socket_path: &Path,
    connections: usize,
    mut handler: F,
) -> Result<thread::JoinHandle<Result<Vec<Request>>>>
where
    F: FnMut(&Request) -> Result<Response> + Send + 'static,
{
    let listener = UnixListener::bind(socket_path).context("failed to bind mock socket")?;
    Ok(thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..connections {
            let (stream, _) = listener.accept().context("failed to accept client")?;
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .context("failed to set read timeout")?;
            let mut reader = BufReader::new(stream.try_clone().context("failed to clone stream")?);
            let mut writer = BufWriter::new(stream);

            write_response(&mut writer, &Response::hello())?;
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                bail!("client disconnected before request");
            }
            let request: Request = serde_json::from_str(line.trim_end())?;
            write_response(&mut writer, &handler(&request)?)?;
            seen.push(request);
        }
        Ok(seen)
    }))
}

fn write_response(
    writer: &mut BufWriter<std::os::unix::net::UnixStream>,
    response: &Response,
) -> Result<()> {
    writeln!(writer, "{}", serde_json::to_string(response)?)?;
    writer.flush()?;
    Ok(())
}

fn capabilities(services: &[ScriptServiceVersion]) -> Response {
    let names: Vec<_> = services.iter().map(|s| s.service_name()).collect();
    Response::ok(Some(json!({ "supported_services": names })))
}

fn line(source: ProcessOutputSource, text: &str) -> ProcessOutput {
    ProcessOutput {
        source,
        text: text.to_string(),
        occurred_at_ms: 0,
    }
}

fn status(ticket: ScriptTicket, state: ProcessState, exit_code: i32, logs: Vec<ProcessOutput>) -> Result<Response> {
    let next_log_sequence = logs.len() as u64;
    let status = ScriptStatusResponse {
        ticket,
        state,
        exit_code,
        logs,
        next_log_sequence,
    };
    Ok(Response::ok(Some(serde_json::to_value(status)?)))
}

fn cli_bin() -> Command {
    cargo_bin_cmd!("outpost")
}

fn socket_for(temp: &Path) -> PathBuf {
    temp.join("outpost.sock")
}

#[test]
fn help_lists_subcommands() {
    cli_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("capabilities"));
}

#[test]
fn missing_agent_fails_fast() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;

    cli_bin()
        .arg("--socket")
        .arg(socket_for(temp.path()))
        .arg("capabilities")
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to connect"));
    Ok(())
}

#[test]
fn capabilities_prints_each_service() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket_path = socket_for(temp.path());
    let agent = spawn_mock_agent(&socket_path, 1, |request| match request {
        Request::GetCapabilities => Ok(capabilities(&[
            ScriptServiceVersion::V1,
            ScriptServiceVersion::V2,
        ])),
        other => bail!("expected GetCapabilities, got {other:?}"),
    })?;

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .arg("capabilities")
        .output()
        .context("failed to run outpost capabilities")?;

    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let services: Vec<_> = stdout.lines().collect();
    assert_eq!(services, ["script_service", "script_service_v2"]);

    agent.join().expect("mock agent thread panicked")?;
    Ok(())
}

#[test]
fn status_prints_output_and_state() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket_path = socket_for(temp.path());
    let agent = spawn_mock_agent(&socket_path, 2, |request| match request {
        Request::GetCapabilities => Ok(capabilities(&[ScriptServiceVersion::V2])),
        Request::GetStatus {
            ticket,
            last_log_sequence,
            ..
        } => {
            assert_eq!(*last_log_sequence, 4);
            status(
                ticket.clone(),
                ProcessState::Running,
                0,
                vec![line(ProcessOutputSource::StdOut, "building")],
            )
        }
        other => bail!("unexpected request {other:?}"),
    })?;

    cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["status", "abc-123", "--after", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("building"))
        .stdout(predicate::str::contains("state=running exit_code=0"));

    let requests = agent.join().expect("mock agent thread panicked")?;
    assert!(matches!(
        &requests[1],
        Request::GetStatus { ticket, service: ScriptServiceVersion::V2, .. } if ticket.as_str() == "abc-123"
    ));
    Ok(())
}

#[test]
fn run_streams_output_and_exits_with_script_code() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket_path = socket_for(temp.path());
    let script = temp.path().join("deploy.sh");
    std::fs::write(&script, "echo deploying\n")?;

    let agent = spawn_mock_agent(&socket_path, 3, |request| match request {
        Request::GetCapabilities => Ok(capabilities(&[ScriptServiceVersion::V2])),
        Request::StartScript {
            command: StartScriptCommand::V2(command),
        } => {
            assert_eq!(command.script_body, "echo deploying\n");
            assert_eq!(command.arguments, ["--env", "prod"]);
            assert_eq!(command.task_id, "Task-9");
            status(
                command.ticket.clone(),
                ProcessState::Complete,
                7,
                vec![
                    line(ProcessOutputSource::StdOut, "deploying"),
                    line(ProcessOutputSource::StdErr, "warning: slow"),
                ],
            )
        }
        Request::CompleteScript { .. } => Ok(Response::ok(None)),
        other => bail!("unexpected request {other:?}"),
    })?;

    cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .arg("run")
        .arg(&script)
        .args(["--task-id", "Task-9", "--", "--env", "prod"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("deploying"))
        .stderr(predicate::str::contains("warning: slow"));

    let requests = agent.join().expect("mock agent thread panicked")?;
    let methods: Vec<_> = requests.iter().map(|r| r.rpc_name().1).collect();
    assert_eq!(methods, ["get_capabilities", "start_script", "complete_script"]);
    Ok(())
}
