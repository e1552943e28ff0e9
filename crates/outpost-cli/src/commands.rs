use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use outpost_client::{
    ClientError, ClientOptions, ExecuteScriptCommand, ScriptClient, ScriptStatus,
    UnixSocketTransport,
};
use outpost_protocol::{ProcessOutput, ProcessOutputSource, ProcessState, ScriptIsolationLevel, ScriptTicket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit status used when the run was interrupted with Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

pub struct RunArgs {
    pub script: PathBuf,
    pub isolation: ScriptIsolationLevel,
    pub mutex_name: Option<String>,
    pub mutex_timeout: Option<Duration>,
    pub task_id: String,
    pub args: Vec<String>,
    pub retry_duration: Duration,
}

/// Run a script and exit with its exit code.
pub async fn run(socket: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;

    let options = ClientOptions {
        retries_enabled: !args.retry_duration.is_zero(),
        retry_duration: args.retry_duration,
        ..ClientOptions::default()
    };
    let client = ScriptClient::new(UnixSocketTransport::new(socket), options);

    let mut command = ExecuteScriptCommand::new(args.task_id, body);
    command.arguments = args.args;
    command.isolation = args.isolation;
    command.isolation_mutex_name = args.mutex_name;
    command.isolation_mutex_timeout = args.mutex_timeout;
    debug!(ticket = %command.ticket, "starting script");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted, cancelling script");
                cancel.cancel();
            }
        }
    });

    let result = client
        .execute_script(command, |status: &ScriptStatus| print_logs(&status.logs), &cancel)
        .await;

    match result {
        Ok(result) => std::process::exit(result.exit_code),
        Err(ClientError::Cancelled { .. }) => std::process::exit(INTERRUPTED_EXIT_CODE),
        Err(err) => Err(err.into()),
    }
}

/// Print one status read for a ticket.
pub async fn status(socket: PathBuf, ticket: &str, after: u64) -> anyhow::Result<()> {
    let client = one_shot_client(socket);
    let result = client
        .get_status(ScriptTicket::from_string(ticket), after, &CancellationToken::new())
        .await?;

    print_logs(&result.status.logs);
    println!(
        "state={} exit_code={} next_log_sequence={}",
        state_label(result.status.state),
        result.status.exit_code,
        result.context.next_log_sequence
    );
    Ok(())
}

/// Ask the agent to cancel a script.
pub async fn cancel(socket: PathBuf, ticket: &str) -> anyhow::Result<()> {
    let client = one_shot_client(socket);
    let result = client
        .cancel_script(ScriptTicket::from_string(ticket), 0)
        .await?;
    println!(
        "state={} exit_code={}",
        state_label(result.status.state),
        result.status.exit_code
    );
    Ok(())
}

/// Print the script services the agent advertises.
pub async fn capabilities(socket: PathBuf) -> anyhow::Result<()> {
    let client = one_shot_client(socket);
    let cancel = CancellationToken::new();
    let capabilities = client.capabilities(&cancel).await?;
    for service in &capabilities.supported_services {
        println!("{service}");
    }
    Ok(())
}

fn one_shot_client(socket: PathBuf) -> ScriptClient<UnixSocketTransport> {
    let options = ClientOptions {
        retries_enabled: false,
        ..ClientOptions::default()
    };
    ScriptClient::new(UnixSocketTransport::new(socket), options)
}

fn print_logs(logs: &[ProcessOutput]) {
    for line in logs {
        match line.source {
            ProcessOutputSource::StdOut => println!("{}", line.text),
            ProcessOutputSource::StdErr => eprintln!("{}", line.text),
            ProcessOutputSource::Debug => debug!(text = %line.text, "agent"),
        }
    }
}

fn state_label(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Pending => "pending",
        ProcessState::Running => "running",
        ProcessState::Complete => "complete",
    }
}
