mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use outpost_protocol::ScriptIsolationLevel;

#[derive(Parser)]
#[command(name = "outpost", about = "Run and inspect scripts on an outpost agent")]
struct Cli {
    /// Agent socket path
    #[arg(long, global = true, default_value_os_t = outpost_protocol::paths::default_socket_path())]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script to completion, streaming its output
    Run {
        /// Path to the script body
        script: PathBuf,

        /// Isolation level
        #[arg(long, value_enum, default_value = "none")]
        isolation: Isolation,

        /// Isolation mutex name
        #[arg(long)]
        mutex_name: Option<String>,

        /// Seconds to wait for the isolation mutex (waits forever if unset)
        #[arg(long)]
        mutex_timeout_secs: Option<u64>,

        /// Task identifier reported to the agent
        #[arg(long, default_value = "outpost-cli")]
        task_id: String,

        /// Seconds to keep retrying failed calls (0 disables retries)
        #[arg(long, default_value = "150")]
        retry_secs: u64,

        /// Arguments passed to the script
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Read the status and output of a script
    Status {
        /// Script ticket
        ticket: String,

        /// Only show output after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,
    },

    /// Cancel a running script
    Cancel {
        /// Script ticket
        ticket: String,
    },

    /// List the script services the agent supports
    Capabilities,
}

#[derive(Clone, Copy, ValueEnum)]
enum Isolation {
    Full,
    None,
}

impl From<Isolation> for ScriptIsolationLevel {
    fn from(value: Isolation) -> Self {
        match value {
            Isolation::Full => ScriptIsolationLevel::FullIsolation,
            Isolation::None => ScriptIsolationLevel::NoIsolation,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            isolation,
            mutex_name,
            mutex_timeout_secs,
            task_id,
            retry_secs,
            args,
        } => {
            commands::run(
                cli.socket,
                commands::RunArgs {
                    script,
                    isolation: isolation.into(),
                    mutex_name,
                    mutex_timeout: mutex_timeout_secs.map(std::time::Duration::from_secs),
                    task_id,
                    args,
                    retry_duration: std::time::Duration::from_secs(retry_secs),
                },
            )
            .await
        }
        Commands::Status { ticket, after } => commands::status(cli.socket, &ticket, after).await,
        Commands::Cancel { ticket } => commands::cancel(cli.socket, &ticket).await,
        Commands::Capabilities => commands::capabilities(cli.socket).await,
    }
}
