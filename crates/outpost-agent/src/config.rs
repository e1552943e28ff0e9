use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use serde::Deserialize;

const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
const DEFAULT_WORKSPACE_MAX_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CLEANER_INTERVAL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub pid_file: PathBuf,
    pub work_dir: PathBuf,
    pub allowed_uid: u32,
    pub outbound_queue: usize,
    pub kubernetes: bool,
    pub sensitive_values: Vec<String>,
    pub workspace_max_age: Duration,
    pub cleaner_interval: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    outbound_queue: Option<usize>,
    kubernetes: Option<bool>,
    sensitive_values: Option<Vec<String>>,
    workspace_max_age_secs: Option<u64>,
    cleaner_interval_secs: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Args {
    pub socket_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub help: bool,
}

impl Args {
    pub fn parse() -> Result<Self> {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--socket" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--socket requires a value"))?;
                    parsed.socket_path = Some(PathBuf::from(value));
                }
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--config requires a value"))?;
                    parsed.config_path = Some(PathBuf::from(value));
                }
                "--work-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--work-dir requires a value"))?;
                    parsed.work_dir = Some(PathBuf::from(value));
                }
                "--help" | "-h" => parsed.help = true,
                other => {
                    return Err(anyhow!("unknown argument: {other}"));
                }
            }
        }
        Ok(parsed)
    }
}

pub fn print_help() {
    println!("outpost-agent [--socket PATH] [--config PATH] [--work-dir PATH]");
}

/// Merges flags over the config file over built-in defaults. An explicit
/// `--config` must exist; the default config path is optional.
pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config_path {
        Some(path) => read_file_config(path)?,
        None => {
            let path = outpost_protocol::paths::config_path();
            if path.exists() {
                read_file_config(&path)?
            } else {
                FileConfig::default()
            }
        }
    };
    Ok(resolve(args, file_cfg))
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn resolve(args: &Args, file_cfg: FileConfig) -> RuntimeConfig {
    let runtime_dir = file_cfg
        .runtime_dir
        .unwrap_or_else(outpost_protocol::paths::default_runtime_dir);
    let socket_path = args
        .socket_path
        .clone()
        .or(file_cfg.socket_path)
        .unwrap_or_else(|| runtime_dir.join("outpost.sock"));
    let pid_file = file_cfg
        .pid_file
        .unwrap_or_else(|| runtime_dir.join("outpost-agent.pid"));
    let work_dir = args
        .work_dir
        .clone()
        .or(file_cfg.work_dir)
        .unwrap_or_else(|| runtime_dir.join("work"));

    RuntimeConfig {
        socket_path,
        pid_file,
        work_dir,
        runtime_dir,
        allowed_uid: Uid::effective().as_raw(),
        outbound_queue: file_cfg.outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE),
        kubernetes: file_cfg.kubernetes.unwrap_or(false),
        sensitive_values: file_cfg.sensitive_values.unwrap_or_default(),
        workspace_max_age: Duration::from_secs(
            file_cfg
                .workspace_max_age_secs
                .unwrap_or(DEFAULT_WORKSPACE_MAX_AGE_SECS),
        ),
        cleaner_interval: Duration::from_secs(
            file_cfg
                .cleaner_interval_secs
                .unwrap_or(DEFAULT_CLEANER_INTERVAL_SECS)
                .max(1),
        ),
    }
}
