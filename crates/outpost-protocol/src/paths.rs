use std::path::PathBuf;

/// Returns the runtime directory used for the agent socket, pid file and
/// script workspaces.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("outpost")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/outpost-{uid}"))
    }
}

/// Returns the default socket path for the outpost agent.
pub fn default_socket_path() -> PathBuf {
    default_runtime_dir().join("outpost.sock")
}

/// Returns the config directory path for outpost.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("outpost")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("outpost")
    } else {
        PathBuf::from("/tmp/outpost")
    }
}

/// Returns the config file path for the outpost agent.
pub fn config_path() -> PathBuf {
    dirs_path().join("agent.toml")
}
