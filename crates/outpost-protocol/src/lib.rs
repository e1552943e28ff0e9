pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the JSON-lines envelope announced in the connection hello.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single request or response line.
pub const MAX_JSON_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Isolation mutex timeout used when a caller has no way to express one.
pub const NO_MUTEX_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Lock name used when a start command does not name its isolation mutex.
pub const DEFAULT_ISOLATION_MUTEX_NAME: &str = "RunningScript";

/// Exit codes the agent reports when a script did not produce its own.
pub mod exit_codes {
    /// The execution itself failed, e.g. the output log could not be written.
    pub const FATAL: i32 = -41;
    /// The script process could not be spawned.
    pub const INVOCATION_ERROR: i32 = -42;
    pub const CANCELED: i32 = -43;
    /// The isolation mutex could not be acquired before its timeout.
    pub const TIMEOUT: i32 = -44;
    /// Status was requested for a ticket the agent has no record of.
    pub const UNKNOWN_SCRIPT: i32 = -45;
    /// Persisted state shows the script started but never reported completion.
    pub const UNKNOWN_RESULT: i32 = -46;
}

/// Opaque correlation id for one script execution.
///
/// Tickets name a directory on the agent, so only `[A-Za-z0-9_-]` is accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ScriptTicket(String);

impl ScriptTicket {
    pub const MAX_LEN: usize = 128;

    /// Generates a fresh random ticket.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= Self::MAX_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for ScriptTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScriptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a script execution. Only ever moves forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Running,
    Complete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutputSource {
    #[serde(rename = "stdout")]
    StdOut,
    #[serde(rename = "stderr")]
    StdErr,
    Debug,
}

/// One line of script output as recorded in the agent's log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub source: ProcessOutputSource,
    pub text: String,
    pub occurred_at_ms: u64,
}

/// Whether a script may run alongside others sharing its mutex name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptIsolationLevel {
    NoIsolation,
    FullIsolation,
}

/// A file materialized next to the bootstrap script before it runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

/// Generations of the script service. Each shares one state machine on the
/// agent and differs only in wire shape.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptServiceVersion {
    V1,
    V2,
    V3Alpha,
    KubernetesV1,
}

impl ScriptServiceVersion {
    pub const ALL: [ScriptServiceVersion; 4] = [
        ScriptServiceVersion::V1,
        ScriptServiceVersion::V2,
        ScriptServiceVersion::V3Alpha,
        ScriptServiceVersion::KubernetesV1,
    ];

    /// Name advertised in the capabilities response.
    pub fn service_name(self) -> &'static str {
        match self {
            ScriptServiceVersion::V1 => "script_service",
            ScriptServiceVersion::V2 => "script_service_v2",
            ScriptServiceVersion::V3Alpha => "script_service_v3alpha",
            ScriptServiceVersion::KubernetesV1 => "kubernetes_script_service_v1",
        }
    }

    pub fn from_service_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.service_name() == name)
    }

    /// V1 predates client-supplied tickets and returns final output from
    /// CompleteScript instead of from the last status poll.
    pub fn is_legacy(self) -> bool {
        self == ScriptServiceVersion::V1
    }
}

impl fmt::Display for ScriptServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Start command for the first script service generation. The agent picks
/// the ticket and waits on the isolation mutex without a timeout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartScriptCommandV1 {
    pub script_body: String,
    pub isolation: ScriptIsolationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_mutex_name: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub task_id: String,
    #[serde(default)]
    pub files: Vec<ScriptFile>,
}

/// Start command shared by V2, V3-alpha and the Kubernetes variant.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartScriptCommandV2 {
    pub ticket: ScriptTicket,
    pub script_body: String,
    pub isolation: ScriptIsolationLevel,
    #[serde(default = "default_mutex_timeout_ms")]
    pub isolation_mutex_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_mutex_name: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub task_id: String,
    /// How long StartScript may block waiting for a quick script to finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_to_wait_ms: Option<u64>,
    #[serde(default)]
    pub files: Vec<ScriptFile>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum StartScriptCommand {
    V1(StartScriptCommandV1),
    V2(StartScriptCommandV2),
    V3Alpha(StartScriptCommandV2),
    KubernetesV1(StartScriptCommandV2),
}

impl StartScriptCommand {
    pub fn service(&self) -> ScriptServiceVersion {
        match self {
            StartScriptCommand::V1(_) => ScriptServiceVersion::V1,
            StartScriptCommand::V2(_) => ScriptServiceVersion::V2,
            StartScriptCommand::V3Alpha(_) => ScriptServiceVersion::V3Alpha,
            StartScriptCommand::KubernetesV1(_) => ScriptServiceVersion::KubernetesV1,
        }
    }
}

/// Status of a ticket plus any output after the requested sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatusResponse {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    #[serde(default)]
    pub logs: Vec<ProcessOutput>,
    pub next_log_sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScriptResponseV1 {
    pub ticket: ScriptTicket,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    pub supported_services: Vec<String>,
}

impl CapabilitiesResponse {
    pub fn supports(&self, version: ScriptServiceVersion) -> bool {
        self.supported_services
            .iter()
            .any(|name| name == version.service_name())
    }
}

/// Client-to-agent requests sent as JSON-lines over the socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    GetCapabilities,
    StartScript {
        command: StartScriptCommand,
    },
    GetStatus {
        service: ScriptServiceVersion,
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CancelScript {
        service: ScriptServiceVersion,
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CompleteScript {
        service: ScriptServiceVersion,
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
}

impl Request {
    /// `(service, method)` pair used for logging and call metrics.
    pub fn rpc_name(&self) -> (&'static str, &'static str) {
        match self {
            Request::GetCapabilities => ("capabilities_service", "get_capabilities"),
            Request::StartScript { command } => (command.service().service_name(), "start_script"),
            Request::GetStatus { service, .. } => (service.service_name(), "get_status"),
            Request::CancelScript { service, .. } => (service.service_name(), "cancel_script"),
            Request::CompleteScript { service, .. } => (service.service_name(), "complete_script"),
        }
    }
}

/// Agent-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        protocol_version: u32,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl Response {
    pub fn hello() -> Self {
        Response::Hello {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            code,
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidTicket,
    UnsupportedService,
    WorkspaceError,
    ServerError,
}

fn default_mutex_timeout_ms() -> u64 {
    NO_MUTEX_TIMEOUT_MS
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
