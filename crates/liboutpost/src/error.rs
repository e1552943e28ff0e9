use outpost_protocol::{ErrorCode, ScriptServiceVersion};
use thiserror::Error;

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid script ticket: {0:?}")]
    InvalidTicket(String),

    #[error("script service {0} is not supported by this agent")]
    UnsupportedService(ScriptServiceVersion),

    #[error("invalid script file name: {0:?}")]
    InvalidFileName(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build sensitive value matcher: {0}")]
    Masking(#[from] aho_corasick::BuildError),
}

impl AgentError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AgentError::InvalidTicket(_) => (ErrorCode::InvalidTicket, self.to_string()),
            AgentError::UnsupportedService(_) => (ErrorCode::UnsupportedService, self.to_string()),
            AgentError::InvalidFileName(_) => (ErrorCode::InvalidRequest, self.to_string()),
            AgentError::Workspace(_) => (ErrorCode::WorkspaceError, self.to_string()),
            AgentError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
            AgentError::Json(_) => (ErrorCode::ServerError, "internal encoding error".to_string()),
            AgentError::Masking(_) => (ErrorCode::ServerError, "internal masking error".to_string()),
        }
    }
}
