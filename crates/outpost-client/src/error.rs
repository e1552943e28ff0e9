use outpost_protocol::{ErrorCode, ScriptServiceVersion, ScriptTicket};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Failure of the channel itself, classified by how far the request got.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request never left this process; the agent cannot have seen it.
    #[error("request not delivered: {message}")]
    NotDelivered { message: String },
    /// The agent answered, but with something that is not a valid reply.
    #[error("unexpected reply from agent: {message}")]
    Delivered { message: String },
    /// The request may or may not have reached the agent.
    #[error("connection lost: {message}")]
    Unknown { message: String },
}

impl TransportError {
    pub fn not_delivered(message: impl Into<String>) -> Self {
        Self::NotDelivered {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// True when the failure happened while establishing the connection.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::NotDelivered { .. })
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("agent error ({code:?}): {message}")]
    Agent { code: ErrorCode, message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error(
        "{operation} timed out after {elapsed_ms}ms and {attempts} attempt(s){}",
        last_error_suffix(.last_error)
    )]
    Timeout {
        operation: String,
        elapsed_ms: u64,
        attempts: u32,
        last_error: Option<TransportError>,
    },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
    #[error("{operation} was abandoned {abandon_after_ms}ms after cancellation")]
    Abandoned {
        operation: String,
        abandon_after_ms: u64,
    },
    /// The caller cancelled while a start request for `ticket` may already
    /// have reached the agent.
    #[error("script execution {ticket} was cancelled after it may have started")]
    CancelledAfterPotentiallyStarting {
        ticket: ScriptTicket,
        service: ScriptServiceVersion,
    },
}

impl ClientError {
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether the call provably never reached the agent.
    pub fn is_connecting(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connecting(),
            Self::Timeout {
                last_error: Some(err),
                ..
            } => err.is_connecting(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. }
                | Self::Abandoned { .. }
                | Self::CancelledAfterPotentiallyStarting { .. }
        )
    }
}

fn last_error_suffix(last_error: &Option<TransportError>) -> String {
    match last_error {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}
