use crate::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use outpost_protocol::{MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, Request, Response};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Request/response channel to an agent.
///
/// Implementations classify every failure by whether the agent could have
/// seen the request, since that decides whether a start may be repeated.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send {
        (**self).send(request, cancel)
    }
}

/// One connection per request over the agent's unix socket.
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    socket_path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

type LineReader = FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>;

impl Transport for UnixSocketTransport {
    async fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError> {
        let line = serde_json::to_string(&request)
            .map_err(|err| TransportError::not_delivered(format!("failed to encode request: {err}")))?;

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::not_delivered("cancelled while connecting"));
            }
            result = UnixStream::connect(&self.socket_path) => result.map_err(|err| {
                TransportError::not_delivered(format!(
                    "failed to connect {}: {err}",
                    self.socket_path.display()
                ))
            })?,
        };
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );
        let mut writer = FramedWrite::new(
            write_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );

        let hello = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::not_delivered("cancelled while connecting"));
            }
            hello = read_response(&mut reader) => hello.map_err(|err| match err {
                TransportError::Unknown { message } | TransportError::Delivered { message } => {
                    TransportError::NotDelivered { message }
                }
                other => other,
            })?,
        };
        match hello {
            Response::Hello { protocol_version } if protocol_version == PROTOCOL_VERSION => {}
            Response::Hello { protocol_version } => {
                return Err(TransportError::not_delivered(format!(
                    "agent speaks protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                )));
            }
            other => {
                return Err(TransportError::not_delivered(format!(
                    "expected agent hello, got {other:?}"
                )));
            }
        }

        writer
            .send(line)
            .await
            .map_err(|err| TransportError::unknown(format!("socket write failed: {err}")))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::unknown("cancelled while awaiting response")),
            response = read_response(&mut reader) => response,
        }
    }
}

async fn read_response(reader: &mut LineReader) -> Result<Response, TransportError> {
    let Some(line) = reader.next().await else {
        return Err(TransportError::unknown("agent disconnected"));
    };
    let line =
        line.map_err(|err| TransportError::unknown(format!("socket read failed: {err}")))?;
    serde_json::from_str(&line).map_err(|err| TransportError::Delivered {
        message: format!("invalid json response: {err}"),
    })
}
