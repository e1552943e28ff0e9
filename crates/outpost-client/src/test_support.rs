use crate::error::TransportError;
use crate::transport::Transport;
use outpost_protocol::{
    CapabilitiesResponse, ProcessOutput, ProcessOutputSource, ProcessState, Request, Response,
    ScriptServiceVersion, ScriptStatusResponse, ScriptTicket, StartScriptCommand,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// What the fake agent does with one request.
pub(crate) enum Step {
    Reply(Response),
    Fail(TransportError),
    /// Waits for the request's token, then fails as an in-flight call would.
    Hang,
    /// Waits for the request's token, then fails as a connect would.
    HangConnecting,
    /// Replies after a delay, ignoring the request's token.
    Delayed(std::time::Duration, Response),
}

type Responder = dyn Fn(&Request, usize) -> Step + Send + Sync;

/// Transport whose replies come from a closure given the request and how
/// many earlier requests of the same method were seen.
pub(crate) struct FakeTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub(crate) fn new(
        responder: impl Fn(&Request, usize) -> Step + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests").clone()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .filter(|request| request.rpc_name().1 == method)
            .count()
    }
}

impl Transport for FakeTransport {
    async fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError> {
        let index = {
            let mut requests = self.requests.lock().expect("requests");
            let method = request.rpc_name().1;
            let index = requests
                .iter()
                .filter(|seen| seen.rpc_name().1 == method)
                .count();
            requests.push(request.clone());
            index
        };
        match (self.responder)(&request, index) {
            Step::Reply(response) => Ok(response),
            Step::Fail(err) => Err(err),
            Step::Hang => {
                cancel.cancelled().await;
                Err(TransportError::unknown("cancelled while awaiting response"))
            }
            Step::HangConnecting => {
                cancel.cancelled().await;
                Err(TransportError::not_delivered("cancelled while connecting"))
            }
            Step::Delayed(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
        }
    }
}

pub(crate) fn ok(value: impl Serialize) -> Step {
    Step::Reply(Response::ok(Some(
        serde_json::to_value(value).expect("serialize reply"),
    )))
}

pub(crate) fn ok_empty() -> Step {
    Step::Reply(Response::ok(None))
}

pub(crate) fn capabilities(services: &[ScriptServiceVersion]) -> Step {
    ok(CapabilitiesResponse {
        supported_services: services
            .iter()
            .map(|service| service.service_name().to_string())
            .collect(),
    })
}

pub(crate) fn ticket_of(request: &Request) -> ScriptTicket {
    match request {
        Request::StartScript { command } => match command {
            StartScriptCommand::V1(_) => ScriptTicket::from_string("legacy"),
            StartScriptCommand::V2(cmd)
            | StartScriptCommand::V3Alpha(cmd)
            | StartScriptCommand::KubernetesV1(cmd) => cmd.ticket.clone(),
        },
        Request::GetStatus { ticket, .. }
        | Request::CancelScript { ticket, .. }
        | Request::CompleteScript { ticket, .. } => ticket.clone(),
        Request::GetCapabilities => ScriptTicket::from_string("none"),
    }
}

/// Status reply for whichever ticket `request` carries.
pub(crate) fn status_of(
    request: &Request,
    state: ProcessState,
    exit_code: i32,
    lines: &[&str],
    next_log_sequence: u64,
) -> Step {
    ok(ScriptStatusResponse {
        ticket: ticket_of(request),
        state,
        exit_code,
        logs: lines
            .iter()
            .map(|text| ProcessOutput {
                source: ProcessOutputSource::StdOut,
                text: text.to_string(),
                occurred_at_ms: 0,
            })
            .collect(),
        next_log_sequence,
    })
}
