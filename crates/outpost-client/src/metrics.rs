use crate::error::ClientError;
use outpost_protocol::Request;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Identity of one RPC method, e.g. `script_service_v2` / `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcCall {
    pub service: &'static str,
    pub name: &'static str,
}

impl RpcCall {
    pub fn for_request(request: &Request) -> Self {
        let (service, name) = request.rpc_name();
        Self { service, name }
    }
}

impl std::fmt::Display for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct TimedOperation {
    pub duration: Duration,
    pub error: Option<String>,
    pub was_cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct RpcCallMetrics {
    pub rpc_call: RpcCall,
    pub retries_enabled: bool,
    pub retry_duration: Option<Duration>,
    pub duration: Duration,
    pub attempts: Vec<TimedOperation>,
    pub error: Option<String>,
    pub was_cancelled: bool,
}

impl RpcCallMetrics {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) struct RpcCallMetricsBuilder {
    rpc_call: RpcCall,
    retry_duration: Option<Duration>,
    started: Instant,
    attempts: Mutex<Vec<TimedOperation>>,
    error: Option<String>,
    was_cancelled: bool,
}

impl RpcCallMetricsBuilder {
    pub(crate) fn start_with_retries(rpc_call: RpcCall, retry_duration: Duration) -> Self {
        Self::start(rpc_call, Some(retry_duration))
    }

    pub(crate) fn start_without_retries(rpc_call: RpcCall) -> Self {
        Self::start(rpc_call, None)
    }

    fn start(rpc_call: RpcCall, retry_duration: Option<Duration>) -> Self {
        Self {
            rpc_call,
            retry_duration,
            started: Instant::now(),
            attempts: Mutex::new(Vec::new()),
            error: None,
            was_cancelled: false,
        }
    }

    pub(crate) fn with_attempt(&self, started: Instant, error: Option<&ClientError>, cancelled: bool) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TimedOperation {
                duration: started.elapsed(),
                error: error.map(ToString::to_string),
                was_cancelled: cancelled,
            });
    }

    pub(crate) fn failure(&mut self, error: &ClientError, cancelled: bool) {
        self.error = Some(error.to_string());
        self.was_cancelled = cancelled || error.is_cancelled();
    }

    pub(crate) fn build(self) -> RpcCallMetrics {
        RpcCallMetrics {
            rpc_call: self.rpc_call,
            retries_enabled: self.retry_duration.is_some(),
            retry_duration: self.retry_duration,
            duration: self.started.elapsed(),
            attempts: self
                .attempts
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            error: self.error,
            was_cancelled: self.was_cancelled,
        }
    }
}

/// Aggregate of every RPC made while executing one client operation.
#[derive(Debug, Clone)]
pub struct ClientOperationMetrics {
    pub operation: &'static str,
    pub duration: Duration,
    pub rpc_calls: Vec<RpcCallMetrics>,
    pub error: Option<String>,
    pub was_cancelled: bool,
}

impl ClientOperationMetrics {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn attempt_count(&self) -> usize {
        self.rpc_calls.iter().map(|call| call.attempts.len()).sum()
    }
}

pub struct ClientOperationMetricsBuilder {
    operation: &'static str,
    started: Instant,
    rpc_calls: Mutex<Vec<RpcCallMetrics>>,
}

impl ClientOperationMetricsBuilder {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
            rpc_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rpc_call(&self, metrics: RpcCallMetrics) {
        self.rpc_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metrics);
    }

    pub fn build<T>(self, outcome: &Result<T, ClientError>) -> ClientOperationMetrics {
        let (error, was_cancelled) = match outcome {
            Ok(_) => (None, false),
            Err(err) => (Some(err.to_string()), err.is_cancelled()),
        };
        ClientOperationMetrics {
            operation: self.operation,
            duration: self.started.elapsed(),
            rpc_calls: self
                .rpc_calls
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            error,
            was_cancelled,
        }
    }
}

/// Receives metrics as calls and operations complete. Implementations must
/// not block.
pub trait ClientObserver: Send + Sync {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics);
    fn execute_script_completed(&self, metrics: &ClientOperationMetrics);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ClientObserver for TracingObserver {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics) {
        debug!(
            rpc = %metrics.rpc_call,
            duration_ms = metrics.duration.as_millis() as u64,
            attempts = metrics.attempts.len(),
            retries_enabled = metrics.retries_enabled,
            succeeded = metrics.succeeded(),
            cancelled = metrics.was_cancelled,
            error = metrics.error.as_deref().unwrap_or(""),
            "rpc call completed"
        );
    }

    fn execute_script_completed(&self, metrics: &ClientOperationMetrics) {
        info!(
            operation = metrics.operation,
            duration_ms = metrics.duration.as_millis() as u64,
            rpc_calls = metrics.rpc_calls.len(),
            attempts = metrics.attempt_count(),
            succeeded = metrics.succeeded(),
            cancelled = metrics.was_cancelled,
            "client operation completed"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ClientObserver for NoopObserver {
    fn rpc_call_completed(&self, _metrics: &RpcCallMetrics) {}

    fn execute_script_completed(&self, _metrics: &ClientOperationMetrics) {}
}
