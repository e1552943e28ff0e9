//! Client side of the outpost agent: a transport abstraction, a retry and
//! abandonment engine for individual calls, and an orchestrator that runs a
//! script from start to cleanup against whichever service version the agent
//! supports.

pub mod error;
pub mod executor;
pub mod metrics;
pub mod no_retries;
pub mod options;
pub mod orchestrator;
pub mod retry;
pub mod rpc;
pub mod transport;
pub mod version;

#[cfg(test)]
mod test_support;

pub use error::{ClientError, ClientResult, TransportError};
pub use executor::{
    CommandContext, ExecuteScriptCommand, ScriptOperationResult, ScriptServiceExecutor,
    ScriptStatus,
};
pub use metrics::{
    ClientObserver, ClientOperationMetrics, ClientOperationMetricsBuilder, NoopObserver, RpcCall,
    RpcCallMetrics, TimedOperation, TracingObserver,
};
pub use no_retries::RpcCallNoRetriesHandler;
pub use options::{ClientOptions, PollBackoff};
pub use orchestrator::{ScriptClient, ScriptExecutionResult};
pub use retry::{AttemptOutcome, RetryAttempt, RetryTimeout, RpcCallRetryHandler};
pub use rpc::RpcCallExecutor;
pub use transport::{Transport, UnixSocketTransport};
pub use version::select_service_version;
