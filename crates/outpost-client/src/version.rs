use crate::error::{ClientError, ClientResult};
use crate::executor::{decode, invoke};
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};
use crate::options::ClientOptions;
use crate::rpc::RpcCallExecutor;
use crate::transport::Transport;
use outpost_protocol::{CapabilitiesResponse, Request, ScriptServiceVersion};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Picks the script service to talk to from what the agent advertises.
///
/// Agents advertise either Kubernetes services or shell services, never a
/// mix, so any Kubernetes entry wins outright.
pub fn select_service_version(
    capabilities: &CapabilitiesResponse,
    disable_v3_alpha: bool,
) -> ScriptServiceVersion {
    if capabilities
        .supported_services
        .iter()
        .any(|name| name.contains("kubernetes"))
    {
        return ScriptServiceVersion::KubernetesV1;
    }
    if !disable_v3_alpha && capabilities.supports(ScriptServiceVersion::V3Alpha) {
        return ScriptServiceVersion::V3Alpha;
    }
    if capabilities.supports(ScriptServiceVersion::V2) {
        return ScriptServiceVersion::V2;
    }
    ScriptServiceVersion::V1
}

/// Negotiates the service version once and remembers it.
#[derive(Default)]
pub(crate) struct ScriptServiceVersionSelector {
    selected: OnceCell<ScriptServiceVersion>,
}

impl ScriptServiceVersionSelector {
    pub(crate) fn selected(&self) -> Option<ScriptServiceVersion> {
        self.selected.get().copied()
    }

    pub(crate) async fn determine<T: Transport>(
        &self,
        transport: &Arc<T>,
        rpc: &RpcCallExecutor,
        options: &ClientOptions,
        metrics: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        let version = self
            .selected
            .get_or_try_init(|| async {
                debug!("determining script service version");
                let capabilities = fetch_capabilities(transport, rpc, options, metrics, cancel).await?;
                debug!(
                    services = %capabilities.supported_services.join(","),
                    "discovered agent capabilities"
                );
                let version = select_service_version(&capabilities, options.disable_v3_alpha);
                if version.is_legacy() {
                    debug!("no retry-capable script service found; rpc retries will not be used for script execution");
                } else if options.retries_enabled {
                    debug!(
                        retry_secs = rpc.retry_duration().as_secs(),
                        "rpc call retries are enabled"
                    );
                } else {
                    debug!("rpc call retries are disabled");
                }
                debug!(%version, "using script service");
                Ok::<_, ClientError>(version)
            })
            .await?;
        Ok(*version)
    }
}

pub(crate) async fn fetch_capabilities<T: Transport>(
    transport: &Arc<T>,
    rpc: &RpcCallExecutor,
    options: &ClientOptions,
    metrics: &ClientOperationMetricsBuilder,
    cancel: &CancellationToken,
) -> ClientResult<CapabilitiesResponse> {
    let data = rpc
        .execute(
            options.retries_enabled,
            RpcCall::for_request(&Request::GetCapabilities),
            |ct| invoke(transport.clone(), Request::GetCapabilities, ct),
            metrics,
            cancel,
        )
        .await?;
    decode(data, "capabilities")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(services: &[ScriptServiceVersion]) -> CapabilitiesResponse {
        CapabilitiesResponse {
            supported_services: services.iter().map(|s| s.service_name().to_string()).collect(),
        }
    }

    #[test]
    fn prefers_newest_shell_service() {
        use ScriptServiceVersion::*;
        assert_eq!(select_service_version(&caps(&[V1, V2, V3Alpha]), false), V3Alpha);
        assert_eq!(select_service_version(&caps(&[V1, V2, V3Alpha]), true), V2);
        assert_eq!(select_service_version(&caps(&[V1, V2]), false), V2);
        assert_eq!(select_service_version(&caps(&[V1]), false), V1);
        assert_eq!(select_service_version(&caps(&[]), false), V1);
    }

    #[test]
    fn any_kubernetes_service_wins() {
        let capabilities = CapabilitiesResponse {
            supported_services: vec![
                "script_service_v2".to_string(),
                "kubernetes_script_service_v1alpha".to_string(),
            ],
        };
        assert_eq!(
            select_service_version(&capabilities, false),
            ScriptServiceVersion::KubernetesV1
        );
    }
}
