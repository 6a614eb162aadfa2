//! Shadow workload provisioning policy
//!
//! Owns the naming and labeling rules for the shadow workload and drives
//! the cluster seam's idempotent create-or-get. No retries happen here;
//! any cluster-side error aborts the caller's flow.

use std::collections::HashMap;

use tracing::info;

use crate::client::{ClusterClient, ClusterError};
use crate::models::{
    ShadowEndpoint, ShadowSpec, WorkloadId, COMPONENT_CONNECT, CONTROL_BY_VALUE, LABEL_COMPONENT,
    LABEL_CONTROL_BY, LABEL_NAME, LABEL_VERSION,
};

/// Everything the provisioner needs from the invocation's configuration.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub namespace: String,
    /// Reuse the deterministic shared workload instead of a per-process one
    pub share_shadow: bool,
    pub image: String,
    pub user_labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Environment injected into the shadow container
    pub envs: HashMap<String, String>,
}

/// Ensure a shadow workload exists for this invocation, returning its
/// structured identity alongside the endpoint.
pub async fn get_or_create_shadow(
    cluster: &dyn ClusterClient,
    request: &ProvisionRequest,
) -> Result<(WorkloadId, ShadowEndpoint), ClusterError> {
    let id = if request.share_shadow {
        WorkloadId::shared()
    } else {
        WorkloadId::generated()
    };
    info!("Provisioning shadow workload {}", id.name());

    let spec = ShadowSpec {
        namespace: request.namespace.clone(),
        image: request.image.clone(),
        labels: shadow_labels(&id, &request.user_labels),
        annotations: request.annotations.clone(),
        envs: request.envs.clone(),
    };

    let endpoint = cluster.get_or_create_shadow(id.name(), &spec).await?;
    Ok((id, endpoint))
}

/// Labels attached to every shadow resource: ownership and component
/// markers, the resolved name, and the version tag. User-supplied labels
/// are merged in afterwards, so user values win on key collision.
pub fn shadow_labels(
    id: &WorkloadId,
    user_labels: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut labels = HashMap::from([
        (LABEL_CONTROL_BY.to_string(), CONTROL_BY_VALUE.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT_CONNECT.to_string()),
        (LABEL_NAME.to_string(), id.name().to_string()),
        (LABEL_VERSION.to_string(), id.version_tag().to_string()),
    ]);
    labels.extend(
        user_labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    labels
}
