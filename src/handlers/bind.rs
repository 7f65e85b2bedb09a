//! Bind handler: commits the scheduler's chosen node by allocating a
//! device, patching the pod's annotations, and issuing the node-binding
//! call.

use super::AppState;
use crate::error::ExtenderError;
use crate::unhealthy::UnhealthyGpuSet;

pub struct BindRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub node: String,
}

/// Resolves the pod to bind: the known-pods cache first (keyed by uid, so a
/// hit is inherently identity-correct), falling back to a live cluster read
/// only on a cache miss or a uid mismatch against the cached copy.
async fn get_pod(state: &AppState, req: &BindRequest) -> Result<k8s_openapi::api::core::v1::Pod, ExtenderError> {
    if let Some(cached) = state.cache.get_known_pod(&req.pod_uid) {
        return Ok(cached);
    }

    let current = state
        .cluster
        .get_pod(&req.pod_namespace, &req.pod_name)
        .await
        .map_err(|e| ExtenderError::Cache(crate::error::CacheError::Api(e.to_string())))?;

    let current_uid = current.metadata.uid.clone().unwrap_or_default();
    if current_uid != req.pod_uid {
        return Err(ExtenderError::IdentityMismatch(format!(
            "expected uid {}, found {}",
            req.pod_uid, current_uid
        )));
    }
    Ok(current)
}

/// Commits the scheduler's chosen node by resolving the pod (cache-first),
/// allocating a device, patching the pod's annotations, and issuing the
/// node-binding call.
pub async fn bind(state: &AppState, req: &BindRequest) -> Result<i32, ExtenderError> {
    let current = get_pod(state, req).await?;

    let node_info = state
        .cache
        .get_node_info(&req.node, state.cluster.as_ref())
        .await
        .map_err(ExtenderError::Cache)?;

    let unhealthy = UnhealthyGpuSet::fetch(state.cluster.as_ref(), &req.node).await;
    let device_index = node_info
        .allocate(&current, state.cluster.as_ref(), &unhealthy)
        .await
        .map_err(ExtenderError::Allocate)?;

    Ok(device_index)
}
