//! Inspect handler: read-only dump of per-node GPU occupancy.

use super::AppState;
use crate::pod;
use std::sync::Arc;

pub struct PodUsage {
    pub namespace: String,
    pub name: String,
    pub used_memory: i64,
}

pub struct DeviceUsage {
    pub id: i32,
    pub total_memory: i64,
    pub used_memory: i64,
    pub pods: Vec<PodUsage>,
}

pub struct NodeUsage {
    pub name: String,
    pub total_memory: i64,
    pub used_memory: i64,
    pub devices: Vec<DeviceUsage>,
}

async fn usage_for(node_info: &Arc<crate::node::NodeInfo>) -> NodeUsage {
    let mut devices = Vec::new();
    let mut used_total = 0i64;
    for (id, total, used) in node_info.devices().await {
        used_total += used;
        let pods = node_info
            .device_pods(id)
            .await
            .into_iter()
            .filter(|p| !pod::is_terminal(p))
            .map(|p| PodUsage {
                namespace: p.metadata.namespace.clone().unwrap_or_default(),
                name: p.metadata.name.clone().unwrap_or_default(),
                used_memory: pod::requested_memory(&p),
            })
            .collect();
        devices.push(DeviceUsage {
            id,
            total_memory: total,
            used_memory: used,
            pods,
        });
    }
    devices.sort_by_key(|d| d.id);

    NodeUsage {
        name: node_info.name().to_string(),
        total_memory: node_info.total_memory().await,
        used_memory: used_total,
        devices,
    }
}

/// Dumps occupancy for a single node, refreshing it from the cluster view
/// first (same lazy-create/refresh path as `filter`/`bind`).
pub async fn inspect_node(state: &AppState, name: &str) -> Result<NodeUsage, crate::error::CacheError> {
    let node_info = state.cache.get_node_info(name, state.cluster.as_ref()).await?;
    Ok(usage_for(&node_info).await)
}

/// Dumps occupancy for every node currently known to the cache (does not
/// discover nodes the cache has never been asked about).
pub async fn inspect_all(state: &AppState) -> Vec<NodeUsage> {
    let mut out = Vec::new();
    for node_info in state.cache.nodes() {
        out.push(usage_for(&node_info).await);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
