//! Filter handler: for each candidate node, checks whether the pod's GPU
//! memory request fits given current occupancy.

use super::AppState;
use crate::pod;
use crate::unhealthy::UnhealthyGpuSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;

pub struct FilterOutcome {
    pub node_names: Vec<String>,
    /// The resolved `Node` objects backing `node_names`, for callers that
    /// report the full objects (the extender protocol's `Nodes` field)
    /// rather than just names.
    pub nodes: Vec<Node>,
    pub failed_nodes: HashMap<String, String>,
}

/// Filters `candidate_nodes` down to those that can host `requester`.
/// A node is rejected either because it carries no GPU-memory capacity at
/// all, or because no healthy device on it has enough available memory.
pub async fn filter(state: &AppState, requester: &Pod, candidate_nodes: &[String]) -> FilterOutcome {
    let mut node_names = Vec::new();
    let mut nodes = Vec::new();
    let mut failed_nodes = HashMap::new();

    for name in candidate_nodes {
        let node_info = match state.cache.get_node_info(name, state.cluster.as_ref()).await {
            Ok(info) => info,
            Err(e) => {
                failed_nodes.insert(name.clone(), e.to_string());
                continue;
            }
        };

        let node_view = node_info.node_snapshot().await;
        if !pod::is_gpu_sharing_node(&node_view) {
            failed_nodes.insert(name.clone(), "not for GPU share, need skip".to_string());
            continue;
        }

        let unhealthy = UnhealthyGpuSet::fetch(state.cluster.as_ref(), name).await;
        if node_info.assume(requester, &unhealthy).await {
            node_names.push(name.clone());
            nodes.push(node_view);
        } else {
            failed_nodes.insert(name.clone(), "insufficient GPU memory on any device".to_string());
        }
    }

    FilterOutcome {
        node_names,
        nodes,
        failed_nodes,
    }
}
