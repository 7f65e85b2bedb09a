//! Unhealthy-GPU lookup: reads a per-node `ConfigMap` listing device
//! indices to exclude from scheduling, independent of the node's own
//! per-device status resource (`cluster::is_device_status_healthy`) — both
//! filters apply when computing available devices.

use crate::cluster::ClusterApi;
use std::collections::HashSet;

pub const UNHEALTHY_GPU_NAMESPACE: &str = "kube-system";

/// The set of device indices a node's `unhealthy-gpu-{node}` configmap
/// names. Absent record maps to an empty set.
#[derive(Debug, Clone, Default)]
pub struct UnhealthyGpuSet {
    indices: HashSet<i32>,
}

impl UnhealthyGpuSet {
    pub fn empty() -> Self {
        UnhealthyGpuSet::default()
    }

    pub fn from_indices(indices: Vec<i32>) -> Self {
        UnhealthyGpuSet {
            indices: indices.into_iter().collect(),
        }
    }

    pub fn contains(&self, index: i32) -> bool {
        self.indices.contains(&index)
    }

    /// Fetches and parses the `unhealthy-gpu-{node}` configmap for a node.
    /// Absent configmap, absent `gpus` field, or an unparseable entry all
    /// degrade gracefully (a bad entry is skipped, not fatal — mirroring
    /// `getUnhealthyGPUs` in the original implementation, which logs and
    /// continues rather than aborting the whole lookup).
    pub async fn fetch(cluster: &dyn ClusterApi, node_name: &str) -> Self {
        let name = format!("unhealthy-gpu-{node_name}");
        let cm = match cluster.get_configmap(UNHEALTHY_GPU_NAMESPACE, &name).await {
            Ok(Some(cm)) => cm,
            Ok(None) => return UnhealthyGpuSet::empty(),
            Err(_) => return UnhealthyGpuSet::empty(),
        };

        let Some(data) = cm.data else {
            return UnhealthyGpuSet::empty();
        };
        let Some(gpus) = data.get("gpus") else {
            return UnhealthyGpuSet::empty();
        };

        let indices = gpus
            .split(',')
            .filter_map(|s| s.trim().parse::<i32>().ok())
            .collect();
        UnhealthyGpuSet { indices }
    }
}
