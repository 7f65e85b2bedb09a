//! SchedulerCache: the node-indexed map, the known-assignment set, and the
//! invariants linking the two. Front door for reads/writes from the request
//! handlers and the reconciler.

use crate::cluster::ClusterApi;
use crate::error::CacheError;
use crate::node::NodeInfo;
use crate::pod;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct SchedulerCache {
    nodes: RwLock<HashMap<String, Arc<NodeInfo>>>,
    /// Known-assigned pods, keyed by UID: the authoritative record of "is
    /// this pod accounted anywhere", and also the last-observed object used
    /// to replay removal after the pod disappears from the watch stream.
    known_pods: RwLock<HashMap<String, Pod>>,
}

impl SchedulerCache {
    pub fn new() -> Self {
        SchedulerCache {
            nodes: RwLock::new(HashMap::new()),
            known_pods: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up (or lazily creates) the `NodeInfo` for a node name from the
    /// current cluster view. If an existing entry's view crosses a
    /// zero<->positive threshold for either total memory or GPU count, its
    /// device map is refreshed via `reset`; otherwise the existing entry
    /// (and its accumulated pod assignments) is kept untouched.
    pub async fn get_node_info(
        &self,
        name: &str,
        cluster: &dyn ClusterApi,
    ) -> Result<Arc<NodeInfo>, CacheError> {
        let node_view = cluster
            .get_node(name)
            .await
            .map_err(|e| CacheError::Api(e.to_string()))?;

        // Look up and, if absent, insert under a single write-lock critical
        // section so two concurrent callers for the same not-yet-cached
        // node can never both construct and insert their own `NodeInfo`,
        // silently discarding one (and whatever a caller mutated on it).
        let (info, just_created) = {
            let mut nodes = self.nodes.write().unwrap();
            let already_present = nodes.contains_key(name);
            let info = nodes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(NodeInfo::new(node_view.clone())))
                .clone();
            (info, !already_present)
        };

        if just_created {
            return Ok(info);
        }

        let old_total = info.total_memory().await;
        let old_count = info.gpu_count().await;
        let new_total = pod::node_total_gpu_memory(&node_view);
        let new_count = pod::node_gpu_count(&node_view);

        let crossed = (old_total <= 0 && new_total > 0)
            || (old_count <= 0 && new_count > 0)
            || (old_total > 0 && new_total <= 0)
            || (old_count > 0 && new_count <= 0);

        if crossed {
            debug!(node = %name, "gpu-share status changed, resetting node info");
            info.reset(node_view).await;
        } else {
            debug!(node = %name, "using existing node info");
        }
        Ok(info)
    }

    /// Returns `NodeInfo` for every node currently in the cache.
    pub fn nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn known(&self, uid: &str) -> bool {
        self.known_pods.read().unwrap().contains_key(uid)
    }

    pub fn get_known_pod(&self, uid: &str) -> Option<Pod> {
        self.known_pods.read().unwrap().get(uid).cloned()
    }

    /// Adds or updates a pod's device assignment. A no-op if the pod has no
    /// node assignment yet. On success, remembers the pod as known.
    pub async fn add_or_update_pod(&self, pod_obj: Pod, cluster: &dyn ClusterApi) -> Result<(), CacheError> {
        let Some(node_name) = pod_obj
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
        else {
            debug!(pod = ?pod_obj.metadata.name, "pod has no node assignment, skip");
            return Ok(());
        };

        let node_info = self.get_node_info(node_name, cluster).await?;
        let uid = pod_obj.metadata.uid.clone().unwrap_or_default();
        let pod_clone = pod_obj.clone();
        if node_info.add_or_update_pod(pod_obj).await {
            self.known_pods.write().unwrap().insert(uid, pod_clone);
        } else {
            debug!(
                pod = ?pod_clone.metadata.name,
                device = ?pod::assigned_device(&pod_clone),
                "illegal device index, skip remembering pod"
            );
        }
        Ok(())
    }

    /// Removes a pod from its node's device set and from the known-set.
    pub async fn remove_pod(&self, pod_obj: &Pod, cluster: &dyn ClusterApi) {
        if let Some(node_name) = pod_obj.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            if let Ok(node_info) = self.get_node_info(node_name, cluster).await {
                node_info.remove_pod(pod_obj).await;
            }
        }
        if let Some(uid) = &pod_obj.metadata.uid {
            self.known_pods.write().unwrap().remove(uid);
        }
    }

    /// Rebuilds the cache from a full cluster snapshot: every GPU-sharing
    /// pod with a non-empty node assignment is folded in via
    /// `add_or_update_pod`.
    pub async fn build(&self, cluster: &dyn ClusterApi) -> Result<(), CacheError> {
        info!("building scheduler cache from cluster snapshot");
        let pods = cluster.list_pods().await.map_err(|e| CacheError::Api(e.to_string()))?;
        for pod_obj in pods {
            if !pod::is_sharing_pod(&pod_obj) {
                continue;
            }
            if !pod::has_node_name(&pod_obj) {
                continue;
            }
            self.add_or_update_pod(pod_obj, cluster).await?;
        }
        Ok(())
    }
}

impl Default for SchedulerCache {
    fn default() -> Self {
        Self::new()
    }
}
