//! NodeInfo: aggregate state for one node and the Assume/Allocate
//! algorithms that are the heart of the scheduling engine.

use crate::cluster::{is_device_status_healthy, ClusterApi};
use crate::device::DeviceInfo;
use crate::error::AllocateError;
use crate::pod;
use crate::unhealthy::UnhealthyGpuSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Node-level aggregated information. The write lock is held across the
/// patch+bind sequence inside `allocate`, which is why it's a
/// `tokio::sync::RwLock`: that lock must survive `.await` points, and
/// holding a `std::sync::RwLock` guard across an await is unsound in an
/// async runtime.
pub struct NodeInfo {
    name: String,
    node: RwLock<Node>,
    devices: RwLock<HashMap<i32, DeviceInfo>>,
    gpu_count: RwLock<i32>,
    gpu_total_memory: RwLock<i64>,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        let name = node.metadata.name.clone().unwrap_or_default();
        let gpu_count = pod::node_gpu_count(&node);
        let gpu_total_memory = pod::node_total_gpu_memory(&node);
        let devices = build_device_map(gpu_count, gpu_total_memory);
        if devices.is_empty() {
            warn!(node = %name, "node has no devices");
        }
        NodeInfo {
            name,
            node: RwLock::new(node),
            devices: RwLock::new(devices),
            gpu_count: RwLock::new(gpu_count),
            gpu_total_memory: RwLock::new(gpu_total_memory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refreshes derived totals when the cluster view for this node
    /// changes. The device map is only recreated when it is currently
    /// empty and the observed GPU count is now positive — an existing,
    /// populated device map (carrying accumulated pod assignments) is never
    /// thrown away.
    pub async fn reset(&self, node_view: Node) {
        let new_count = pod::node_gpu_count(&node_view);
        let new_total = pod::node_total_gpu_memory(&node_view);

        *self.gpu_count.write().await = new_count;
        *self.gpu_total_memory.write().await = new_total;
        *self.node.write().await = node_view;

        if new_count == 0 {
            warn!(node = %self.name, "reset but gpu count is 0");
        }
        if new_total == 0 {
            warn!(node = %self.name, "reset but gpu total memory is 0");
        }

        let mut devices = self.devices.write().await;
        if devices.is_empty() && new_count > 0 {
            *devices = build_device_map(new_count, new_total);
            info!(node = %self.name, count = new_count, "rebuilt device map");
        }
    }

    pub async fn total_memory(&self) -> i64 {
        *self.gpu_total_memory.read().await
    }

    pub async fn gpu_count(&self) -> i32 {
        *self.gpu_count.read().await
    }

    pub async fn node_snapshot(&self) -> Node {
        self.node.read().await.clone()
    }

    /// Feasibility check: true iff at least one healthy device has
    /// available memory >= the pod's request. Read-only, uses a read lock.
    pub async fn assume(&self, requested: &Pod, unhealthy: &UnhealthyGpuSet) -> bool {
        let req = pod::requested_memory(requested);
        if req <= 0 {
            return false;
        }
        let node = self.node.read().await;
        let devices = self.devices.read().await;
        available_devices(&node, &devices, unhealthy)
            .into_iter()
            .any(|(_, available)| available >= req)
    }

    /// Adds a pod already known to carry a valid device-index annotation to
    /// its device's set. Returns whether the device existed (mirrors the Go
    /// original's `addOrUpdatePod` "added" bool, which the cache uses to
    /// decide whether to remember the pod as known).
    pub async fn add_or_update_pod(&self, pod_obj: Pod) -> bool {
        let Some(id) = pod::assigned_device(&pod_obj) else {
            warn!(pod = ?pod_obj.metadata.name, "pod has no valid device index, skip");
            return false;
        };
        let devices = self.devices.read().await;
        let Some(dev) = devices.get(&id) else {
            warn!(node = %self.name, device = id, "device not found on node");
            return false;
        };
        let uid = pod_obj.metadata.uid.clone().unwrap_or_default();
        dev.add(uid, pod_obj);
        true
    }

    pub async fn remove_pod(&self, pod_obj: &Pod) {
        let Some(id) = pod::assigned_device(pod_obj) else {
            warn!(pod = ?pod_obj.metadata.name, node = %self.name, "pod has no device index, skip removal");
            return;
        };
        let devices = self.devices.read().await;
        match devices.get(&id) {
            Some(dev) => dev.remove(pod_obj.metadata.uid.as_deref().unwrap_or_default()),
            None => warn!(node = %self.name, device = id, "failed to find device for removal"),
        }
    }

    pub async fn devices(&self) -> Vec<(i32, i64, i64)> {
        let devices = self.devices.read().await;
        let mut out: Vec<(i32, i64, i64)> = devices
            .values()
            .map(|d| (d.index(), d.total_memory(), d.used_memory()))
            .collect();
        out.sort_by_key(|(idx, _, _)| *idx);
        out
    }

    pub async fn device_pods(&self, index: i32) -> Vec<Pod> {
        let devices = self.devices.read().await;
        devices.get(&index).map(|d| d.pods()).unwrap_or_default()
    }

    /// Commits a placement: selects a device, patches the pod's annotations
    /// via the cluster API, binds the pod to this node, then updates local
    /// bookkeeping. The write lock is held across patch+bind, serializing
    /// allocations within this node while leaving other nodes unaffected.
    pub async fn allocate(
        &self,
        pod_obj: &Pod,
        cluster: &dyn ClusterApi,
        unhealthy: &UnhealthyGpuSet,
    ) -> Result<i32, AllocateError> {
        let namespace = pod_obj.metadata.namespace.clone().unwrap_or_default();
        let name = pod_obj.metadata.name.clone().unwrap_or_default();
        info!(pod = %name, ns = %namespace, node = %self.name, "begin allocate");

        // SELECTING
        let devices = self.devices.write().await;
        let node = self.node.read().await;
        let per_device_memory = self.total_memory().await / self.gpu_count().await.max(1) as i64;
        let (device_index, _available) = select_device(&node, &devices, unhealthy, pod::requested_memory(pod_obj))
            .ok_or(AllocateError::Insufficient)?;
        drop(node);

        // PATCHING
        let patch = pod::build_assignment_patch(pod_obj, device_index, per_device_memory);
        let patched = match cluster
            .patch_pod_annotations(&namespace, &name, patch.clone())
            .await
        {
            Ok(p) => p,
            Err(crate::error::ClusterError::Conflict(_)) => {
                debug!(pod = %name, "optimistic lock conflict, retrying patch once");
                let _ = cluster.get_pod(&namespace, &name).await?;
                cluster
                    .patch_pod_annotations(&namespace, &name, patch)
                    .await
                    .map_err(AllocateError::from)?
            }
            Err(e) => return Err(e.into()),
        };

        // BINDING
        let uid = patched.metadata.uid.clone().unwrap_or_default();
        cluster
            .bind_pod(&namespace, &name, &uid, &self.name)
            .await
            .map_err(|e| AllocateError::Bind(e.to_string()))?;

        // COMMITTED
        let dev = devices
            .get(&device_index)
            .ok_or_else(|| AllocateError::Internal(format!("device {device_index} vanished after selection")))?;
        dev.add(uid, patched);

        info!(pod = %name, node = %self.name, device = device_index, "allocate committed");
        Ok(device_index)
    }
}

fn build_device_map(gpu_count: i32, gpu_total_memory: i64) -> HashMap<i32, DeviceInfo> {
    if gpu_count <= 0 {
        return HashMap::new();
    }
    let per_device = gpu_total_memory / gpu_count as i64;
    (0..gpu_count).map(|i| (i, DeviceInfo::new(i, per_device))).collect()
}

/// Devices with available memory, filtered by both health signals: the
/// node's own per-device status resource and the configmap-based unhealthy
/// list. Mirrors `getAvailableGPUs` in the original implementation.
fn available_devices(
    node: &Node,
    devices: &HashMap<i32, DeviceInfo>,
    unhealthy: &UnhealthyGpuSet,
) -> Vec<(i32, i64)> {
    devices
        .values()
        .filter(|d| is_device_status_healthy(node, d.index()))
        .filter(|d| !unhealthy.contains(d.index()))
        .map(|d| (d.index(), d.available_memory()))
        .collect()
}

/// Best-fit (tightest packing) selection: among healthy devices with enough
/// available memory, picks the one minimizing the leftover residual,
/// breaking ties by the smallest index.
fn select_device(
    node: &Node,
    devices: &HashMap<i32, DeviceInfo>,
    unhealthy: &UnhealthyGpuSet,
    requested: i64,
) -> Option<(i32, i64)> {
    if requested <= 0 {
        return None;
    }
    let mut candidates = available_devices(node, devices, unhealthy);
    candidates.retain(|(_, available)| *available >= requested);
    candidates.sort_by(|(a_idx, a_avail), (b_idx, b_avail)| {
        (a_avail - requested, *a_idx).cmp(&(b_avail - requested, *b_idx))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterApi;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn healthy_node(name: &str, gpu_count: i32, total_memory: i64) -> Node {
        let mut capacity = BTreeMap::new();
        capacity.insert(pod::RESOURCE_NAME.to_string(), Quantity(total_memory.to_string()));
        capacity.insert(pod::COUNT_NAME.to_string(), Quantity(gpu_count.to_string()));
        let mut allocatable = capacity.clone();
        for i in 0..gpu_count {
            allocatable.insert(format!("{}{}", pod::RESOURCE_STATUS_PREFIX, i), Quantity("1".into()));
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                capacity: Some(capacity),
                allocatable: Some(allocatable),
                ..Default::default()
            }),
        }
    }

    fn pod_requesting(ns: &str, name: &str, uid: &str, mem: i64) -> Pod {
        use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
        let mut limits = BTreeMap::new();
        limits.insert(pod::RESOURCE_NAME.to_string(), Quantity(mem.to_string()));
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    resources: Some(ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn single_gpu_exact_fit() {
        let node = NodeInfo::new(healthy_node("n1", 1, 8000));
        let unhealthy = UnhealthyGpuSet::empty();
        let requester = pod_requesting("default", "w1", "uid-1", 8000);
        assert!(node.assume(&requester, &unhealthy).await);

        let fake = FakeClusterApi::new();
        fake.insert_pod(requester.clone());
        let idx = node.allocate(&requester, &fake, &unhealthy).await.unwrap();
        assert_eq!(idx, 0);

        let requester2 = pod_requesting("default", "w2", "uid-2", 1);
        assert!(!node.assume(&requester2, &unhealthy).await);
    }

    #[tokio::test]
    async fn best_fit_picks_tightest_residual() {
        let node_view = healthy_node("n1", 4, 40_000);
        let node = NodeInfo::new(node_view);
        // GPU 1 has 6000 used, GPU 2 has 4000 used, 0 & 3 empty, per-device=10000.
        {
            let devices = node.devices.read().await;
            devices
                .get(&1)
                .unwrap()
                .add("u1".into(), pod_requesting("ns", "p1", "u1", 6000));
            devices
                .get(&2)
                .unwrap()
                .add("u2".into(), pod_requesting("ns", "p2", "u2", 4000));
        }

        let unhealthy = UnhealthyGpuSet::empty();
        let requester = pod_requesting("default", "w3", "uid-3", 3000);
        let fake = FakeClusterApi::new();
        fake.insert_pod(requester.clone());
        let idx = node.allocate(&requester, &fake, &unhealthy).await.unwrap();
        assert_eq!(idx, 1);
    }

    #[tokio::test]
    async fn unhealthy_device_excluded() {
        let node = NodeInfo::new(healthy_node("n1", 2, 20_000));
        let unhealthy = UnhealthyGpuSet::from_indices(vec![0]);
        let requester = pod_requesting("default", "w1", "uid-1", 5000);
        assert!(node.assume(&requester, &unhealthy).await);

        let fake = FakeClusterApi::new();
        fake.insert_pod(requester.clone());
        let idx = node.allocate(&requester, &fake, &unhealthy).await.unwrap();
        assert_eq!(idx, 1);

        let unhealthy_both = UnhealthyGpuSet::from_indices(vec![0, 1]);
        let requester2 = pod_requesting("default", "w2", "uid-2", 1000);
        assert!(!node.assume(&requester2, &unhealthy_both).await);
    }

    #[tokio::test]
    async fn optimistic_lock_conflict_is_retried_once() {
        let node = NodeInfo::new(healthy_node("n1", 1, 8000));
        let unhealthy = UnhealthyGpuSet::empty();
        let requester = pod_requesting("default", "w1", "uid-1", 4000);
        let fake = FakeClusterApi::new();
        fake.insert_pod(requester.clone());
        *fake.fail_next_patch_with_conflict.lock().unwrap() = true;

        let idx = node.allocate(&requester, &fake, &unhealthy).await.unwrap();
        assert_eq!(idx, 0);
    }

    #[tokio::test]
    async fn insufficient_when_no_device_fits() {
        let node = NodeInfo::new(healthy_node("n1", 1, 1000));
        let unhealthy = UnhealthyGpuSet::empty();
        let requester = pod_requesting("default", "w1", "uid-1", 5000);
        let fake = FakeClusterApi::new();
        fake.insert_pod(requester.clone());
        let err = node.allocate(&requester, &fake, &unhealthy).await.unwrap_err();
        assert_eq!(err, AllocateError::Insufficient);
    }

    proptest::proptest! {
        /// Whatever the per-device available memory looks like, `select_device`
        /// always picks a device with the minimal non-negative residual
        /// (available - requested), never a device that doesn't fit.
        #[test]
        fn best_fit_minimizes_residual(
            availables in proptest::collection::vec(0i64..20_000, 1..8),
            requested in 1i64..20_000,
        ) {
            let node_view = healthy_node("n1", availables.len() as i32, availables.iter().sum::<i64>().max(1));
            let devices: HashMap<i32, DeviceInfo> = availables
                .iter()
                .enumerate()
                .map(|(i, &avail)| {
                    let dev = DeviceInfo::new(i as i32, avail);
                    (i as i32, dev)
                })
                .collect();
            let unhealthy = UnhealthyGpuSet::empty();

            let picked = select_device(&node_view, &devices, &unhealthy, requested);
            let best_fitting = availables
                .iter()
                .enumerate()
                .filter(|(_, &avail)| avail >= requested)
                .min_by_key(|(i, &avail)| (avail - requested, *i as i32));

            match best_fitting {
                None => proptest::prop_assert!(picked.is_none()),
                Some((idx, &avail)) => {
                    let (picked_idx, picked_avail) = picked.unwrap();
                    proptest::prop_assert_eq!(picked_avail - requested, avail - requested);
                    proptest::prop_assert_eq!(picked_idx, idx as i32);
                }
            }
        }
    }
}
