//! DeviceInfo: state for a single physical GPU on a single node.

use crate::pod;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::RwLock;

/// One physical GPU slot on a node. Tracks the pods currently charged to it.
/// All accessors take the device's own lock; callers never need to reach
/// into `pod_map` directly.
#[derive(Debug)]
pub struct DeviceInfo {
    index: i32,
    total_memory: i64,
    pod_map: RwLock<HashMap<String, Pod>>,
}

impl DeviceInfo {
    pub fn new(index: i32, total_memory: i64) -> Self {
        DeviceInfo {
            index,
            total_memory,
            pod_map: RwLock::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn total_memory(&self) -> i64 {
        self.total_memory
    }

    /// Sum of requested memory over non-terminal pods in the set. Terminal
    /// pods are skipped even if still present, so a late removal can never
    /// double-count or under-count what's actually charged.
    pub fn used_memory(&self) -> i64 {
        self.pod_map
            .read()
            .expect("device lock poisoned")
            .values()
            .filter(|p| !pod::is_terminal(p))
            .map(pod::requested_memory)
            .sum()
    }

    pub fn available_memory(&self) -> i64 {
        (self.total_memory - self.used_memory()).max(0)
    }

    pub fn add(&self, uid: String, pod: Pod) {
        self.pod_map.write().expect("device lock poisoned").insert(uid, pod);
    }

    pub fn remove(&self, uid: &str) {
        self.pod_map.write().expect("device lock poisoned").remove(uid);
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.pod_map
            .read()
            .expect("device lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(mem: i64, phase: &str) -> Pod {
        let mut limits = BTreeMap::new();
        limits.insert(pod::RESOURCE_NAME.to_string(), Quantity(mem.to_string()));
        Pod {
            metadata: ObjectMeta::default(),
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
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn used_memory_skips_terminal_pods() {
        let dev = DeviceInfo::new(0, 10_000);
        dev.add("a".into(), pod(4000, "Running"));
        dev.add("b".into(), pod(3000, "Succeeded"));
        assert_eq!(dev.used_memory(), 4000);
        assert_eq!(dev.available_memory(), 6000);
    }

    #[test]
    fn remove_frees_memory() {
        let dev = DeviceInfo::new(0, 10_000);
        dev.add("a".into(), pod(5000, "Running"));
        assert_eq!(dev.available_memory(), 5000);
        dev.remove("a");
        assert_eq!(dev.available_memory(), 10_000);
        // second remove is a no-op
        dev.remove("a");
        assert_eq!(dev.available_memory(), 10_000);
    }
}
