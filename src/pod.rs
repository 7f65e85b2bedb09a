//! Pure functions over pod objects: classification, annotation parsing, and
//! the assignment patch. Nothing here talks to the cluster.

use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// The GPU-memory resource name the orchestrator advertises on node capacity
/// and pod resource requests.
pub const RESOURCE_NAME: &str = "aliyun.com/gpu-mem";
/// The GPU-count resource name on node capacity.
pub const COUNT_NAME: &str = "aliyun.com/gpu-count";
/// Prefix for the per-device health resource, e.g. `aliyun.com/gpu-mem.status-0`.
pub const RESOURCE_STATUS_PREFIX: &str = "aliyun.com/gpu-mem.status-";

pub const ANNOTATION_DEVICE_IDX: &str = "ALIYUN_COM_GPU_MEM_IDX";
pub const ANNOTATION_MEM_PER_POD: &str = "ALIYUN_COM_GPU_MEM_POD";
pub const ANNOTATION_MEM_PER_DEV: &str = "ALIYUN_COM_GPU_MEM_DEV";
pub const ANNOTATION_ASSIGNED: &str = "ALIYUN_COM_GPU_MEM_ASSIGNED";
pub const ANNOTATION_ASSUME_TIME: &str = "ALIYUN_COM_GPU_MEM_ASSUME_TIME";

/// Sum of the GPU-memory resource limit across all containers in the pod
/// spec. Zero for pods that don't ask for GPU memory at all.
pub fn requested_memory(pod: &Pod) -> i64 {
    let Some(spec) = &pod.spec else {
        return 0;
    };
    spec.containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.limits.as_ref())
        .filter_map(|limits| limits.get(RESOURCE_NAME))
        .filter_map(|q| q.0.parse::<i64>().ok())
        .sum()
}

/// A pod is a GPU-sharing workload iff it requested a positive amount of
/// GPU memory.
pub fn is_sharing_pod(pod: &Pod) -> bool {
    requested_memory(pod) > 0
}

/// Parses the device-index annotation. `None` if absent or malformed,
/// mirroring the Go original's `-1` sentinel as an idiomatic `Option`.
pub fn assigned_device(pod: &Pod) -> Option<i32> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(ANNOTATION_DEVICE_IDX)?
        .parse::<i32>()
        .ok()
        .filter(|id| *id >= 0)
}

/// Phase is `Succeeded` or `Failed`.
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Has a non-empty node assignment and has not reached a terminal phase.
pub fn is_live_assigned(pod: &Pod) -> bool {
    has_node_name(pod) && !is_terminal(pod)
}

pub fn has_node_name(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .map(|n| !n.is_empty())
        .unwrap_or(false)
}

/// Total GPU memory capacity advertised by a node, 0 if the node carries no
/// GPU-memory resource at all.
pub fn node_total_gpu_memory(node: &k8s_openapi::api::core::v1::Node) -> i64 {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(RESOURCE_NAME))
        .and_then(|q| q.0.parse::<i64>().ok())
        .unwrap_or(0)
}

/// GPU device count advertised by a node, 0 if absent.
pub fn node_gpu_count(node: &k8s_openapi::api::core::v1::Node) -> i32 {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(COUNT_NAME))
        .and_then(|q| q.0.parse::<i32>().ok())
        .unwrap_or(0)
}

pub fn is_gpu_sharing_node(node: &k8s_openapi::api::core::v1::Node) -> bool {
    node_total_gpu_memory(node) > 0
}

/// Builds the strategic-merge-patch body that records a device assignment on
/// a pod: the chosen index, the per-device and per-pod memory, the
/// driver-facing "not yet assigned" flag, and a nanosecond assume-timestamp
/// the device driver uses downstream to reconcile the assignment.
pub fn build_assignment_patch(pod: &Pod, device_index: i32, per_device_memory: i64) -> serde_json::Value {
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    json!({
        "metadata": {
            "annotations": {
                ANNOTATION_DEVICE_IDX: device_index.to_string(),
                ANNOTATION_MEM_PER_DEV: per_device_memory.to_string(),
                ANNOTATION_MEM_PER_POD: requested_memory(pod).to_string(),
                ANNOTATION_ASSIGNED: "false",
                ANNOTATION_ASSUME_TIME: now_nanos.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_request(mem: &str) -> Pod {
        let mut limits = BTreeMap::new();
        limits.insert(RESOURCE_NAME.to_string(), Quantity(mem.to_string()));
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
            status: None,
        }
    }

    #[test]
    fn requested_memory_sums_containers() {
        let pod = pod_with_request("4096");
        assert_eq!(requested_memory(&pod), 4096);
    }

    #[test]
    fn is_sharing_pod_requires_positive_request() {
        assert!(is_sharing_pod(&pod_with_request("1")));
        assert!(!is_sharing_pod(&pod_with_request("0")));
    }

    #[test]
    fn assigned_device_parses_valid_annotation() {
        let mut pod = pod_with_request("1000");
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_DEVICE_IDX.to_string(), "2".to_string());
        pod.metadata.annotations = Some(annotations);
        assert_eq!(assigned_device(&pod), Some(2));
    }

    #[test]
    fn assigned_device_is_none_when_malformed_or_absent() {
        let pod = pod_with_request("1000");
        assert_eq!(assigned_device(&pod), None);

        let mut malformed = pod_with_request("1000");
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_DEVICE_IDX.to_string(), "not-a-number".to_string());
        malformed.metadata.annotations = Some(annotations);
        assert_eq!(assigned_device(&malformed), None);
    }

    #[test]
    fn terminal_phases() {
        let mut pod = pod_with_request("1000");
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(is_terminal(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(!is_terminal(&pod));
    }

    #[test]
    fn build_assignment_patch_round_trips_device_index() {
        let pod = pod_with_request("2048");
        let patch = build_assignment_patch(&pod, 3, 8192);
        let value = patch["metadata"]["annotations"][ANNOTATION_DEVICE_IDX]
            .as_str()
            .unwrap();
        assert_eq!(value.parse::<i32>().unwrap(), 3);
        assert_eq!(
            patch["metadata"]["annotations"][ANNOTATION_MEM_PER_DEV]
                .as_str()
                .unwrap(),
            "8192"
        );
        assert_eq!(
            patch["metadata"]["annotations"][ANNOTATION_ASSIGNED]
                .as_str()
                .unwrap(),
            "false"
        );
    }
}
