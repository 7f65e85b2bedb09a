//! The boundary between this crate's scheduling core and the cluster. A
//! narrow async trait stands in for the orchestrator's API and watch
//! streams, with a `kube`-backed implementation for production and an
//! in-memory fake for tests — the same shape as the teacher's own
//! boundary collaborators (e.g. `BpiLedgerClient`/`DomainAuditBridge` in
//! `enc-cluster-manager`).

use crate::error::ClusterError;
use crate::pod;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

/// Everything the scheduling core needs from the cluster: list/get/patch on
/// pods and nodes, a config-map read for the unhealthy-GPU record, and the
/// bind call that commits a pod onto a node.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<Pod, ClusterError>;
    async fn bind_pod(&self, namespace: &str, name: &str, uid: &str, node: &str) -> Result<(), ClusterError>;
    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClusterError>;
}

/// Production implementation backed by a real `kube::Client`.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        KubeClusterApi { client }
    }
}

fn map_kube_err(err: kube::Error) -> ClusterError {
    if let kube::Error::Api(ref resp) = err {
        if resp.message == crate::error::OPTIMISTIC_LOCK_ERROR_MSG {
            return ClusterError::Conflict(resp.message.clone());
        }
        if resp.code == 404 {
            return ClusterError::NotFound;
        }
    }
    ClusterError::Api(err.to_string())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name).await.map_err(map_kube_err)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api
            .list(&Default::default())
            .await
            .map_err(map_kube_err)?
            .items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api
            .list(&Default::default())
            .await
            .map_err(map_kube_err)?
            .items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(map_kube_err)
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<Pod, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(map_kube_err)
    }

    async fn bind_pod(&self, namespace: &str, name: &str, uid: &str, node: &str) -> Result<(), ClusterError> {
        // The core API has no typed `Binding` subresource in k8s-openapi's
        // stable surface; a Binding is posted as a raw object against the
        // pod's `/binding` subresource, matching what the orchestrator's own
        // default scheduler does.
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let binding = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": { "name": name, "uid": uid },
            "target": { "apiVersion": "v1", "kind": "Node", "name": node },
        });
        let request = api
            .request::<serde_json::Value>(
                http::Request::post(format!(
                    "/api/v1/namespaces/{namespace}/pods/{name}/binding"
                ))
                .body(serde_json::to_vec(&binding).map_err(|e| ClusterError::Api(e.to_string()))?)
                .map_err(|e| ClusterError::Api(e.to_string()))?,
            )
            .await;
        request.map(|_: serde_json::Value| ()).map_err(map_kube_err)
    }

    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(map_kube_err(e)),
        }
    }
}

/// In-memory `ClusterApi` used by unit/integration tests and by `tests/`
/// integration fixtures; exported unconditionally since it has no
/// dependency outside this crate and downstream integration tests need it
/// without a feature flag.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `ClusterApi` for unit and integration tests. Holds nodes,
    /// pods, and configmaps in plain maps; `patch_pod_annotations` can be
    /// configured to fail once with an optimistic-lock conflict to exercise
    /// the retry path.
    #[derive(Default)]
    pub struct FakeClusterApi {
        pub nodes: Mutex<HashMap<String, Node>>,
        pub pods: Mutex<HashMap<(String, String), Pod>>,
        pub configmaps: Mutex<HashMap<(String, String), ConfigMap>>,
        pub fail_next_patch_with_conflict: Mutex<bool>,
    }

    impl FakeClusterApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_node(&self, node: Node) {
            let name = node.metadata.name.clone().unwrap_or_default();
            self.nodes.lock().unwrap().insert(name, node);
        }

        pub fn insert_pod(&self, pod: Pod) {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();
            self.pods.lock().unwrap().insert((ns, name), pod);
        }
    }

    #[async_trait]
    impl ClusterApi for FakeClusterApi {
        async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
            self.nodes
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or(ClusterError::NotFound)
        }

        async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
            Ok(self.nodes.lock().unwrap().values().cloned().collect())
        }

        async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
            Ok(self.pods.lock().unwrap().values().cloned().collect())
        }

        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
            self.pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or(ClusterError::NotFound)
        }

        async fn patch_pod_annotations(
            &self,
            namespace: &str,
            name: &str,
            patch: serde_json::Value,
        ) -> Result<Pod, ClusterError> {
            {
                let mut fail = self.fail_next_patch_with_conflict.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Err(ClusterError::Conflict(
                        crate::error::OPTIMISTIC_LOCK_ERROR_MSG.to_string(),
                    ));
                }
            }
            let mut pods = self.pods.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());
            let existing = pods.get_mut(&key).ok_or(ClusterError::NotFound)?;
            let annotations = patch["metadata"]["annotations"]
                .as_object()
                .cloned()
                .unwrap_or_default();
            let mut merged = existing.metadata.annotations.clone().unwrap_or_default();
            for (k, v) in annotations {
                if let Some(s) = v.as_str() {
                    merged.insert(k, s.to_string());
                }
            }
            existing.metadata.annotations = Some(merged);
            Ok(existing.clone())
        }

        async fn bind_pod(&self, namespace: &str, name: &str, _uid: &str, node: &str) -> Result<(), ClusterError> {
            let mut pods = self.pods.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());
            let existing = pods.get_mut(&key).ok_or(ClusterError::NotFound)?;
            let mut spec = existing.spec.clone().unwrap_or_default();
            spec.node_name = Some(node.to_string());
            existing.spec = Some(spec);
            Ok(())
        }

        async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClusterError> {
            Ok(self
                .configmaps
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }
}

/// Whether a device index on a node is healthy per the node's own
/// allocatable status (distinct from the configmap-based unhealthy list in
/// `unhealthy.rs`; both filters apply).
pub fn is_device_status_healthy(node: &Node, index: i32) -> bool {
    let key = format!("{}{}", pod::RESOURCE_STATUS_PREFIX, index);
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(&key))
        .and_then(|q| q.0.parse::<i64>().ok())
        .map(|v| v == 1)
        .unwrap_or(false)
}
