//! Event reconciler: watches Pods, filters to GPU-sharing transitions that
//! matter, and drives the cache through a rate-limited single-flight queue.
//! Mirrors `controller.go`'s add/update/delete handlers and worker loop.

use crate::cache::SchedulerCache;
use crate::cluster::ClusterApi;
use crate::pod;
use crate::queue::RateLimitingQueue;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A pod's reconcile key: `namespace/name`.
fn key_of(pod_obj: &Pod) -> String {
    let ns = pod_obj.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod_obj.metadata.name.as_deref().unwrap_or_default();
    format!("{ns}/{name}")
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// Drives the watch stream and worker pool. Holds the pending-removal stash
/// (keyed pods deleted from the watch stream before a worker could look them
/// up locally) separately from the cache's own known-pod bookkeeping.
pub struct Reconciler {
    cache: Arc<SchedulerCache>,
    cluster: Arc<dyn ClusterApi>,
    queue: Arc<RateLimitingQueue<String>>,
    pending_removal: Mutex<HashMap<String, Pod>>,
}

impl Reconciler {
    pub fn new(cache: Arc<SchedulerCache>, cluster: Arc<dyn ClusterApi>) -> Self {
        Reconciler {
            cache,
            cluster,
            queue: Arc::new(RateLimitingQueue::new()),
            pending_removal: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the watcher task and `worker_count` worker tasks, returning
    /// their join handles. Tasks exit once `token` is cancelled and the
    /// queue drains.
    pub fn spawn(
        self: &Arc<Self>,
        client: Client,
        worker_count: usize,
        token: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(worker_count + 1);

        let watch_self = self.clone();
        let watch_token = token.clone();
        handles.push(tokio::spawn(async move {
            watch_self.run_watcher(client, watch_token).await;
        }));

        for id in 0..worker_count.max(1) {
            let worker_self = self.clone();
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                worker_self.run_worker(id, worker_token).await;
            }));
        }

        handles
    }

    async fn run_watcher(self: Arc<Self>, client: Client, token: CancellationToken) {
        let api: Api<Pod> = Api::all(client);
        let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("pod watcher stopping");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(e)) => warn!(error = %e, "pod watch error, will retry"),
                        None => {
                            info!("pod watch stream ended");
                            break;
                        }
                    }
                }
            }
        }
        self.queue.shut_down().await;
    }

    async fn handle_event(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod_obj) => self.on_add_or_update(pod_obj).await,
            Event::Deleted(pod_obj) => self.on_delete(pod_obj).await,
            Event::Restarted(pods) => {
                for pod_obj in pods {
                    self.on_add_or_update(pod_obj).await;
                }
            }
        }
    }

    /// Enqueues on Add unconditionally for GPU-sharing pods; on Update only
    /// when the transition is meaningful (became assigned, or an assigned
    /// pod became terminal). Since the watcher collapses add/update into a
    /// single `Apply` stream, both cases are handled by the same check: a
    /// pod already known is only re-enqueued if it crossed into assigned or
    /// into terminal; an unknown pod is enqueued iff it's GPU-sharing.
    async fn on_add_or_update(&self, pod_obj: Pod) {
        if !pod::is_sharing_pod(&pod_obj) {
            return;
        }
        let uid = pod_obj.metadata.uid.clone().unwrap_or_default();
        let was_known = self.cache.known(&uid);
        let now_terminal = pod::is_terminal(&pod_obj);

        // Not yet known-assigned: always worth a look, whether this is a
        // fresh Add or an Update that just crossed into a valid device
        // annotation. Already known-assigned: only a transition to terminal
        // matters (frees the device).
        let meaningful = !was_known || now_terminal;
        if meaningful {
            self.queue.add(key_of(&pod_obj)).await;
        }
    }

    async fn on_delete(&self, pod_obj: Pod) {
        if !pod::is_sharing_pod(&pod_obj) {
            return;
        }
        let key = key_of(&pod_obj);
        self.pending_removal.lock().unwrap().insert(key.clone(), pod_obj);
        self.queue.add(key).await;
    }

    async fn run_worker(self: Arc<Self>, id: usize, token: CancellationToken) {
        info!(worker = id, "reconciler worker started");
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(k) => k,
                    None => break,
                },
            };

            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key).await,
                Err(e) => {
                    warn!(key = %key, error = %e, "sync failed, will retry");
                    self.queue.add_rate_limited(key.clone()).await;
                }
            }
            self.queue.done(&key).await;
        }
        info!(worker = id, "reconciler worker stopped");
    }

    /// Per-key reconcile logic: not-found-but-pending-removal drives a
    /// removal from the stashed object; found-and-terminal drives a
    /// removal; found-and-live drives an upsert.
    async fn sync(&self, key: &str) -> Result<(), crate::error::CacheError> {
        let Some((namespace, name)) = split_key(key) else {
            error!(key = %key, "malformed reconcile key, dropping");
            return Ok(());
        };

        match self.cluster.get_pod(namespace, name).await {
            Ok(pod_obj) => {
                if pod::is_terminal(&pod_obj) {
                    self.cache.remove_pod(&pod_obj, self.cluster.as_ref()).await;
                } else {
                    self.cache.add_or_update_pod(pod_obj, self.cluster.as_ref()).await?;
                }
                self.pending_removal.lock().unwrap().remove(key);
                Ok(())
            }
            Err(_) => {
                let stashed = self.pending_removal.lock().unwrap().remove(key);
                if let Some(pod_obj) = stashed {
                    self.cache.remove_pod(&pod_obj, self.cluster.as_ref()).await;
                }
                Ok(())
            }
        }
    }

    /// Exposes the underlying queue handle, e.g. for `/debug/vars` depth
    /// reporting.
    pub fn queue_handle(&self) -> Arc<RateLimitingQueue<String>> {
        self.queue.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterApi;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn sharing_pod(ns: &str, name: &str, uid: &str, mem: &str, device: Option<i32>, phase: &str) -> Pod {
        let mut limits = BTreeMap::new();
        limits.insert(pod::RESOURCE_NAME.to_string(), Quantity(mem.to_string()));
        let mut annotations = BTreeMap::new();
        if let Some(d) = device {
            annotations.insert(pod::ANNOTATION_DEVICE_IDX.to_string(), d.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
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

    #[tokio::test]
    async fn sync_upserts_live_assigned_pod() {
        let fake = Arc::new(FakeClusterApi::new());
        let p = sharing_pod("default", "p1", "uid-1", "1000", Some(0), "Running");
        fake.insert_pod(p.clone());

        let cache = Arc::new(SchedulerCache::new());
        let cluster: Arc<dyn ClusterApi> = fake.clone();
        let rec = Reconciler::new(cache.clone(), cluster);

        rec.sync("default/p1").await.unwrap();
        assert!(cache.known("uid-1"));
    }

    #[tokio::test]
    async fn sync_removes_terminal_pod() {
        let fake = Arc::new(FakeClusterApi::new());
        let p = sharing_pod("default", "p1", "uid-1", "1000", Some(0), "Succeeded");
        fake.insert_pod(p.clone());

        let cache = Arc::new(SchedulerCache::new());
        let cluster: Arc<dyn ClusterApi> = fake.clone();
        let rec = Reconciler::new(cache.clone(), cluster);

        // prime as known via a running copy first
        let mut running = p.clone();
        running.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        cache.add_or_update_pod(running, fake.as_ref()).await.unwrap();
        assert!(cache.known("uid-1"));

        rec.sync("default/p1").await.unwrap();
        assert!(!cache.known("uid-1"));
    }

    #[tokio::test]
    async fn sync_on_missing_pod_drains_pending_removal_stash() {
        let fake = Arc::new(FakeClusterApi::new());
        let cache = Arc::new(SchedulerCache::new());
        let cluster: Arc<dyn ClusterApi> = fake.clone();
        let rec = Reconciler::new(cache.clone(), cluster);

        let mut node_pod = sharing_pod("default", "gone", "uid-9", "2000", Some(0), "Running");
        fake.insert_node(k8s_openapi::api::core::v1::Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::NodeStatus {
                capacity: Some({
                    let mut m = BTreeMap::new();
                    m.insert(pod::RESOURCE_NAME.to_string(), Quantity("8000".into()));
                    m.insert(pod::COUNT_NAME.to_string(), Quantity("1".into()));
                    m
                }),
                allocatable: Some({
                    let mut m = BTreeMap::new();
                    m.insert(format!("{}{}", pod::RESOURCE_STATUS_PREFIX, 0), Quantity("1".into()));
                    m
                }),
                ..Default::default()
            }),
            spec: None,
        });
        fake.insert_pod(node_pod.clone());
        cache.add_or_update_pod(node_pod.clone(), fake.as_ref()).await.unwrap();
        assert!(cache.known("uid-9"));

        // pod is gone from the cluster now
        node_pod.metadata.name = Some("gone".to_string());
        rec.pending_removal
            .lock()
            .unwrap()
            .insert("default/gone".to_string(), node_pod);
        fake.pods.lock().unwrap().remove(&("default".to_string(), "gone".to_string()));

        rec.sync("default/gone").await.unwrap();
        assert!(!cache.known("uid-9"));
    }
}
