//! axum router and JSON wire envelopes for the extender protocol.

use crate::handlers::{bind, filter, inspect, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{NodeList, Pod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flipped once after the initial `SchedulerCache::build()` completes; gates
/// `/healthz`.
#[derive(Default)]
pub struct ReadinessGate(AtomicBool);

impl ReadinessGate {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
struct RouterState {
    app: AppState,
    readiness: Arc<ReadinessGate>,
    queue_depth: Arc<dyn Fn() -> usize + Send + Sync>,
}

#[derive(Deserialize)]
pub struct FilterRequest {
    #[serde(rename = "Pod")]
    pub pod: Pod,
    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,
    /// Alternate candidate-node input: a full `NodeList`, used by callers
    /// that pass the extender `args.Nodes` shape instead of bare names.
    /// Only consulted when `node_names` is absent.
    #[serde(rename = "Nodes", default)]
    pub nodes: Option<NodeList>,
}

#[derive(Serialize)]
pub struct FilterResponse {
    #[serde(rename = "NodeNames")]
    pub node_names: Vec<String>,
    /// The admitted `Node` objects, mirroring `node_names`, for callers
    /// configured to read `Nodes` from the response instead.
    #[serde(rename = "Nodes")]
    pub nodes: Option<NodeList>,
    #[serde(rename = "FailedNodes")]
    pub failed_nodes: HashMap<String, String>,
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Deserialize)]
pub struct BindRequestBody {
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "PodNamespace")]
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    #[serde(rename = "Node")]
    pub node: String,
}

#[derive(Serialize)]
pub struct BindResponse {
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Serialize)]
pub struct InspectPodView {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "usedGPU")]
    pub used_gpu: i64,
}

#[derive(Serialize)]
pub struct InspectDeviceView {
    pub id: i32,
    #[serde(rename = "totalGPU")]
    pub total_gpu: i64,
    #[serde(rename = "usedGPU")]
    pub used_gpu: i64,
    pub pods: Vec<InspectPodView>,
}

#[derive(Serialize)]
pub struct InspectNodeView {
    pub name: String,
    #[serde(rename = "totalGPU")]
    pub total_gpu: i64,
    #[serde(rename = "usedGPU")]
    pub used_gpu: i64,
    pub devs: Vec<InspectDeviceView>,
}

#[derive(Serialize, Default)]
pub struct InspectResponse {
    pub nodes: Vec<InspectNodeView>,
    pub error: Option<String>,
}

fn to_view(n: inspect::NodeUsage) -> InspectNodeView {
    InspectNodeView {
        name: n.name,
        total_gpu: n.total_memory,
        used_gpu: n.used_memory,
        devs: n
            .devices
            .into_iter()
            .map(|d| InspectDeviceView {
                id: d.id,
                total_gpu: d.total_memory,
                used_gpu: d.used_memory,
                pods: d
                    .pods
                    .into_iter()
                    .map(|p| InspectPodView {
                        name: p.name,
                        namespace: p.namespace,
                        used_gpu: p.used_memory,
                    })
                    .collect(),
            })
            .collect(),
    }
}

async fn handle_filter(State(state): State<RouterState>, Json(req): Json<FilterRequest>) -> Json<FilterResponse> {
    let candidates = req.node_names.unwrap_or_else(|| {
        req.nodes
            .map(|list| list.items.into_iter().filter_map(|n| n.metadata.name).collect())
            .unwrap_or_default()
    });
    let outcome = filter::filter(&state.app, &req.pod, &candidates).await;
    let nodes = NodeList {
        items: outcome.nodes,
        ..Default::default()
    };
    Json(FilterResponse {
        node_names: outcome.node_names,
        nodes: Some(nodes),
        failed_nodes: outcome.failed_nodes,
        error: String::new(),
    })
}

async fn handle_bind(State(state): State<RouterState>, Json(req): Json<BindRequestBody>) -> Json<BindResponse> {
    let bind_req = bind::BindRequest {
        pod_name: req.pod_name,
        pod_namespace: req.pod_namespace,
        pod_uid: req.pod_uid,
        node: req.node,
    };
    match bind::bind(&state.app, &bind_req).await {
        Ok(_) => Json(BindResponse { error: String::new() }),
        Err(e) => Json(BindResponse { error: e.to_string() }),
    }
}

async fn handle_inspect_node(State(state): State<RouterState>, Path(name): Path<String>) -> Json<InspectResponse> {
    match inspect::inspect_node(&state.app, &name).await {
        Ok(usage) => Json(InspectResponse {
            nodes: vec![to_view(usage)],
            error: None,
        }),
        Err(e) => Json(InspectResponse {
            nodes: vec![],
            error: Some(e.to_string()),
        }),
    }
}

async fn handle_inspect_all(State(state): State<RouterState>) -> Json<InspectResponse> {
    let nodes = inspect::inspect_all(&state.app).await.into_iter().map(to_view).collect();
    Json(InspectResponse { nodes, error: None })
}

async fn handle_version() -> String {
    format!("gpushare-scheduler-extender {VERSION}")
}

async fn handle_healthz(State(state): State<RouterState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[derive(Serialize)]
struct DebugVars {
    queue_depth: usize,
    node_count: usize,
}

async fn handle_debug_vars(State(state): State<RouterState>) -> Json<DebugVars> {
    Json(DebugVars {
        queue_depth: (state.queue_depth)(),
        node_count: state.app.cache.nodes().len(),
    })
}

/// Builds the router. `queue_depth_fn` is sampled once per `/debug/vars`
/// request, matching how the reconciler's queue handle is threaded through
/// from `main`.
pub fn router(
    app: AppState,
    readiness: Arc<ReadinessGate>,
    queue_depth_fn: impl Fn() -> usize + Send + Sync + 'static,
) -> Router {
    let state = RouterState {
        app,
        readiness,
        queue_depth: Arc::new(queue_depth_fn),
    };

    Router::new()
        .route("/gpushare-scheduler/filter", post(handle_filter))
        .route("/gpushare-scheduler/bind", post(handle_bind))
        .route("/gpushare-scheduler/inspect/:nodename", get(handle_inspect_node))
        .route("/gpushare-scheduler/inspect", get(handle_inspect_all))
        .route("/version", get(handle_version))
        .route("/healthz", get(handle_healthz))
        .route("/debug/vars", get(handle_debug_vars))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
