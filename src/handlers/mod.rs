//! Stateless glue translating the extender's HTTP envelopes into cache
//! calls and back. Handlers never panic; every fallible path collapses
//! into [`crate::error::ExtenderError`].

pub mod bind;
pub mod filter;
pub mod inspect;

use crate::cache::SchedulerCache;
use crate::cluster::ClusterApi;
use std::sync::Arc;

/// Shared state reachable from every handler: the cache and the cluster
/// boundary it was built against.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SchedulerCache>,
    pub cluster: Arc<dyn ClusterApi>,
}
