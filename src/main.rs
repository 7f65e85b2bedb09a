use anyhow::Context;
use gpushare_scheduler_extender::cache::SchedulerCache;
use gpushare_scheduler_extender::cluster::{ClusterApi, KubeClusterApi};
use gpushare_scheduler_extender::config::Config;
use gpushare_scheduler_extender::handlers::AppState;
use gpushare_scheduler_extender::http::{router, ReadinessGate};
use gpushare_scheduler_extender::reconciler::Reconciler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(port = config.port, threadness = config.threadness, "starting gpushare-scheduler-extender");

    let client = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path).context("reading kubeconfig")?;
            let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                .await
                .context("building client config from kubeconfig")?;
            kube::Client::try_from(client_config).context("building kube client")?
        }
        None => kube::Client::try_default().await.context("building default kube client")?,
    };

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let cache = Arc::new(SchedulerCache::new());

    info!("building initial scheduler cache from cluster snapshot");
    cache.build(cluster.as_ref()).await.context("building scheduler cache")?;

    let readiness = Arc::new(ReadinessGate::default());
    readiness.mark_ready();

    let reconciler = Arc::new(Reconciler::new(cache.clone(), cluster.clone()));
    let shutdown = CancellationToken::new();
    let worker_handles = reconciler.spawn(client, config.threadness, shutdown.clone());
    let queue_handle = reconciler.queue_handle();

    let app_state = AppState { cache, cluster };
    let app = router(app_state, readiness, move || queue_handle.depth());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("binding HTTP listener")?;
    info!(port = config.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
