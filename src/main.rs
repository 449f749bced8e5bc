//! # Fleet - multi-cluster reconciliation demo
//!
//! Creates one in-memory cluster per `--clusters` entry, seeds each with pods,
//! and runs a single controller that watches pods in all of them. Every
//! reconcile reads the pod through the request's cluster client and logs it.
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - CLI flags layered over an optional config file
//! 2. **Clusters** - Create and seed the in-memory clusters
//! 3. **Controller** - Register a pod watch on every cluster
//! 4. **Manager** - Start and sync the caches, then run the workers
//!
//! ## Shutdown
//!
//! The run token is cancelled after `--run-for` seconds or on Ctrl-C.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod pods;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_cluster::{CacheOptions, Cluster, ClusterOptions, InMemoryCluster};
use fleet_core::{DynamicObject, LabelSelector, ResultExt};
use fleet_reconciler::{Controller, ControllerConfig, Manager, WatchOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;
use crate::pods::{PodReconciler, pod_kind};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    info!(
        clusters = ?cli.clusters,
        workers = config.max_concurrent_reconciles,
        jitter_ms = config.jitter_period.as_millis(),
        "Fleet starting"
    );

    let token = CancellationToken::new();
    let clusters = init_clusters(&cli).await?;

    let mut controller =
        Controller::new("pods", Arc::new(PodReconciler), config.to_options("pods"))
            .context("Failed to create controller")?;
    let options = watch_options(&cli)?;
    for cluster in &clusters {
        controller
            .watch_resource_reconcile_object(&token, cluster.clone(), &pod_kind(), options.clone())
            .await
            .with_context(|| format!("Failed to watch pods in cluster '{}'", cluster.name()))?;
    }

    let mut manager = Manager::new();
    manager.add(controller);

    spawn_churn(clusters, token.clone());
    spawn_shutdown(Duration::from_secs(cli.run_for), token.clone());

    manager.start(token).await.context("Manager failed")?;
    info!("Fleet stopped");
    Ok(())
}

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// The config file (or defaults), with CLI overrides applied.
fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.max_concurrent_reconciles = workers;
    }
    if let Some(jitter_ms) = cli.jitter_ms {
        config.jitter_period = Duration::from_millis(jitter_ms);
    }
    config.validate().context("Invalid controller configuration")?;
    Ok(config)
}

fn watch_options(cli: &Cli) -> Result<WatchOptions> {
    let options = WatchOptions::new().namespace(cli.namespace.clone());
    match &cli.selector {
        Some(selector) => {
            let selector = LabelSelector::parse(selector).context("Invalid --selector")?;
            Ok(options.label_selector(selector))
        }
        None => Ok(options),
    }
}

/// Create one cluster per name and seed it with pods.
async fn init_clusters(cli: &Cli) -> Result<Vec<Arc<InMemoryCluster>>> {
    let resync = (cli.resync_secs > 0).then(|| Duration::from_secs(cli.resync_secs));
    let mut clusters = Vec::with_capacity(cli.clusters.len());

    for name in &cli.clusters {
        let cluster = Arc::new(InMemoryCluster::new(
            name.clone(),
            ClusterOptions {
                cache: CacheOptions {
                    resync,
                    namespace: None,
                },
            },
        ));
        let client = cluster
            .client()
            .with_context(|| format!("No client for cluster '{name}'"))?;
        for i in 0..cli.pods {
            let pod = DynamicObject::new(pod_kind(), cli.namespace.clone(), format!("pod-{i}"))
                .with_label("app", if i % 2 == 0 { "web" } else { "worker" })
                .with_data(serde_json::json!({ "image": "nginx:1.27" }));
            client
                .create(pod)
                .await
                .with_context(|| format!("Failed to seed cluster '{name}'"))?;
        }
        info!(cluster = %name, pods = cli.pods, "Cluster ready");
        clusters.push(cluster);
    }
    Ok(clusters)
}

/// Bump every pod's image once a second so the controller sees updates.
fn spawn_churn(clusters: Vec<Arc<InMemoryCluster>>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut round = 0u64;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            round = round.saturating_add(1);
            for cluster in &clusters {
                let Some(client) = cluster.client().into_option_logged() else {
                    continue;
                };
                let pods = client.list(&pod_kind(), None).await.or_default_logged(Vec::new());
                for pod in pods {
                    let image = format!("nginx:1.27-r{round}");
                    let bumped = pod.with_data(serde_json::json!({ "image": image }));
                    if let Err(e) = client.update(bumped).await {
                        warn!(cluster = %cluster.name(), error = %e, "Pod update failed");
                    }
                }
            }
        }
    });
}

/// Cancel `token` after `after`, or earlier on Ctrl-C.
fn spawn_shutdown(after: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            () = tokio::time::sleep(after) => info!("Run time elapsed, shutting down"),
            () = interrupted => info!("Interrupted, shutting down"),
        }
        token.cancel();
    });
}
