//! modelplane daemon
//!
//! Runs one node of the model hosting control plane: the lifecycle manager,
//! the worker node router, auto-reload recovery and the REST API.

use anyhow::Context;
use clap::Parser;
use modelplane_api::create_router;
use modelplane_core::DaemonConfig;
use modelplane_network::{ClusterMembership, HttpNodeDispatcher, NodeBalancer, StaticMembership};
use modelplane_runtime::{DefaultPredictorFactory, ProcessRuntimeConfig};
use modelplane_scheduler::{
    AutoReloader, CircuitBreakerService, ModelCache, ModelManager, WorkerNodeRouter,
};
use modelplane_store::{MemoryStore, ModelRepository};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// modelplane daemon - control plane node for cluster-wide model hosting
#[derive(Parser, Debug)]
#[command(name = "modelplaned")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Stable node id
    #[arg(long)]
    node_id: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Skip re-deploying models hosted before a restart
    #[arg(long)]
    no_auto_reload: bool,
}

impl Args {
    /// Load the file configuration and apply flag overrides
    fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(address) = &self.address {
            config.api.rest_address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.rest_port = port;
        }
        if let Some(node_id) = &self.node_id {
            config.node.id = node_id.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.no_auto_reload {
            config.recovery.enabled = false;
        }
        Ok(config)
    }
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);
    if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("failed to set subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging.level, &config.logging.format)?;

    info!("Starting modelplane daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(node_id = %config.node.id, roles = ?config.node.roles, peers = config.node.peers.len(), "Node identity");

    let repo = ModelRepository::new(Arc::new(MemoryStore::new()));
    let cache = Arc::new(ModelCache::new(config.monitoring.max_samples));

    let membership = Arc::new(StaticMembership::from_config(&config.node));
    let router = Arc::new(WorkerNodeRouter::new(
        cache.clone(),
        membership.clone(),
        NodeBalancer::default(),
        config.lifecycle.only_run_on_model_nodes,
    ));
    // Subscribe before spawning so no membership event is missed
    let events = membership.subscribe();
    tokio::spawn(router.clone().run(events));

    let factory = Arc::new(DefaultPredictorFactory::new(ProcessRuntimeConfig::from(
        &config.runtime,
    )));
    let breakers = Arc::new(CircuitBreakerService::new(&config.circuit_breaker));
    let dispatcher = Arc::new(HttpNodeDispatcher::new(&config.node.peers));

    let manager = Arc::new(
        ModelManager::new(
            config.lifecycle.clone(),
            repo,
            cache,
            router,
            factory,
            breakers,
        )
        .with_dispatcher(dispatcher),
    );

    let reloader = Arc::new(AutoReloader::new(
        manager.clone(),
        &config.recovery,
        config.lifecycle.only_run_on_model_nodes,
    ));
    reloader.spawn();

    let mut app = create_router(manager);
    if config.api.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .context("invalid API address")?;
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("modelplane daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
