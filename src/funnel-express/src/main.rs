//! Funnel Express — purchase-funnel tracking service.
//!
//! Main entry point that wires the stores and engines and starts the server.

use clap::Parser;
use funnel_api::{ApiServer, AppState};
use funnel_core::config::{AppConfig, StorageBackend};
use funnel_engine::{
    ActionCatalog, ActionDispatcher, BackgroundTasks, FunnelService, HttpPaymentGateway, HttpTransport,
    ScrubEngine, TemplateResolver, TransactionStore,
};
use funnel_store::{MemoryStore, RedisStore, SharedStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-express")]
#[command(about = "Purchase-funnel tracking: scrub routing and conversion action dispatch")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "FUNNEL_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "FUNNEL_EXPRESS__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Keep all state in process memory instead of Redis
    #[arg(long, default_value_t = false)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_express=info,funnel_engine=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Funnel Express starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if cli.memory_store {
        config.storage.backend = StorageBackend::Memory;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    // Durable store shared by transaction state and site config
    let mut memory = None;
    let store: SharedStore = match config.storage.backend {
        StorageBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
        StorageBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            let store = Arc::new(MemoryStore::new());
            memory = Some(store.clone());
            store
        }
    };

    let tasks = Arc::new(BackgroundTasks::new());
    let states = Arc::new(TransactionStore::new(
        store.clone(),
        Duration::from_secs(config.storage.state_ttl_secs),
    ));
    let catalog = Arc::new(ActionCatalog::new(
        store.clone(),
        Duration::from_secs(config.catalog.cache_ttl_secs),
        config.catalog.max_entries,
    ));

    let action_timeout = Duration::from_millis(config.dispatch.action_timeout_ms);
    let dispatcher = Arc::new(ActionDispatcher::new(
        states.clone(),
        catalog.clone(),
        TemplateResolver::new(config.dispatch.optional_fields.iter()),
        Arc::new(HttpTransport::new(action_timeout)?),
        tasks.clone(),
        &config.secrets,
        action_timeout,
    ));
    let gateway = Arc::new(HttpPaymentGateway::new(
        config.gateway.endpoint.clone(),
        Duration::from_millis(config.gateway.timeout_ms),
    )?);

    let scrub = Arc::new(ScrubEngine::new(
        store,
        states.clone(),
        config.scrub.clone(),
        tasks.clone(),
    ));
    let funnel = Arc::new(FunnelService::new(states, dispatcher, gateway));

    let api_server = ApiServer::new(
        config.clone(),
        AppState {
            scrub,
            funnel,
            catalog: catalog.clone(),
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        },
    );

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Catalog cache maintenance
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let swept = catalog.sweep();
            let purged = memory.as_ref().map_or(0, |m| m.purge_expired());
            if swept + purged > 0 {
                info!(swept, purged, "Maintenance pass");
            }
        }
    });

    info!("Funnel Express is ready to serve traffic");

    api_server
        .start_http(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!(pending = tasks.pending(), "Draining background tasks");
    tasks.drain().await;

    Ok(())
}
