//! Points Relayer - durable contract invocation and cross-chain token sync
//!
//! This relayer drives persisted workflows forward on fixed intervals: opaque
//! contract calls submitted until mined, newly created tokens registered on a
//! second chain through the cross-chain indexing protocol, and daily points
//! settled in bounded batches.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod settlement;
mod state;
mod tx;
mod workflow;

use chain::{ChainManager, TokenCreatedListener};
use config::Settings;
use coordination::{CoordinationEngine, SettlementJob, TokenSyncJob};
use events::EventBus;
use metrics::MetricsServer;
use settlement::SettlementAggregator;
use state::{StateManager, WorkflowLocks, WorkflowStore};
use tx::{TransactionSender, TransactionSigner};
use workflow::{ContractInvoker, TokenSyncer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Points Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");
    let store: Arc<dyn WorkflowStore> = state_manager.clone();

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Chain clients and signing keys
    let chain_manager = Arc::new(ChainManager::new(&settings)?);
    let signer = Arc::new(TransactionSigner::from_settings(&settings)?);
    let tx_sender = Arc::new(TransactionSender::new(chain_manager.clone(), signer));
    info!("Chain connections initialized");

    // Workflow event projection
    let events = EventBus::new(1024);
    let projection_handle = tokio::spawn(events::run_projection(events.subscribe()));

    let locks = Arc::new(WorkflowLocks::new());
    let invoker = Arc::new(ContractInvoker::new(
        store.clone(),
        locks.clone(),
        chain_manager.clone(),
        tx_sender.clone(),
        events.clone(),
        settings.scheduler.max_retry_count,
    ));

    let mut engine = CoordinationEngine::new(
        store.clone(),
        locks.clone(),
        invoker.clone(),
        settings.scheduler.clone(),
    );

    if settings.token_sync.enabled {
        let syncer = Arc::new(TokenSyncer::new(
            store.clone(),
            locks.clone(),
            chain_manager.clone(),
            tx_sender.clone(),
            events.clone(),
            &settings.token_sync,
        ));
        let listener = Arc::new(TokenCreatedListener::new(
            chain_manager.clone(),
            store.clone(),
            syncer.clone(),
            settings.token_sync.start_height,
            settings.token_sync.search_window,
        ));
        info!(
            "Token sync enabled: {} -> {}",
            settings.token_sync.source_chain_id, settings.token_sync.target_chain_id
        );
        engine = engine.with_token_sync(TokenSyncJob { syncer, listener });
    }

    if settings.settlement.enabled {
        let aggregator = Arc::new(SettlementAggregator::new(
            state_manager.clone(),
            invoker.clone(),
            chain_manager.clone(),
            store.clone(),
            settings.settlement.clone(),
            settings.relayer.instance_id.clone(),
        ));
        info!("Settlement enabled on chain {}", settings.settlement.chain_id);
        engine = engine.with_settlement(SettlementJob {
            aggregator,
            interval: tokio::time::Duration::from_secs(settings.settlement.interval_secs),
            lookback_days: settings.settlement.lookback_days,
        });
    }

    let coordination_engine = Arc::new(engine);
    info!("Coordination engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            store: store.clone(),
            chain_manager: chain_manager.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = coordination_engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;

                // Check chain connections
                for (chain_id, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                // Check database connection
                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Points Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Loops stop at the next tick boundary; in-flight advancements finish
    coordination_engine.stop();
    if let Err(e) = coordination_handle.await {
        error!("Coordination engine task failed: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    projection_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Points Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,points_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
