//! HTLC Coordinator - atomic swaps between a permissioned ledger and an EVM chain
//!
//! The coordinator watches hashed-timelock escrows on both chains and drives
//! each negotiated swap to completion: lock, reveal, release, or revert on
//! expiry.

use anyhow::Result;
use ethers::signers::LocalWallet;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

use htlc_coordinator::api::{self, AppState};
use htlc_coordinator::chain::ChainManager;
use htlc_coordinator::config::{ChainBackend, Settings};
use htlc_coordinator::escrow::load_wallet;
use htlc_coordinator::identity::IdentityAuthorizer;
use htlc_coordinator::metrics::{self, MetricsServer};
use htlc_coordinator::settlement::LoggingSettlementRecorder;
use htlc_coordinator::state;
use htlc_coordinator::swap::SwapCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting HTLC Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize swap store
    let store = state::open(&settings.database).await?;
    info!("Swap store ready ({:?})", settings.database.backend);

    // Signing wallet; memory-only setups run with a throwaway key
    let needs_wallet = settings
        .enabled_chains()
        .iter()
        .any(|(_, c)| c.backend == ChainBackend::Rpc);
    let wallet = match load_wallet(&settings.wallet.private_key_env) {
        Ok(wallet) => Some(wallet),
        Err(e) if needs_wallet => return Err(e.into()),
        Err(_) => {
            warn!("No wallet configured, using an ephemeral signing key");
            None
        }
    };
    let signer = wallet
        .clone()
        .unwrap_or_else(|| LocalWallet::new(&mut ethers::core::rand::thread_rng()));

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::from_settings(&settings, store.clone(), wallet).await?);
    info!("Chain connections initialized");

    let authorizer: Arc<IdentityAuthorizer> = Arc::new(chain_manager.authorizer(signer));

    // Initialize swap coordinator
    let coordinator = Arc::new(SwapCoordinator::new(
        chain_manager.clone(),
        authorizer,
        store.clone(),
        Arc::new(LoggingSettlementRecorder),
        settings.coordinator.clone(),
        settings.swap.clone(),
    ));
    coordinator.resume().await?;
    info!("Swap coordinator initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            store: store.clone(),
            chain_manager: chain_manager.clone(),
            coordinator: coordinator.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start escrow watchers
    let watcher_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move {
            if let Err(e) = chain_manager.start_watchers().await {
                error!("Escrow watcher error: {}", e);
            }
        }
    });

    // Produce blocks on in-process chains
    let producer_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let settings = settings.clone();
        async move {
            chain_manager.run_block_producers(&settings).await;
        }
    });

    // Start swap coordinator
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Swap coordinator error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                // Check chain connections
                let health = chain_manager.health_check().await;
                let mut healthy = true;
                for (chain_id, ok) in health {
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                // Check store connection
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }

                metrics::record_health_check(healthy);
            }
        }
    });

    info!("HTLC Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    coordinator.stop().await;
    chain_manager.stop().await;

    // Abort background tasks
    api_handle.abort();
    watcher_handle.abort();
    producer_handle.abort();
    coordinator_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,htlc_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
