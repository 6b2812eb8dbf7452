//! Force Bridge Relayer - Nervos cross-chain transfer relaying
//!
//! This relayer observes bridge events on Nervos and the external chains,
//! records them in a transfer ledger, and (as collector) executes the
//! matching mint or unlock transactions under M-of-N multisig.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod asset;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod ledger;
mod metrics;
mod multisig;
mod role;
mod rpc;
mod signer;
mod supervisor;

use asset::AssetWhitelist;
use chain::{ChainManager, ChainObserver};
use config::Settings;
use coordination::{ActionExecutor, BatchPolicy};
use events::EventClassifier;
use ledger::{MemoryLedger, PostgresLedger, TransferLedger};
use metrics::MetricsServer;
use multisig::{CollectorAuth, MultisigCoordinator, SignerKey};
use signer::SignerService;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Force Bridge Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        role = %settings.relayer.role,
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let ledger = open_ledger(&settings).await?;
    let whitelist = Arc::new(AssetWhitelist::from_settings(&settings)?);
    let strategy = role::strategy_for(settings.relayer.role);

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized");

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let retry_delay = Duration::from_millis(settings.relayer.retry_interval_ms);

    // One supervised observer per chain
    for (name, chain_config) in settings.enabled_chains() {
        let client = chain_manager.client(chain_config.kind)?;
        let classifier = EventClassifier::new(
            chain_config.kind,
            whitelist.clone(),
            chain_config.max_recipient_len,
        );
        let observer = ChainObserver::new(
            client,
            ledger.clone(),
            strategy.clone(),
            classifier,
            chain_config.confirm_number,
            chain_config.batch_size,
        )
        .with_start_block_height(chain_config.start_block_height);

        let supervisor = Supervisor::new(
            format!("observer-{}", name),
            retry_delay,
            Duration::from_millis(chain_config.poll_interval_ms),
        );
        handles.push(tokio::spawn(async move {
            supervisor
                .run(|| {
                    let observer = &observer;
                    async move { observer.tick().await.map(|_| ()) }
                })
                .await
        }));
    }

    if strategy.executes_actions() {
        let executor = build_executor(&settings, ledger.clone(), chain_manager.clone())?;
        let supervisor = Supervisor::new("executor", retry_delay, retry_delay);
        handles.push(tokio::spawn(async move {
            supervisor
                .run(|| {
                    let executor = &executor;
                    async move { executor.tick().await }
                })
                .await
        }));
        info!("Destination executor started");
    }

    let signer = if strategy.serves_signatures() {
        Some(Arc::new(build_signer(
            &settings,
            ledger.clone(),
            whitelist.clone(),
            chain_manager.clone(),
        )?))
    } else {
        None
    };

    // Start API server
    let api_state = api::AppState {
        role: strategy.role(),
        ledger: ledger.clone(),
        chain_manager: chain_manager.clone(),
        signer,
        started_at: Instant::now(),
    };
    handles.push(tokio::spawn({
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, api_state).await {
                error!("API server error: {}", e);
            }
        }
    }));

    // Start metrics server
    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    // Health check loop
    handles.push(tokio::spawn({
        let chain_manager = chain_manager.clone();
        let ledger = ledger.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Chain {} health check failed", chain);
                        healthy = false;
                    }
                }

                if let Err(e) = ledger.health_check().await {
                    warn!("Ledger health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    }));

    info!("Force Bridge Relayer is running as {}", strategy.role());
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    for handle in handles {
        handle.abort();
    }

    info!("Force Bridge Relayer stopped");
    Ok(())
}

async fn open_ledger(settings: &Settings) -> Result<Arc<dyn TransferLedger>> {
    if settings.database.is_memory() {
        warn!("Using in-memory ledger, state is lost on restart");
        return Ok(Arc::new(MemoryLedger::new()));
    }

    let ledger = PostgresLedger::new(&settings.database)
        .await
        .context("connecting to database")?;
    info!("Database connection established");

    ledger.run_migrations().await?;
    info!("Database migrations complete");

    Ok(Arc::new(ledger))
}

fn build_executor(
    settings: &Settings,
    ledger: Arc<dyn TransferLedger>,
    chain_manager: Arc<ChainManager>,
) -> Result<ActionExecutor> {
    let multisig = &settings.multisig;
    let auth = Arc::new(
        CollectorAuth::new(multisig.private_key.as_deref(), &multisig.collector_key_hashes)?
            .with_self_trusted(),
    );
    if let Some(address) = auth.address() {
        info!("Collector address {:?}", address);
    }

    let mut coordinators = Vec::new();
    for chain in chain_manager.chains() {
        if chain_manager.builder(chain).is_err() {
            warn!(chain = %chain, "No transaction builder, skipping execution");
            continue;
        }
        coordinators.push(MultisigCoordinator::from_config(chain, multisig, auth.clone())?);
    }

    let collector = &settings.collector;
    Ok(ActionExecutor::new(
        ledger,
        chain_manager,
        coordinators,
        BatchPolicy::from_config(collector, settings.relayer.network),
    )
    .with_owner_lock_hash(collector.owner_lock_hash.clone())
    .with_commit_wait(
        Duration::from_secs(collector.commit_timeout_secs),
        Duration::from_millis(collector.status_poll_interval_ms),
    ))
}

fn build_signer(
    settings: &Settings,
    ledger: Arc<dyn TransferLedger>,
    whitelist: Arc<AssetWhitelist>,
    chain_manager: Arc<ChainManager>,
) -> Result<SignerService> {
    let multisig = &settings.multisig;
    let private_key = multisig
        .private_key
        .as_deref()
        .context("verifier role requires multisig.private_key")?;

    let key = SignerKey::from_private_key(private_key)?;
    info!("Signing as {:?}", key.address());

    let auth = CollectorAuth::new(None, &multisig.collector_key_hashes)?;
    Ok(SignerService::new(ledger, whitelist, chain_manager, auth, key))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,force_bridge_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
