//! EcoCup Ledger Service
//!
//! Main entry point for the wallet and settlement ledger.
//! This service provides:
//! - JSON HTTP API for wallets, escrow, partners, settlements and payments
//! - Background settlement scheduler
//! - Notification dispatcher for ledger events

use anyhow::Context;
use ecocup_ledger::api::build_router;
use ecocup_ledger::config::{AppConfig, StoreBackend};
use ecocup_ledger::database::connect_and_migrate;
use ecocup_ledger::error::{AppError, AppResult};
use ecocup_ledger::notifications::run_dispatcher;
use ecocup_ledger::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use ecocup_ledger::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "ecocup_ledger={},sqlx=warn,tower_http=info",
            config.log_level
        )
        .into()
    });

    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(config: &AppConfig) -> AppResult<Arc<dyn LedgerStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            info!("Connecting to database and applying migrations...");
            let pool = connect_and_migrate(&config.database)
                .await
                .map_err(AppError::Database)
                .map_err(|e| {
                    if e.is_connection_error() {
                        error!("Database unreachable, check DATABASE_URL: {}", e);
                    } else {
                        error!("Database setup failed: {}", e);
                    }
                    e
                })?;
            info!(
                "✓ Postgres ledger store ready (max {} connections)",
                config.database.max_connections
            );

            Ok(Arc::new(PgLedgerStore::new(pool)))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory ledger store; balances are lost on restart");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
    }
}

async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server failed")
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load environment variables first
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        AppError::Config(e)
    })?;

    init_tracing(&config);

    info!("EcoCup ledger starting");
    info!("Environment: {}", config.environment);
    info!("Log level: {}", config.log_level);
    info!("Store backend: {:?}", config.store_backend);

    let store = open_store(&config).await?;
    let state = AppState::new(store, config.ledger.clone());
    info!(
        "✓ Ledger services initialized ({} admins allowlisted)",
        config.ledger.admin_ids.len()
    );

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================
    let dispatcher_handle = tokio::spawn(run_dispatcher(state.events.subscribe()));
    info!("✓ Notification dispatcher started");

    let scheduler_handle = if config.ledger.settlement_scheduler_enabled {
        let scheduler = state.settlement_scheduler();
        info!(
            "✓ Settlement scheduler started ({}s interval)",
            config.ledger.settlement_interval_secs
        );
        Some(tokio::spawn(scheduler.start()))
    } else {
        warn!("SETTLEMENT_SCHEDULER_ENABLED is false - batches are only opened on request");
        None
    };

    // =========================================================================
    // HTTP SERVER
    // =========================================================================
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("✓ HTTP API listening on {}", addr);

    let server_handle = tokio::spawn(serve(listener, state));

    info!("Press Ctrl+C to shutdown gracefully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down gracefully...");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("{:#}", e),
                _ => error!("HTTP server exited unexpectedly"),
            }
        }
        _ = dispatcher_handle => {
            error!("Notification dispatcher exited unexpectedly");
        }
        _ = async {
            if let Some(handle) = scheduler_handle {
                handle.await.ok();
            } else {
                // Never completes if the scheduler is not running
                futures::future::pending::<()>().await;
            }
        } => {
            error!("Settlement scheduler exited unexpectedly");
        }
    }

    info!("EcoCup ledger shutdown complete");
    Ok(())
}
