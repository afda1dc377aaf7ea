//! BitMor reconciliation server
//!
//! Polls the lending-pool contract, reconciles the off-chain ledger with it
//! and serves a small operational HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use bitmor_server::chain::{ChainClient, JsonRpcChainClient};
use bitmor_server::config::Config;
use bitmor_server::db;
use bitmor_server::indexer::{LoanMonitor, ReconciliationService};
use bitmor_server::routes;
use bitmor_server::state::AppState;
use bitmor_server::store::{LedgerStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        contract = %config.indexer.contract_address,
        "Starting BitMor reconciliation server"
    );

    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;
    db::check_health(&pool).await?;

    let store: Arc<dyn LedgerStore> = Arc::new(PgStore::new(pool, config.store_timeout));
    tracing::info!(store = store.backend().label(), "Ledger store ready");
    let chain: Arc<dyn ChainClient> = Arc::new(JsonRpcChainClient::new(
        config.rpc_url.clone(),
        config.indexer.contract_address.clone(),
        config.rpc_timeout,
    ));

    let reconciler = Arc::new(ReconciliationService::new(
        store.clone(),
        chain,
        config.indexer.clone(),
    ));
    let monitor = Arc::new(LoanMonitor::new(
        store.clone(),
        config.monitor.clone(),
        reconciler.write_gate(),
    ));

    let reconciler_task = reconciler.clone();
    tokio::spawn(async move {
        reconciler_task.start().await;
        tracing::error!("Reconciliation task exited unexpectedly");
    });

    tokio::spawn(async move {
        monitor.start().await;
        tracing::error!("Loan monitor task exited unexpectedly");
    });

    let app = routes::router(AppState::new(store, reconciler));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Health check at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
