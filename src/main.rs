//! ledger_saga service
//!
//! Usage: `ledger_saga [--env dev]` reads `config/<env>.yaml`.
//!
//! Startup order: config, logging, PostgreSQL (+ migrations), Redis,
//! saga wiring, recovery worker, HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use ledger_saga::config::AppConfig;
use ledger_saga::db::Database;
use ledger_saga::ledger::PgLedgerRepository;
use ledger_saga::mutex::{DistributedMutex, RedisLockStore};
use ledger_saga::transfer::{AppState, PgSagaStore, RecoveryWorker, TransferSaga, router};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = ledger_saga::logging::init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting ledger_saga in {} mode",
        env
    );

    let saga_config = app_config.transfer.saga_config()?;

    let db = Database::connect(&app_config.postgres_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to apply migrations")?;

    let locks = RedisLockStore::connect(&app_config.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    let saga = Arc::new(TransferSaga::new(
        Arc::new(PgSagaStore::new(db.pool().clone())),
        Arc::new(PgLedgerRepository::new(db.pool().clone())),
        DistributedMutex::new(Arc::new(locks.clone())),
        saga_config,
    ));

    let worker = RecoveryWorker::new(saga.clone(), app_config.transfer.recovery.worker_config());
    let worker_handle = tokio::spawn(async move { worker.run().await });

    let state = AppState::new(
        saga,
        Duration::from_secs(app_config.server.request_timeout_secs),
    )
    .with_database(db)
    .with_lock_store(locks);
    let app = router(Arc::new(state));

    let addr = app_config.server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    worker_handle.abort();
    tracing::info!("ledger_saga stopped");
    Ok(())
}
