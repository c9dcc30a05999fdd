//! Wallet ledger service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐    ┌───────────┐
//! │  HTTP    │───▶│ Orchestrator │───▶│  Wallet  │───▶│ Provider  │
//! │  (axum)  │    │ limits/risk  │    │  debit   │    │ adapters  │
//! └──────────┘    └──────────────┘    └──────────┘    └───────────┘
//!                        ▲                                  │
//!                        └──── Reconciliation worker ◀──────┘
//! ```
//!
//! Usage: `wallet_ledger [--env <name>] [--config <path>]`

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use wallet_ledger::audit::PgAuditSink;
use wallet_ledger::config::AppConfig;
use wallet_ledger::db::Database;
use wallet_ledger::limits::PgLimitStore;
use wallet_ledger::logging::init_logging;
use wallet_ledger::notify::{Notifier, TracingNotifier};
use wallet_ledger::providers::ProviderRegistry;
use wallet_ledger::risk::RiskScorer;
use wallet_ledger::transfer::api::{AppState, router};
use wallet_ledger::transfer::{
    AdminService, LedgerStores, PgTransactionStore, ReconciliationWorker, TransferOrchestrator,
};
use wallet_ledger::wallet::PgWalletStore;

fn arg_value(flags: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| flags.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1).cloned())
}

async fn build_stores(config: &AppConfig) -> anyhow::Result<(LedgerStores, Option<Database>)> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("No database configured; using in-memory stores, nothing survives a restart");
        return Ok((LedgerStores::in_memory(), None));
    };

    let db = Database::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    if config.database.apply_schema {
        db.apply_schema().await.context("failed to apply schema")?;
    }
    let pool = db.pool().clone();
    let stores = LedgerStores {
        wallets: Arc::new(PgWalletStore::new(pool.clone())),
        transactions: Arc::new(PgTransactionStore::new(pool.clone())),
        limits: Arc::new(PgLimitStore::new(pool.clone())),
        audit: Arc::new(PgAuditSink::new(pool)),
    };
    Ok((stores, Some(db)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match arg_value(&["--config", "-c"]) {
        Some(path) => AppConfig::load_from_path(&path),
        None => AppConfig::load(&arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".into())),
    }
    .context("failed to load configuration")?;

    let _log_guard = init_logging(&config.log);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        revision = env!("LEDGER_GIT_REVISION"),
        "Wallet ledger starting"
    );

    let (stores, database) = build_stores(&config).await?;
    let day_offset = config.engine.day_offset();

    let registry = ProviderRegistry::from_config(
        &config.providers,
        stores.wallets.clone(),
        config.engine.provider_timeout(),
        day_offset,
    )?;
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let orchestrator = Arc::new(TransferOrchestrator::new(
        stores.clone(),
        registry.clone(),
        RiskScorer::new(config.risk.clone(), day_offset),
        notifier.clone(),
        config.engine.clone(),
    ));
    let worker = Arc::new(ReconciliationWorker::new(
        stores.clone(),
        registry,
        notifier,
        config.reconciliation.clone(),
        config.engine.provider_timeout(),
    ));
    let admin = Arc::new(AdminService::new(stores));

    if config.reconciliation.enabled {
        let background = worker.clone();
        tokio::spawn(async move {
            background.run().await;
        });
    } else {
        warn!("Reconciliation worker disabled; pending transactions need manual resolution");
    }

    let app = router(Arc::new(AppState {
        orchestrator,
        worker,
        admin,
        database,
    }));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "HTTP server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await
    {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Wallet ledger stopped");
    Ok(())
}
