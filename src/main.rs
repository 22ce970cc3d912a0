use std::sync::Arc;

use anyhow::Context;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};

use lot_ledger as ledger;
use ledger::clock::{Clock, SystemClock};
use ledger::services::{EngineSettings, InventoryServices};
use ledger::store::{LedgerStore, SeaOrmStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ledger::config::load_config().context("failed to load configuration")?;
    ledger::config::init_tracing(cfg.log_level(), cfg.log_json);
    info!(environment = %cfg.environment, "Starting lot ledger");

    let db_pool = ledger::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        ledger::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity.max(1));
    let event_sender = ledger::events::EventSender::new(event_tx);
    let event_task = tokio::spawn(ledger::events::process_events(event_rx));

    let store: Arc<dyn LedgerStore> = Arc::new(SeaOrmStore::new(Arc::new(db_pool)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = InventoryServices::new(
        store,
        clock.clone(),
        event_sender,
        EngineSettings::from(&cfg),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(services.expiry_sweeper(
        clock,
        cfg.lot_sweep_interval(),
        cfg.reservation_sweep_interval(),
    ));
    let sweeper_task = sweeper.spawn(shutdown_rx);

    shutdown_signal().await;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("Sweeper already stopped");
    }
    if let Err(e) = sweeper_task.await {
        error!("sweeper task ended abnormally: {}", e);
    }

    // Dropping the services closes the event channel and lets the logger drain.
    drop(services);
    if let Err(e) = event_task.await {
        error!("event task ended abnormally: {}", e);
    }
    info!("Lot ledger stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
