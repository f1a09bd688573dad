use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use canopy_hub::model::SensorAlert;
use canopy_hub::store::{MemoryStore, ReadingStore, SqliteStore};
use canopy_hub::transport::{sim::SimulatedTransports, DefaultTransports, TransportFactory};
use canopy_hub::{config, web, ConnectionManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "canopy.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:canopy.db?mode=rwc".to_string());
    let simulate = env::var("SIMULATE_SENSORS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let cfg = config::load(&config_path)?;

    // ── Reading store ───────────────────────────────────────────────
    let (store, open_alerts): (Arc<dyn ReadingStore>, Vec<SensorAlert>) = if db_url == "memory" {
        warn!("DB_URL=memory: readings are not persisted and old ones are dropped");
        (Arc::new(MemoryStore::new()), Vec::new())
    } else {
        let db = SqliteStore::connect(&db_url).await?;
        db.migrate().await?;
        let open_alerts = db.open_alerts().await?;
        info!(url = %db_url, open_alerts = open_alerts.len(), "reading store ready");
        (Arc::new(db), open_alerts)
    };

    // ── Transports ──────────────────────────────────────────────────
    let transports: Arc<dyn TransportFactory> = if simulate {
        warn!("SIMULATE_SENSORS set: every device reads from a simulator");
        Arc::new(SimulatedTransports)
    } else {
        Arc::new(DefaultTransports)
    };

    // ── Manager + configured devices ────────────────────────────────
    let manager = ConnectionManager::new(cfg.engine.clone(), cfg.threshold_table(), transports, store);
    manager.restore_alerts(open_alerts);
    config::apply(&cfg, &manager).await?;
    manager.record_system_event("hub started");

    // Connected in the background; a failed connect is retried by the
    // manager and never holds up the API.
    for device in &cfg.devices {
        manager.connect_in_background(&device.id);
    }

    // ── Web server ──────────────────────────────────────────────────
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let web_manager = Arc::clone(&manager);
    let web = tokio::spawn(async move {
        let shutdown = async {
            let _ = stop_rx.await;
        };
        if let Err(e) = web::serve(web_manager, shutdown).await {
            warn!(error = %format!("{e:#}"), "http api stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = stop_tx.send(());
    manager.shutdown().await;
    if let Err(e) = web.await {
        warn!(error = %e, "http api task failed");
    }
    info!("bye");
    Ok(())
}
