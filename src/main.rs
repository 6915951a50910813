use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use roomslot::blob::FsBlobStore;
use roomslot::clock::SystemClock;
use roomslot::config::Config;
use roomslot::engine::Engine;
use roomslot::scheduler;
use roomslot::store::MemoryStore;

/// How often the compactor checks the WAL size.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    roomslot::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.snapshot_dir)?;

    let store = Arc::new(MemoryStore::open(&config.wal_path(), config.max_txn_ops)?);
    let blobs = Arc::new(FsBlobStore::new(&config.snapshot_dir));
    let engine = Arc::new(Engine::new(
        store.clone(),
        blobs,
        Arc::new(SystemClock),
        config.engine_settings(),
    ));

    info!("roomslot started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  snapshot_dir: {}", config.snapshot_dir.display());
    info!("  max_txn_ops: {}", config.max_txn_ops);
    info!("  day_offset: {}", config.day_offset);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let snapshots = tokio::spawn(scheduler::run_snapshot_scheduler(engine.clone(), config.snapshot_interval));
    let compactor = tokio::spawn(scheduler::run_compactor(
        store.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));

    // Run until SIGTERM/ctrl-c.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    info!("shutdown signal received, stopping background tasks");

    snapshots.abort();
    compactor.abort();
    if let Err(e) = store.compact_if_needed(config.compact_threshold).await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("roomslot stopped");
    Ok(())
}
