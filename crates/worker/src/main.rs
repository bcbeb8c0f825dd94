use taskflow::config;
use taskflow::db;
use taskflow::jobs::{Broker, PgBroker, PgStore, ResultStore, WorkerPool};
use taskflow::observability;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod handlers;
use handlers::{build_registry, LogMailer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    observability::init(cfg.log_json);

    let maintenance_interval_secs: u64 = std::env::var("TASKFLOW_MAINTENANCE_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60)
        .max(1);

    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        pool_size = cfg.pool_size,
        max_retries = cfg.max_retries,
        visibility_timeout_secs = cfg.visibility_timeout.as_secs(),
        job_timeout_ms = cfg.job_timeout.as_millis() as u64,
        result_ttl_secs = cfg.result_ttl.map(|t| t.as_secs()),
        migrate_on_startup = cfg.migrate_on_startup,
        maintenance_interval_secs,
        "taskflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(pool.clone()));
    let store: Arc<dyn ResultStore> = match cfg.result_ttl {
        Some(ttl) => Arc::new(PgStore::with_ttl(pool.clone(), ttl)),
        None => Arc::new(PgStore::new(pool.clone())),
    };

    let registry = build_registry(Arc::new(LogMailer))?;
    let workers = WorkerPool::new(
        broker,
        store.clone(),
        registry,
        cfg.retry_policy(),
        cfg.worker_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Worker pool task ----
    let mut worker_handle = tokio::spawn(workers.run(shutdown_rx.clone()));

    // ---- Maintenance task ----
    let maintenance_handle = {
        let store = store.clone();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                match store.purge_expired(chrono::Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "purged expired results"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "result purge failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(maintenance_interval_secs)) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested, draining in-flight jobs");
            // receivers may already be gone if a task exited early
            let _ = shutdown_tx.send(true);
            worker_handle.await??;
        }
        res = &mut worker_handle => {
            let _ = shutdown_tx.send(true);
            res??;
            anyhow::bail!("worker pool exited unexpectedly");
        }
    }
    maintenance_handle.await??;

    pool.close().await;
    tracing::info!("taskflow worker stopped");
    Ok(())
}
