//! Maintenance node: runs the scheduler, rescuer and pruner sweeps against the
//! shared Postgres store without executing any jobs itself.
//!
//! ```text
//! jobforge-daemon            run sweeps until ctrl-c
//! jobforge-daemon install    create the schema and exit
//! jobforge-daemon stats      print job counts per state as JSON
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use sqlx::postgres::{PgPool, PgPoolOptions};

use jobforge_events::Notifier;
use jobforge_infra::store::JobStore;
use jobforge_infra::{Engine, EngineConfig, PostgresJobStore, PostgresNotifier, WorkerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresJobStore::new(pool.clone());

    match command.as_str() {
        "install" => {
            store.install().await?;
            tracing::info!("schema installed");
        }
        "stats" => {
            let queue = std::env::args().nth(2);
            let stats = store.stats(queue.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "run" => run(store, &pool).await?,
        other => bail!("unknown command {other:?}; expected run, install or stats"),
    }
    Ok(())
}

async fn run(store: PostgresJobStore, pool: &PgPool) -> anyhow::Result<()> {
    store.install().await.context("failed to install schema")?;

    // Sweeps only: this node has no workers, so it owns no queues.
    let config = EngineConfig::from_env()?.with_queues(Vec::new());
    let notifier = connect_notifier(pool, &config.node).await?;

    let engine = Engine::new(config, Arc::new(store), WorkerRegistry::new())
        .with_notifier(notifier)
        .start()?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    engine.shutdown().await;
    Ok(())
}

/// Redis pub/sub when built with `redis` and `REDIS_URL` is set, else Postgres `NOTIFY`.
async fn connect_notifier(pool: &PgPool, node: &str) -> anyhow::Result<Arc<dyn Notifier>> {
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("REDIS_URL") {
        let notifier = jobforge_infra::RedisPubSubNotifier::new(&url, node)?;
        tracing::info!("control commands over redis pub/sub");
        return Ok(Arc::new(notifier));
    }

    let notifier = PostgresNotifier::connect(pool, node).await?;
    Ok(Arc::new(notifier))
}
