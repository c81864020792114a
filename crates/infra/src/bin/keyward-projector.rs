//! Runs every identity projection against the Postgres event log until
//! interrupted.

use std::sync::Arc;

use anyhow::Context;

use keyward_infra::config::KeywardConfig;
use keyward_infra::event_store::PostgresEventStore;
use keyward_infra::projections::{PostgresProjectionStore, ProjectionEngine, identity_projections};
use keyward_infra::workers::ProjectionWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keyward_observability::init();

    let config = KeywardConfig::from_env();
    let pool = config
        .database
        .connect()
        .await
        .context("failed to connect to postgres")?;

    let events = PostgresEventStore::new(pool.clone(), keyward_auth::event_registry());
    events.migrate().await.context("event log migration failed")?;
    let store = PostgresProjectionStore::new(pool);
    store.migrate().await.context("projection schema migration failed")?;

    let engine = Arc::new(ProjectionEngine::new(events, store, config.projections.clone()));
    let workers: Vec<_> = identity_projections()
        .into_iter()
        .map(|projection| ProjectionWorker::spawn(engine.clone(), projection, config.projections.requeue_every))
        .collect();
    tracing::info!(workers = workers.len(), holder = engine.holder(), "projector running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    for worker in workers {
        worker.shutdown().await;
    }
    Ok(())
}
