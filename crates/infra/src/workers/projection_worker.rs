use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use keyward_events::Projection;

use crate::event_store::EventStore;
use crate::projections::{ProjectionEngine, ProjectionStore};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A tick in progress runs to completion first, so the cursor is never
    /// left between a statement and its position.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "projection worker task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Periodic projection worker.
///
/// - Creates the projection's schema on start
/// - Ticks the engine every `interval`
/// - Supports graceful shutdown
///
/// Several workers may run the same projection in different processes; the
/// engine's lease lets only one of them make progress at a time.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<E, P>(
        engine: Arc<ProjectionEngine<E, P>>,
        projection: Arc<dyn Projection>,
        interval: Duration,
    ) -> WorkerHandle
    where
        E: EventStore + 'static,
        P: ProjectionStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(engine, projection, interval, shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<E, P>(
    engine: Arc<ProjectionEngine<E, P>>,
    projection: Arc<dyn Projection>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    E: EventStore,
    P: ProjectionStore,
{
    let name = projection.name();
    if let Err(err) = engine.init(projection.as_ref()).await {
        warn!(projection = name, error = %err, "failed to initialize projection schema");
    }
    info!(projection = name, holder = engine.holder(), "projection worker started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.tick(projection.as_ref()).await {
                    Ok(report) if report.processed > 0 || report.skipped > 0 => {
                        debug!(projection = name, processed = report.processed, skipped = report.skipped, "projection tick");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(projection = name, error = %err, "projection tick failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(projection = name, "projection worker stopped");
}
