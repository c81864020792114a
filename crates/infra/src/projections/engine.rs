//! Position-ordered catch-up of projections.
//!
//! One tick of a projection:
//!
//! ```text
//! try_lock(lease) ──none──▶ locked elsewhere
//!   │
//!   ▼
//! current_position ─▶ read ≤ bulk_limit events after it, bounded by the
//!   │                 committed watermark, in position order
//!   ▼
//! per event: renew lease every `lease_renew_every` events ──lost──▶ stop
//!   │   reduce ─▶ apply(statement, position)
//!   │   └── error ─▶ record_failure ─▶ count > max_failure_count ? skip : stop
//!   ▼
//! full batch ? next batch : skip(watermark), caught up
//!   │
//!   ▼
//! unlock
//! ```
//!
//! A stopped tick leaves the cursor before the failing event, so the next
//! tick retries it. Store outages abort the tick without counting against
//! the event.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use keyward_events::{EventQuery, Projection, ProjectionError, StoredEvent};

use super::store::ProjectionStore;
use crate::config::ProjectionConfig;
use crate::event_store::{EventStore, EventStoreError};

/// Outcome of one [`ProjectionEngine::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub processed: u64,
    pub skipped: u64,
    /// Failed attempts during this tick, skipped ones included.
    pub failed: u64,
    pub caught_up: bool,
    pub lock_acquired: bool,
    /// Cursor after the tick.
    pub position: u64,
}

impl TickReport {
    pub fn locked_elsewhere() -> Self {
        Self::default()
    }
}

fn store_error(err: EventStoreError) -> ProjectionError {
    ProjectionError::Store(err.to_string())
}

pub struct ProjectionEngine<E, P> {
    events: E,
    store: P,
    config: ProjectionConfig,
    holder: String,
}

impl<E, P> core::fmt::Debug for ProjectionEngine<E, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("config", &self.config)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<E: EventStore, P: ProjectionStore> ProjectionEngine<E, P> {
    pub fn new(events: E, store: P, config: ProjectionConfig) -> Self {
        Self {
            events,
            store,
            config,
            holder: Uuid::now_v7().to_string(),
        }
    }

    /// Lease holder name; unique per engine unless set explicitly.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Create the projection's tables.
    pub async fn init(&self, projection: &dyn Projection) -> Result<(), ProjectionError> {
        self.store.init_schema(&projection.schema()).await
    }

    /// Run a projection until it is caught up, stopped by a failing event or
    /// its lease is lost.
    #[instrument(skip_all, fields(projection = projection.name(), holder = %self.holder), err)]
    pub async fn tick(&self, projection: &dyn Projection) -> Result<TickReport, ProjectionError> {
        let name = projection.name();
        if !self.store.try_lock(name, &self.holder, self.config.lock_lease).await? {
            debug!("projection is locked by another worker");
            return Ok(TickReport::locked_elsewhere());
        }

        let result = self.run(projection).await;
        if let Err(err) = self.store.unlock(name, &self.holder).await {
            warn!(error = %err, "failed to release projection lock");
        }
        result
    }

    async fn run(&self, projection: &dyn Projection) -> Result<TickReport, ProjectionError> {
        let name = projection.name();
        let mut report = TickReport {
            lock_acquired: true,
            ..TickReport::default()
        };

        let mut first = true;
        loop {
            if !first && !self.store.try_lock(name, &self.holder, self.config.lock_lease).await? {
                warn!("projection lease lost mid-tick");
                return Ok(report);
            }
            first = false;

            let position = self.store.current_position(name).await?;
            report.position = position;
            let watermark = self.events.committed_position().await.map_err(store_error)?;
            if watermark <= position {
                report.caught_up = true;
                return Ok(report);
            }

            let query = self.batch_query(projection, position, watermark)?;
            let batch = self.events.filter(&query).await.map_err(store_error)?;
            let full = batch.len() as u64 >= self.config.bulk_limit;

            for (index, event) in batch.iter().enumerate() {
                if index > 0
                    && index as u64 % self.config.lease_renew_every.max(1) == 0
                    && !self.store.try_lock(name, &self.holder, self.config.lock_lease).await?
                {
                    warn!(position = report.position, "projection lease lost mid-batch");
                    return Ok(report);
                }
                match self.process(projection, event).await {
                    Ok(()) => report.processed += 1,
                    Err(ProjectionError::Store(msg)) => return Err(ProjectionError::Store(msg)),
                    Err(err) => {
                        report.failed += 1;
                        let count = self
                            .store
                            .record_failure(name, event.position, event.tenant_id, &err.to_string())
                            .await?;
                        if count <= self.config.max_failure_count {
                            warn!(
                                position = event.position,
                                event_type = %event.event_type,
                                failure_count = count,
                                error = %err,
                                "projection stopped at failing event"
                            );
                            return Ok(report);
                        }
                        warn!(
                            position = event.position,
                            event_type = %event.event_type,
                            failure_count = count,
                            error = %err,
                            "skipping event after repeated failures"
                        );
                        self.store.skip(name, event.position).await?;
                        report.skipped += 1;
                    }
                }
                report.position = event.position;
            }

            if !full {
                self.store.skip(name, watermark).await?;
                report.position = watermark;
                report.caught_up = true;
                if report.processed > 0 || report.skipped > 0 {
                    info!(
                        processed = report.processed,
                        skipped = report.skipped,
                        position = watermark,
                        "projection caught up"
                    );
                }
                return Ok(report);
            }
        }
    }

    async fn process(&self, projection: &dyn Projection, event: &StoredEvent) -> Result<(), ProjectionError> {
        let statement = projection.reduce(event)?;
        self.store.apply(projection.name(), &statement, event.position).await
    }

    fn batch_query(
        &self,
        projection: &dyn Projection,
        position: u64,
        watermark: u64,
    ) -> Result<EventQuery, ProjectionError> {
        let mut builder = EventQuery::builder()
            .position_greater(position)
            .order_by_position()
            .limit(self.config.bulk_limit);
        for subscription in projection.subscriptions() {
            builder = builder
                .add_query()
                .aggregate_types([subscription.aggregate_type])
                .event_types(subscription.event_types)
                .builder();
        }
        let query = builder
            .build()
            .map_err(|e| ProjectionError::Store(format!("invalid projection query: {e}")))?;
        Ok(query.bounded_at(watermark))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use keyward_core::FixedClock;

    use keyward_auth::{HumanEvent, SessionEvent};
    use keyward_core::{AggregateId, AggregateRef, TenantId};
    use keyward_events::{Column, ColumnDef, ColumnType, Condition, Statement, Subscription, Table, UncommittedEvent};

    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{FailedEvent, FailedEventFilter, InMemoryProjectionStore, Row};

    /// Records every session it sees and chokes on the aggregate "poison".
    struct Recorder;

    impl Projection for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn schema(&self) -> Table {
            Table::new(
                "projections.recorded",
                vec![
                    ColumnDef::new("position", ColumnType::Int64),
                    ColumnDef::new("aggregate_id", ColumnType::Text),
                ],
                vec!["position"],
            )
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::new("session", &["session.added"])]
        }

        fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
            if event.aggregate_id.as_str() == "poison" {
                return Err(ProjectionError::reduce(event, "poisoned"));
            }
            Ok(Statement::Create {
                table: "projections.recorded",
                columns: vec![
                    Column::new("position", event.position),
                    Column::new("aggregate_id", event.aggregate_id.as_str()),
                ],
            })
        }
    }

    type Engine = ProjectionEngine<Arc<InMemoryEventStore>, Arc<InMemoryProjectionStore>>;

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        store: Arc<InMemoryProjectionStore>,
        engine: Engine,
        tenant: TenantId,
    }

    async fn fixture(config: ProjectionConfig) -> Fixture {
        let events = Arc::new(InMemoryEventStore::new(keyward_auth::event_registry()));
        let store = Arc::new(InMemoryProjectionStore::new());
        let engine = ProjectionEngine::new(events.clone(), store.clone(), config).with_holder("w1");
        engine.init(&Recorder).await.unwrap();
        Fixture {
            events,
            store,
            engine,
            tenant: TenantId::new(),
        }
    }

    impl Fixture {
        async fn session(&self, id: &str) {
            let aggregate = AggregateRef::new(self.tenant, "session", AggregateId::parse(id).unwrap(), "org1");
            let event = UncommittedEvent::from_typed(&aggregate, "u1", &SessionEvent::Added).unwrap();
            self.events.push(vec![event]).await.unwrap();
        }

        async fn terminate(&self, id: &str) {
            let aggregate = AggregateRef::new(self.tenant, "session", AggregateId::parse(id).unwrap(), "org1");
            let event = UncommittedEvent::from_typed(&aggregate, "u1", &SessionEvent::Terminated).unwrap();
            self.events.push(vec![event]).await.unwrap();
        }

        async fn user(&self, id: &str) {
            let aggregate = AggregateRef::new(self.tenant, "user", AggregateId::parse(id).unwrap(), "org1");
            let event = HumanEvent::Added {
                username: id.into(),
                email: format!("{id}@example.com"),
                encoded_hash: None,
            };
            let event = UncommittedEvent::from_typed(&aggregate, "admin", &event).unwrap();
            self.events.push(vec![event]).await.unwrap();
        }

        async fn recorded(&self) -> Vec<String> {
            self.store
                .select(&Recorder.schema(), &[])
                .await
                .unwrap()
                .iter()
                .filter_map(|row| row["aggregate_id"].as_text().map(str::to_string))
                .collect()
        }
    }

    #[tokio::test]
    async fn catches_up_across_several_batches() {
        let f = fixture(ProjectionConfig::default().with_bulk_limit(2)).await;
        for id in ["s1", "s2", "s3", "s4", "s5"] {
            f.session(id).await;
        }

        let report = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(report.processed, 5);
        assert!(report.caught_up && report.lock_acquired);
        assert_eq!(report.position, 5);
        assert_eq!(f.recorded().await, vec!["s1", "s2", "s3", "s4", "s5"]);

        let again = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(again.processed, 0);
        assert!(again.caught_up);
    }

    #[tokio::test]
    async fn unsubscribed_events_still_move_the_cursor() {
        let f = fixture(ProjectionConfig::default()).await;
        f.session("s1").await;
        f.user("u1").await;
        f.terminate("s1").await;

        let report = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(f.store.current_position("recorder").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn a_held_lease_keeps_other_workers_out() {
        let f = fixture(ProjectionConfig::default()).await;
        f.session("s1").await;
        assert!(f.store.try_lock("recorder", "w2", Duration::from_secs(60)).await.unwrap());

        let report = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(report, TickReport::locked_elsewhere());
        assert!(f.recorded().await.is_empty());

        f.store.unlock("recorder", "w2").await.unwrap();
        assert_eq!(f.engine.tick(&Recorder).await.unwrap().processed, 1);
        assert!(f.store.try_lock("recorder", "w2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn failing_events_are_retried_then_skipped() {
        let f = fixture(ProjectionConfig::default().with_max_failure_count(2)).await;
        f.session("s1").await;
        f.session("poison").await;
        f.session("s3").await;

        for attempt in 1..=2 {
            let report = f.engine.tick(&Recorder).await.unwrap();
            assert!(!report.caught_up, "attempt {attempt}");
            assert_eq!(report.failed, 1);
            assert_eq!(report.position, 1);
        }
        assert_eq!(f.recorded().await, vec!["s1"]);

        let report = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
        assert!(report.caught_up);
        assert_eq!(f.recorded().await, vec!["s1", "s3"]);

        let failed = f.store.failed_events(&Default::default()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_position, 2);
        assert_eq!(failed[0].failure_count, 3);
        assert_eq!(failed[0].tenant_id, f.tenant);
    }

    #[tokio::test]
    async fn execution_errors_count_as_failures() {
        let f = fixture(ProjectionConfig::default().with_max_failure_count(0)).await;
        f.session("s1").await;
        // A row with the same key makes the create clash.
        f.store
            .apply(
                "other",
                &Statement::Create {
                    table: "projections.recorded",
                    columns: vec![Column::new("position", 1i64), Column::new("aggregate_id", "x")],
                },
                1,
            )
            .await
            .unwrap();

        let report = f.engine.tick(&Recorder).await.unwrap();
        assert_eq!(report.skipped, 1);
        let rows = f
            .store
            .select(&Recorder.schema(), &[Condition::new("position", 1i64)])
            .await
            .unwrap();
        assert_eq!(rows[0]["aggregate_id"].as_text(), Some("x"));
    }

    /// Advances the clock on every apply and lets a rival worker grab the
    /// lease whenever it has expired.
    struct ContestedStore {
        inner: Arc<InMemoryProjectionStore>,
        clock: Arc<FixedClock>,
        step: chrono::Duration,
        rival_took_over: AtomicBool,
    }

    #[async_trait]
    impl ProjectionStore for ContestedStore {
        async fn init_schema(&self, table: &Table) -> Result<(), ProjectionError> {
            self.inner.init_schema(table).await
        }

        async fn try_lock(&self, projection: &str, holder: &str, lease: Duration) -> Result<bool, ProjectionError> {
            self.inner.try_lock(projection, holder, lease).await
        }

        async fn unlock(&self, projection: &str, holder: &str) -> Result<(), ProjectionError> {
            self.inner.unlock(projection, holder).await
        }

        async fn current_position(&self, projection: &str) -> Result<u64, ProjectionError> {
            self.inner.current_position(projection).await
        }

        async fn apply(&self, projection: &str, statement: &Statement, position: u64) -> Result<(), ProjectionError> {
            self.inner.apply(projection, statement, position).await?;
            self.clock.advance(self.step);
            if self.inner.try_lock(projection, "rival", Duration::from_secs(5)).await? {
                self.rival_took_over.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn record_failure(
            &self,
            projection: &str,
            position: u64,
            tenant_id: TenantId,
            error: &str,
        ) -> Result<u32, ProjectionError> {
            self.inner.record_failure(projection, position, tenant_id, error).await
        }

        async fn skip(&self, projection: &str, position: u64) -> Result<(), ProjectionError> {
            self.inner.skip(projection, position).await
        }

        async fn failed_events(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>, ProjectionError> {
            self.inner.failed_events(filter).await
        }

        async fn remove_failed_event(&self, projection: &str, position: u64) -> Result<bool, ProjectionError> {
            self.inner.remove_failed_event(projection, position).await
        }

        async fn select(&self, table: &Table, conditions: &[Condition]) -> Result<Vec<Row>, ProjectionError> {
            self.inner.select(table, conditions).await
        }
    }

    async fn contested(renew_every: u64) -> (ProjectionEngine<Arc<InMemoryEventStore>, Arc<ContestedStore>>, Arc<ContestedStore>) {
        let f = fixture(ProjectionConfig::default()).await;
        for n in 0..6 {
            f.session(&format!("s{n}")).await;
        }
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let store = Arc::new(ContestedStore {
            inner: Arc::new(InMemoryProjectionStore::with_clock(clock.clone())),
            clock,
            step: chrono::Duration::seconds(2),
            rival_took_over: AtomicBool::new(false),
        });
        let config = ProjectionConfig::default()
            .with_lock_lease(Duration::from_secs(5))
            .with_lease_renew_every(renew_every);
        let engine = ProjectionEngine::new(f.events.clone(), store.clone(), config).with_holder("w1");
        engine.init(&Recorder).await.unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn the_lease_is_renewed_within_a_long_batch() {
        let (engine, store) = contested(2).await;
        let report = engine.tick(&Recorder).await.unwrap();
        assert_eq!(report.processed, 6);
        assert!(report.caught_up);
        assert!(!store.rival_took_over.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_lost_lease_stops_the_batch_at_the_next_renewal() {
        let (engine, store) = contested(4).await;
        let report = engine.tick(&Recorder).await.unwrap();
        assert!(store.rival_took_over.load(Ordering::SeqCst));
        assert_eq!(report.processed, 4);
        assert!(!report.caught_up);
        assert_eq!(store.current_position("recorder").await.unwrap(), 4);
        assert!(!store.try_lock("recorder", "w1", Duration::from_secs(5)).await.unwrap());
    }
}
