//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `EventStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) on `events` | `23505` | `Concurrency` | Another writer took the sequence first |
//! | Database (unique violation) on `unique_constraints` | `23505` | `UniqueConstraint` | Value already reserved |
//! | Database (foreign key / check violation) | `23503` / `23514` | `InvalidAppend` | Invalid data (e.g. sequence <= 0) |
//! | Decode errors | N/A | `Serialization` | Row does not decode into a `StoredEvent` |
//! | Pool / IO / other | N/A | `Unavailable` | Network errors, connection failures, etc. |
//!
//! ## Commit-order watermark
//!
//! Positions come from a `BIGSERIAL` and are assigned at insert time, so a
//! transaction holding position 10 may commit after one holding position 11.
//! Every push runs under a shared transaction-scoped advisory lock.
//! `committed_position()` briefly takes the same lock exclusively, which
//! waits for in-flight pushes, then reads `MAX(position)`. Positions handed
//! out afterwards are strictly larger, so every position up to the returned
//! value is committed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, debug, instrument};

use keyward_core::{AggregateId, TenantId};
use keyward_events::{EventQuery, EventRegistry, OrderBy, StoredEvent, UncommittedEvent, UniqueConstraint};

use super::r#trait::{EventStore, EventStoreError, StreamKey, plan_batch};

/// Advisory lock key shared by all pushes and the watermark read.
const APPEND_LOCK_KEY: i64 = 0x6b65_7977_6172_6431;

const SCHEMA: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS keyward",
    r#"
    CREATE TABLE IF NOT EXISTS keyward.events (
        position BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        tenant_id UUID NOT NULL,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        resource_owner TEXT NOT NULL,
        sequence BIGINT NOT NULL CHECK (sequence > 0),
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        editor TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT events_aggregate_sequence UNIQUE (tenant_id, aggregate_type, aggregate_id, sequence)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS events_tenant_type_position
        ON keyward.events (tenant_id, aggregate_type, position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keyward.unique_constraints (
        tenant_id UUID NOT NULL,
        unique_type TEXT NOT NULL,
        unique_field TEXT NOT NULL,
        PRIMARY KEY (tenant_id, unique_type, unique_field)
    )
    "#,
];

/// Postgres-backed append-only event store.
///
/// ## Optimistic Concurrency
///
/// `push()` uses one transaction to:
/// 1. Check every aggregate's current sequence (MAX(sequence))
/// 2. Validate it against the batch's precondition
/// 3. Apply unique constraints
/// 4. Insert the events
///
/// If another transaction commits between steps 1 and 4, the unique
/// constraint on `(tenant_id, aggregate_type, aggregate_id, sequence)` fails
/// the insert, resulting in a concurrency error.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    registry: EventRegistry,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, registry: EventRegistry) -> Self {
        Self {
            pool: Arc::new(pool),
            registry,
        }
    }

    /// Create the `keyward` schema, event and unique constraint tables if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, events), fields(event_count = events.len(), committed_events = tracing::field::Empty), err)]
    async fn push(&self, events: Vec<UncommittedEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let plan = plan_batch(&self.registry, &events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock_shared($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_lock", e))?;

        let mut sequences = Vec::with_capacity(plan.len());
        for (key, expected) in plan {
            let current = current_sequence(&mut tx, &key).await?;
            if !expected.matches(current) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "{} {}: expected {expected:?}, found {current}",
                    key.aggregate_type, key.aggregate_id
                )));
            }
            sequences.push((key, current));
        }

        let mut stored_events = Vec::with_capacity(events.len());
        for event in events {
            apply_unique_constraints(&mut tx, event.aggregate.tenant_id, &event.unique_constraints).await?;

            let key = StreamKey::of(&event);
            let Some((_, sequence)) = sequences.iter_mut().find(|(k, _)| *k == key) else {
                return Err(EventStoreError::InvalidAppend(format!(
                    "no precondition planned for {}",
                    key.aggregate_id
                )));
            };
            *sequence += 1;
            let next_sequence = *sequence;
            let event_id = uuid::Uuid::now_v7();

            let row = sqlx::query(
                r#"
                INSERT INTO keyward.events (
                    event_id,
                    tenant_id,
                    aggregate_type,
                    aggregate_id,
                    resource_owner,
                    sequence,
                    event_type,
                    payload,
                    editor
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING position, created_at
                "#,
            )
            .bind(event_id)
            .bind(event.aggregate.tenant_id.as_uuid())
            .bind(&event.aggregate.aggregate_type)
            .bind(event.aggregate.aggregate_id.as_str())
            .bind(&event.aggregate.resource_owner)
            .bind(to_i64(next_sequence))
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(&event.editor)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent push detected: sequence {next_sequence} of {} already exists",
                        event.aggregate.aggregate_id
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let position: i64 = row
                .try_get("position")
                .map_err(|e| EventStoreError::Serialization(format!("failed to read position: {e}")))?;
            let created_at: DateTime<Utc> = row
                .try_get("created_at")
                .map_err(|e| EventStoreError::Serialization(format!("failed to read created_at: {e}")))?;

            stored_events.push(StoredEvent {
                event_id,
                tenant_id: event.aggregate.tenant_id,
                aggregate_type: event.aggregate.aggregate_type,
                aggregate_id: event.aggregate.aggregate_id,
                resource_owner: event.aggregate.resource_owner,
                sequence: next_sequence,
                position: position as u64,
                event_type: event.event_type,
                payload: event.payload,
                editor: event.editor,
                created_at,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(skip(self, query), fields(event_count = tracing::field::Empty), err)]
    async fn filter(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut builder = filter_sql(query);
        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row)
                .map_err(|e| EventStoreError::Serialization(format!("failed to deserialize event row: {e}")))?;
            stored_events.push(stored.try_into()?);
        }

        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    async fn latest_sequence(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence), 0) AS current_sequence
            FROM keyward.events
            WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_type)
        .bind(aggregate_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_sequence", e))?;
        read_u64(&row, "current_sequence")
    }

    #[instrument(skip(self), err)]
    async fn committed_position(&self) -> Result<u64, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("watermark_lock", e))?;

        let row = sqlx::query("SELECT COALESCE(MAX(position), 0) AS committed FROM keyward.events")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("committed_position", e))?;
        let committed = read_u64(&row, "committed")?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(committed, "read committed position");
        Ok(committed)
    }
}

/// Render an [`EventQuery`] as one parameterized SELECT.
///
/// Builder-level filters are ANDed, sub-queries are ORed inside parentheses.
fn filter_sql(query: &EventQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        "SELECT event_id, tenant_id, aggregate_type, aggregate_id, resource_owner, sequence, \
         position, event_type, payload, editor, created_at FROM keyward.events WHERE TRUE",
    );

    if let Some(tenant) = query.tenant() {
        builder.push(" AND tenant_id = ").push_bind(*tenant.as_uuid());
    }
    if let Some(owner) = query.resource_owner() {
        builder.push(" AND resource_owner = ").push_bind(owner.to_string());
    }
    if let Some(position) = query.position_greater() {
        builder.push(" AND position > ").push_bind(to_i64(position));
    }
    if let Some(position) = query.position_at_most() {
        builder.push(" AND position <= ").push_bind(to_i64(position));
    }

    builder.push(" AND (");
    for (index, sub) in query.sub_queries().iter().enumerate() {
        if index > 0 {
            builder.push(" OR ");
        }
        builder.push("(TRUE");
        if !sub.aggregate_types.is_empty() {
            builder
                .push(" AND aggregate_type = ANY(")
                .push_bind(sub.aggregate_types.clone())
                .push(")");
        }
        if !sub.aggregate_ids.is_empty() {
            builder
                .push(" AND aggregate_id = ANY(")
                .push_bind(sub.aggregate_ids.clone())
                .push(")");
        }
        if !sub.event_types.is_empty() {
            builder
                .push(" AND event_type = ANY(")
                .push_bind(sub.event_types.clone())
                .push(")");
        }
        if let Some(sequence) = sub.sequence_greater {
            builder.push(" AND sequence > ").push_bind(to_i64(sequence));
        }
        if let Some(sequence) = sub.sequence_less {
            builder.push(" AND sequence < ").push_bind(to_i64(sequence));
        }
        builder.push(")");
    }
    builder.push(")");

    let direction = if query.is_desc() { "DESC" } else { "ASC" };
    match query.order_by() {
        OrderBy::Sequence => builder.push(format!(" ORDER BY sequence {direction}, position {direction}")),
        OrderBy::Position => builder.push(format!(" ORDER BY position {direction}")),
    };
    if let Some(limit) = query.limit() {
        builder.push(" LIMIT ").push_bind(to_i64(limit));
    }
    builder
}

async fn current_sequence(
    tx: &mut Transaction<'_, Postgres>,
    key: &StreamKey,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence), 0) AS current_sequence
        FROM keyward.events
        WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        "#,
    )
    .bind(key.tenant_id.as_uuid())
    .bind(&key.aggregate_type)
    .bind(key.aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_sequence", e))?;
    read_u64(&row, "current_sequence")
}

async fn apply_unique_constraints(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    constraints: &[UniqueConstraint],
) -> Result<(), EventStoreError> {
    for constraint in constraints {
        match constraint {
            UniqueConstraint::Add {
                unique_type,
                unique_field,
                error_message,
            } => {
                sqlx::query(
                    "INSERT INTO keyward.unique_constraints (tenant_id, unique_type, unique_field) VALUES ($1, $2, $3)",
                )
                .bind(tenant_id.as_uuid())
                .bind(unique_type)
                .bind(unique_field)
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EventStoreError::UniqueConstraint(error_message.clone())
                    } else {
                        map_sqlx_error("add_unique_constraint", e)
                    }
                })?;
            }
            UniqueConstraint::Remove {
                unique_type,
                unique_field,
            } => {
                sqlx::query(
                    "DELETE FROM keyward.unique_constraints WHERE tenant_id = $1 AND unique_type = $2 AND unique_field = $3",
                )
                .bind(tenant_id.as_uuid())
                .bind(unique_type)
                .bind(unique_field)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("remove_unique_constraint", e))?;
            }
        }
    }
    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_u64(row: &PgRow, column: &str) -> Result<u64, EventStoreError> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| EventStoreError::Serialization(format!("failed to read {column}: {e}")))?;
    Ok(value.max(0) as u64)
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23503") | Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            EventStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    aggregate_type: String,
    aggregate_id: String,
    resource_owner: String,
    sequence: i64,
    position: i64,
    event_type: String,
    payload: serde_json::Value,
    editor: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for StoredEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            resource_owner: row.try_get("resource_owner")?,
            sequence: row.try_get("sequence")?,
            position: row.try_get("position")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            editor: row.try_get("editor")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        let aggregate_id = AggregateId::parse(row.aggregate_id)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        Ok(StoredEvent {
            event_id: row.event_id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            aggregate_type: row.aggregate_type,
            aggregate_id,
            resource_owner: row.resource_owner,
            sequence: row.sequence as u64,
            position: row.position as u64,
            event_type: row.event_type,
            payload: row.payload,
            editor: row.editor,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use sqlx::Execute;

    use super::*;

    #[test]
    fn filter_ors_sub_queries_inside_the_builder_filters() {
        let query = EventQuery::builder()
            .tenant(TenantId::new())
            .position_greater(10)
            .order_by_position()
            .limit(200)
            .add_query()
            .aggregate_types(["session"])
            .event_types(["session.added"])
            .or()
            .aggregate_types(["user"])
            .build()
            .unwrap()
            .bounded_at(42);

        let mut builder = filter_sql(&query);
        let sql = builder.build().sql().to_string();
        assert!(sql.contains("tenant_id = $1 AND position > $2 AND position <= $3"));
        assert!(sql.contains(
            "AND ((TRUE AND aggregate_type = ANY($4) AND event_type = ANY($5)) OR (TRUE AND aggregate_type = ANY($6)))"
        ));
        assert!(sql.ends_with("ORDER BY position ASC LIMIT $7"));
    }

    #[test]
    fn sequence_order_breaks_ties_by_position() {
        let query = EventQuery::builder()
            .order_desc()
            .add_query()
            .aggregate_ids(["s1"])
            .sequence_greater(3)
            .build()
            .unwrap();
        let mut builder = filter_sql(&query);
        let sql = builder.build().sql().to_string();
        assert!(sql.contains("AND sequence > $2"));
        assert!(sql.ends_with("ORDER BY sequence DESC, position DESC"));
    }
}
