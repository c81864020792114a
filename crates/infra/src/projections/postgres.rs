//! Postgres-backed projection store.
//!
//! Read models live in the `projections` schema next to three bookkeeping
//! tables:
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | `current_positions` | `projection_name` | Last applied log position |
//! | `locks` | `projection_name` | Lease of the worker currently running the projection |
//! | `failed_events` | `(projection_name, failed_position)` | Failure count and last error per event |
//!
//! `apply` runs the statement, the cursor upsert and the failure cleanup in
//! one transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _};
use tracing::{debug, instrument};

use keyward_core::TenantId;
use keyward_events::{Column, ColumnType, Condition, ProjectionError, SqlValue, Statement, Table};

use super::store::{FailedEvent, FailedEventFilter, ProjectionStore, Row};

const SCHEMA: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS projections",
    r#"
    CREATE TABLE IF NOT EXISTS projections.current_positions (
        projection_name TEXT PRIMARY KEY,
        position BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projections.locks (
        projection_name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projections.failed_events (
        projection_name TEXT NOT NULL,
        failed_position BIGINT NOT NULL,
        failure_count INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        tenant_id UUID NOT NULL,
        last_failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (projection_name, failed_position)
    )
    "#,
];

const ADVANCE_CURSOR: &str = r#"
    INSERT INTO projections.current_positions (projection_name, position)
    VALUES ($1, $2)
    ON CONFLICT (projection_name) DO UPDATE SET
        position = GREATEST(projections.current_positions.position, EXCLUDED.position),
        updated_at = now()
"#;

#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the `projections` schema and bookkeeping tables if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), ProjectionError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_store_error("migrate", e))?;
        }
        Ok(())
    }
}

/// Quote a possibly schema-qualified identifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn column_sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::Int64 => "BIGINT",
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Jsonb => "JSONB",
    }
}

fn create_table_sql(table: &Table) -> Vec<String> {
    let mut columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", quote_ident(c.name), column_sql_type(c.column_type))
        })
        .collect();
    if !table.primary_key.is_empty() {
        let key: Vec<String> = table.primary_key.iter().map(|c| quote_ident(c)).collect();
        columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }

    let name = quote_ident(table.name);
    let mut statements = vec![format!("CREATE TABLE IF NOT EXISTS {name} ({})", columns.join(", "))];
    for index in &table.indexes {
        let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {name} ({})",
            quote_ident(index.name),
            columns.join(", ")
        ));
    }
    statements
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            builder.push("NULL");
        }
        SqlValue::Bool(b) => {
            builder.push_bind(*b);
        }
        SqlValue::Int(i) => {
            builder.push_bind(*i);
        }
        SqlValue::Text(s) => {
            builder.push_bind(s.clone());
        }
        SqlValue::Timestamp(t) => {
            builder.push_bind(*t);
        }
        SqlValue::Json(v) => {
            builder.push_bind(v.clone());
        }
    }
}

fn push_conditions(builder: &mut QueryBuilder<'static, Postgres>, conditions: &[Condition]) {
    for (i, condition) in conditions.iter().enumerate() {
        builder.push(if i == 0 { " WHERE " } else { " AND " });
        builder.push(quote_ident(condition.column));
        if condition.value == SqlValue::Null {
            builder.push(" IS NULL");
        } else {
            builder.push(" = ");
            push_value(builder, &condition.value);
        }
    }
}

fn push_insert(builder: &mut QueryBuilder<'static, Postgres>, table: &str, columns: &[Column]) {
    builder.push("INSERT INTO ");
    builder.push(quote_ident(table));
    builder.push(" (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(column.name));
    }
    builder.push(") VALUES (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_value(builder, &column.value);
    }
    builder.push(")");
}

/// Flatten a statement into executable queries, in order.
fn statement_sql(statement: &Statement, out: &mut Vec<QueryBuilder<'static, Postgres>>) {
    match statement {
        Statement::NoOp => {}
        Statement::Multi(statements) => {
            for statement in statements {
                statement_sql(statement, out);
            }
        }
        Statement::Create { table, columns } => {
            let mut builder = QueryBuilder::new("");
            push_insert(&mut builder, table, columns);
            out.push(builder);
        }
        Statement::Update {
            table,
            values,
            conditions,
        } => {
            if values.is_empty() {
                return;
            }
            let mut builder = QueryBuilder::new("UPDATE ");
            builder.push(quote_ident(table));
            builder.push(" SET ");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(quote_ident(value.name));
                builder.push(" = ");
                push_value(&mut builder, &value.value);
            }
            push_conditions(&mut builder, conditions);
            out.push(builder);
        }
        Statement::Delete { table, conditions } => {
            let mut builder = QueryBuilder::new("DELETE FROM ");
            builder.push(quote_ident(table));
            push_conditions(&mut builder, conditions);
            out.push(builder);
        }
        Statement::Upsert {
            table,
            columns,
            conflict_columns,
        } => {
            let mut builder = QueryBuilder::new("");
            push_insert(&mut builder, table, columns);
            let key: Vec<String> = conflict_columns.iter().map(|c| quote_ident(c)).collect();
            builder.push(format!(" ON CONFLICT ({})", key.join(", ")));
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !conflict_columns.contains(&c.name))
                .map(|c| {
                    let name = quote_ident(c.name);
                    format!("{name} = EXCLUDED.{name}")
                })
                .collect();
            if updates.is_empty() {
                builder.push(" DO NOTHING");
            } else {
                builder.push(format!(" DO UPDATE SET {}", updates.join(", ")));
            }
            out.push(builder);
        }
    }
}

fn decode_row(table: &Table, row: &PgRow) -> Result<Row, sqlx::Error> {
    let mut decoded = Row::new();
    for column in &table.columns {
        let value: SqlValue = match column.column_type {
            ColumnType::Text => row.try_get::<Option<String>, _>(column.name)?.into(),
            ColumnType::Int64 => row.try_get::<Option<i64>, _>(column.name)?.into(),
            ColumnType::Bool => row.try_get::<Option<bool>, _>(column.name)?.into(),
            ColumnType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(column.name)?.into(),
            ColumnType::Jsonb => row.try_get::<Option<serde_json::Value>, _>(column.name)?.into(),
        };
        decoded.insert(column.name, value);
    }
    Ok(decoded)
}

fn decode_failed_event(row: &PgRow) -> Result<FailedEvent, sqlx::Error> {
    let position: i64 = row.try_get("failed_position")?;
    let count: i32 = row.try_get("failure_count")?;
    let tenant_id: uuid::Uuid = row.try_get("tenant_id")?;
    Ok(FailedEvent {
        projection_name: row.try_get("projection_name")?,
        failed_position: position.max(0) as u64,
        failure_count: count.max(0) as u32,
        last_error: row.try_get("last_error")?,
        tenant_id: TenantId::from_uuid(tenant_id),
        last_failed_at: row.try_get("last_failed_at")?,
    })
}

fn to_i64(position: u64) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

/// Database errors raised by a statement are execution errors of the event;
/// everything else is a store outage.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProjectionError {
    match err {
        sqlx::Error::Database(db_err) => {
            ProjectionError::Execution(format!("database error in {operation}: {}", db_err.message()))
        }
        _ => ProjectionError::Store(format!("sqlx error in {operation}: {err}")),
    }
}

fn map_store_error(operation: &str, err: sqlx::Error) -> ProjectionError {
    ProjectionError::Store(format!("sqlx error in {operation}: {err}"))
}

#[async_trait]
impl ProjectionStore for PostgresProjectionStore {
    #[instrument(skip(self, table), fields(table = table.name), err)]
    async fn init_schema(&self, table: &Table) -> Result<(), ProjectionError> {
        for statement in create_table_sql(table) {
            sqlx::query(&statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_store_error("init_schema", e))?;
        }
        Ok(())
    }

    async fn try_lock(&self, projection: &str, holder: &str, lease: Duration) -> Result<bool, ProjectionError> {
        let result = sqlx::query(
            r#"
            INSERT INTO projections.locks (projection_name, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (projection_name) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE projections.locks.expires_at < now()
               OR projections.locks.holder = EXCLUDED.holder
            "#,
        )
        .bind(projection)
        .bind(holder)
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_store_error("try_lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, projection: &str, holder: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM projections.locks WHERE projection_name = $1 AND holder = $2")
            .bind(projection)
            .bind(holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_store_error("unlock", e))?;
        Ok(())
    }

    async fn current_position(&self, projection: &str) -> Result<u64, ProjectionError> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM projections.current_positions WHERE projection_name = $1")
                .bind(projection)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_store_error("current_position", e))?;
        Ok(position.unwrap_or(0).max(0) as u64)
    }

    #[instrument(skip(self, statement), err)]
    async fn apply(&self, projection: &str, statement: &Statement, position: u64) -> Result<(), ProjectionError> {
        let mut queries = Vec::new();
        statement_sql(statement, &mut queries);

        let mut tx = self.pool.begin().await.map_err(|e| map_store_error("begin", e))?;
        for mut query in queries {
            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("apply", e))?;
        }
        sqlx::query(ADVANCE_CURSOR)
            .bind(projection)
            .bind(to_i64(position))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_store_error("advance_cursor", e))?;
        sqlx::query("DELETE FROM projections.failed_events WHERE projection_name = $1 AND failed_position = $2")
            .bind(projection)
            .bind(to_i64(position))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_store_error("clear_failure", e))?;
        tx.commit().await.map_err(|e| map_store_error("commit", e))?;

        debug!(projection, position, "statement applied");
        Ok(())
    }

    async fn record_failure(
        &self,
        projection: &str,
        position: u64,
        tenant_id: TenantId,
        error: &str,
    ) -> Result<u32, ProjectionError> {
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO projections.failed_events
                (projection_name, failed_position, failure_count, last_error, tenant_id, last_failed_at)
            VALUES ($1, $2, 1, $3, $4, now())
            ON CONFLICT (projection_name, failed_position) DO UPDATE SET
                failure_count = projections.failed_events.failure_count + 1,
                last_error = EXCLUDED.last_error,
                last_failed_at = now()
            RETURNING failure_count
            "#,
        )
        .bind(projection)
        .bind(to_i64(position))
        .bind(error)
        .bind(*tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_store_error("record_failure", e))?;
        Ok(count.max(0) as u32)
    }

    async fn skip(&self, projection: &str, position: u64) -> Result<(), ProjectionError> {
        sqlx::query(ADVANCE_CURSOR)
            .bind(projection)
            .bind(to_i64(position))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_store_error("skip", e))?;
        Ok(())
    }

    async fn failed_events(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>, ProjectionError> {
        let mut builder: QueryBuilder<'static, Postgres> = QueryBuilder::new(
            "SELECT projection_name, failed_position, failure_count, last_error, tenant_id, last_failed_at \
             FROM projections.failed_events WHERE TRUE",
        );
        if let Some(name) = &filter.projection_name {
            builder.push(" AND projection_name = ");
            builder.push_bind(name.clone());
        }
        if let Some(tenant_id) = filter.tenant_id {
            builder.push(" AND tenant_id = ");
            builder.push_bind(*tenant_id.as_uuid());
        }
        builder.push(" ORDER BY projection_name, failed_position");

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_store_error("failed_events", e))?;
        rows.iter()
            .map(decode_failed_event)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_store_error("failed_events", e))
    }

    async fn remove_failed_event(&self, projection: &str, position: u64) -> Result<bool, ProjectionError> {
        let result =
            sqlx::query("DELETE FROM projections.failed_events WHERE projection_name = $1 AND failed_position = $2")
                .bind(projection)
                .bind(to_i64(position))
                .execute(&*self.pool)
                .await
                .map_err(|e| map_store_error("remove_failed_event", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn select(&self, table: &Table, conditions: &[Condition]) -> Result<Vec<Row>, ProjectionError> {
        let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c.name)).collect();
        let mut builder: QueryBuilder<'static, Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM {}", columns.join(", "), quote_ident(table.name)));
        push_conditions(&mut builder, conditions);

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select", e))?;
        rows.iter()
            .map(|row| decode_row(table, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_store_error("select", e))
    }
}

#[cfg(test)]
mod tests {
    use keyward_events::ColumnDef;

    use super::*;

    fn sql(statement: &Statement) -> Vec<String> {
        let mut queries = Vec::new();
        statement_sql(statement, &mut queries);
        queries.iter().map(|q| q.sql().to_string()).collect()
    }

    #[test]
    fn tables_are_created_with_quoted_identifiers() {
        let table = Table::new(
            "projections.sessions",
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("user_id", ColumnType::Text).nullable(),
                ColumnDef::new("metadata", ColumnType::Jsonb),
            ],
            vec!["instance_id", "id"],
        )
        .with_index("sessions_user_idx", vec!["instance_id", "user_id"]);

        assert_eq!(
            create_table_sql(&table),
            vec![
                "CREATE TABLE IF NOT EXISTS \"projections\".\"sessions\" (\"instance_id\" TEXT NOT NULL, \
                 \"id\" TEXT NOT NULL, \"user_id\" TEXT, \"metadata\" JSONB NOT NULL, \
                 PRIMARY KEY (\"instance_id\", \"id\"))"
                    .to_string(),
                "CREATE INDEX IF NOT EXISTS \"sessions_user_idx\" ON \"projections\".\"sessions\" \
                 (\"instance_id\", \"user_id\")"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn statements_render_binds_and_null_literals() {
        let multi = Statement::Multi(vec![
            Statement::Create {
                table: "projections.things",
                columns: vec![Column::new("id", "a"), Column::new("owner", SqlValue::Null)],
            },
            Statement::Update {
                table: "projections.things",
                values: vec![Column::new("count", 2i64)],
                conditions: vec![Condition::new("id", "a"), Condition::new("owner", SqlValue::Null)],
            },
            Statement::NoOp,
            Statement::Delete {
                table: "projections.things",
                conditions: vec![Condition::new("id", "b")],
            },
        ]);

        assert_eq!(
            sql(&multi),
            vec![
                "INSERT INTO \"projections\".\"things\" (\"id\", \"owner\") VALUES ($1, NULL)",
                "UPDATE \"projections\".\"things\" SET \"count\" = $1 WHERE \"id\" = $2 AND \"owner\" IS NULL",
                "DELETE FROM \"projections\".\"things\" WHERE \"id\" = $1",
            ]
        );
    }

    #[test]
    fn upserts_update_only_non_conflict_columns() {
        let upsert = |columns| Statement::Upsert {
            table: "projections.oidc_settings",
            columns,
            conflict_columns: vec!["instance_id"],
        };

        assert_eq!(
            sql(&upsert(vec![Column::new("instance_id", "i1"), Column::new("access_secs", 60i64)])),
            vec![
                "INSERT INTO \"projections\".\"oidc_settings\" (\"instance_id\", \"access_secs\") VALUES ($1, $2) \
                 ON CONFLICT (\"instance_id\") DO UPDATE SET \"access_secs\" = EXCLUDED.\"access_secs\""
            ]
        );
        assert!(sql(&upsert(vec![Column::new("instance_id", "i1")]))[0].ends_with("DO NOTHING"));
    }

    #[test]
    fn empty_updates_produce_no_query() {
        let update = Statement::Update {
            table: "projections.things",
            values: vec![],
            conditions: vec![Condition::new("id", "a")],
        };
        assert!(sql(&update).is_empty());
    }

    #[test]
    fn identifiers_escape_embedded_quotes() {
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
