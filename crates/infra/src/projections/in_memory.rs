use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keyward_core::{Clock, SystemClock, TenantId};
use keyward_events::{Column, ColumnType, Condition, ProjectionError, SqlValue, Statement, Table};

use super::store::{FailedEvent, FailedEventFilter, ProjectionStore, Row};

#[derive(Debug, Clone)]
struct MemTable {
    def: Table,
    rows: Vec<Row>,
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<&'static str, MemTable>,
    positions: HashMap<String, u64>,
    locks: HashMap<String, Lease>,
    failed: BTreeMap<(String, u64), FailedEvent>,
}

/// In-memory projection store for tests and local development.
///
/// Statements run against staged copies of the tables they touch. The copies
/// replace the originals together with the cursor only when the whole
/// statement succeeded.
pub struct InMemoryProjectionStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryProjectionStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryProjectionStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryProjectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Lease expiry and failure times are read from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
        }
    }
}

fn poisoned() -> ProjectionError {
    ProjectionError::Store("lock poisoned".to_string())
}

fn touched_tables(statement: &Statement, out: &mut Vec<&'static str>) {
    let table = match statement {
        Statement::NoOp => return,
        Statement::Multi(statements) => {
            for statement in statements {
                touched_tables(statement, out);
            }
            return;
        }
        Statement::Create { table, .. }
        | Statement::Update { table, .. }
        | Statement::Delete { table, .. }
        | Statement::Upsert { table, .. } => *table,
    };
    if !out.contains(&table) {
        out.push(table);
    }
}

fn fits(column_type: ColumnType, value: &SqlValue) -> bool {
    matches!(
        (column_type, value),
        (_, SqlValue::Null)
            | (ColumnType::Text, SqlValue::Text(_))
            | (ColumnType::Int64, SqlValue::Int(_))
            | (ColumnType::Bool, SqlValue::Bool(_))
            | (ColumnType::Timestamp, SqlValue::Timestamp(_))
            | (ColumnType::Jsonb, SqlValue::Json(_))
    )
}

impl MemTable {
    fn check_column(&self, name: &str, value: &SqlValue) -> Result<(), ProjectionError> {
        let def = self
            .def
            .columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ProjectionError::Execution(format!("unknown column {}.{name}", self.def.name)))?;
        if !fits(def.column_type, value) {
            return Err(ProjectionError::Execution(format!(
                "value {value:?} does not fit {}.{name} ({:?})",
                self.def.name, def.column_type
            )));
        }
        if !def.nullable && *value == SqlValue::Null {
            return Err(ProjectionError::Execution(format!(
                "null value in {}.{name} violates not-null constraint",
                self.def.name
            )));
        }
        Ok(())
    }

    fn check_conditions(&self, conditions: &[Condition]) -> Result<(), ProjectionError> {
        for condition in conditions {
            if !self.def.columns.iter().any(|c| c.name == condition.column) {
                return Err(ProjectionError::Execution(format!(
                    "unknown column {}.{}",
                    self.def.name, condition.column
                )));
            }
        }
        Ok(())
    }

    fn build_row(&self, columns: &[Column]) -> Result<Row, ProjectionError> {
        let mut row: Row = self.def.columns.iter().map(|c| (c.name, SqlValue::Null)).collect();
        for column in columns {
            self.check_column(column.name, &column.value)?;
            row.insert(column.name, column.value.clone());
        }
        for def in &self.def.columns {
            if !def.nullable && row.get(def.name) == Some(&SqlValue::Null) {
                return Err(ProjectionError::Execution(format!(
                    "null value in {}.{} violates not-null constraint",
                    self.def.name, def.name
                )));
            }
        }
        Ok(row)
    }

    fn same_key(&self, a: &Row, b: &Row, key: &[&'static str]) -> bool {
        key.iter().all(|column| a.get(column) == b.get(column))
    }

    fn insert(&mut self, row: Row) -> Result<(), ProjectionError> {
        let key = self.def.primary_key.clone();
        if self.rows.iter().any(|existing| self.same_key(existing, &row, &key)) {
            return Err(ProjectionError::Execution(format!(
                "duplicate key value violates primary key of {}",
                self.def.name
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    fn execute(&mut self, statement: &Statement) -> Result<(), ProjectionError> {
        match statement {
            Statement::NoOp | Statement::Multi(_) => Ok(()),
            Statement::Create { columns, .. } => {
                let row = self.build_row(columns)?;
                self.insert(row)
            }
            Statement::Update { values, conditions, .. } => {
                for value in values {
                    self.check_column(value.name, &value.value)?;
                }
                self.check_conditions(conditions)?;
                for row in self.rows.iter_mut().filter(|row| row_matches(row, conditions)) {
                    for value in values {
                        row.insert(value.name, value.value.clone());
                    }
                }
                Ok(())
            }
            Statement::Delete { conditions, .. } => {
                self.check_conditions(conditions)?;
                self.rows.retain(|row| !row_matches(row, conditions));
                Ok(())
            }
            Statement::Upsert {
                columns,
                conflict_columns,
                ..
            } => {
                let row = self.build_row(columns)?;
                match self
                    .rows
                    .iter()
                    .position(|existing| self.same_key(existing, &row, conflict_columns))
                {
                    Some(index) => {
                        let existing = &mut self.rows[index];
                        for column in columns.iter().filter(|c| !conflict_columns.contains(&c.name)) {
                            existing.insert(column.name, column.value.clone());
                        }
                        Ok(())
                    }
                    None => self.insert(row),
                }
            }
        }
    }
}

fn row_matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|condition| row.get(condition.column).unwrap_or(&SqlValue::Null) == &condition.value)
}

fn execute(staged: &mut HashMap<&'static str, MemTable>, statement: &Statement) -> Result<(), ProjectionError> {
    match statement {
        Statement::NoOp => Ok(()),
        Statement::Multi(statements) => statements.iter().try_for_each(|s| execute(staged, s)),
        Statement::Create { table, .. }
        | Statement::Update { table, .. }
        | Statement::Delete { table, .. }
        | Statement::Upsert { table, .. } => staged
            .get_mut(table)
            .ok_or_else(|| ProjectionError::Execution(format!("relation {table} does not exist")))?
            .execute(statement),
    }
}

fn advance(positions: &mut HashMap<String, u64>, projection: &str, position: u64) {
    let current = positions.entry(projection.to_string()).or_insert(0);
    *current = (*current).max(position);
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn init_schema(&self, table: &Table) -> Result<(), ProjectionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.tables.entry(table.name).or_insert_with(|| MemTable {
            def: table.clone(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn try_lock(&self, projection: &str, holder: &str, lease: Duration) -> Result<bool, ProjectionError> {
        let lease = chrono::Duration::from_std(lease).map_err(|e| ProjectionError::Store(e.to_string()))?;
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if let Some(current) = state.locks.get(projection) {
            if current.holder != holder && current.expires_at >= now {
                return Ok(false);
            }
        }
        state.locks.insert(
            projection.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, projection: &str, holder: &str) -> Result<(), ProjectionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.locks.get(projection).is_some_and(|lease| lease.holder == holder) {
            state.locks.remove(projection);
        }
        Ok(())
    }

    async fn current_position(&self, projection: &str) -> Result<u64, ProjectionError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.positions.get(projection).copied().unwrap_or(0))
    }

    async fn apply(&self, projection: &str, statement: &Statement, position: u64) -> Result<(), ProjectionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;

        let mut names = Vec::new();
        touched_tables(statement, &mut names);
        let mut staged = HashMap::new();
        for name in names {
            if let Some(table) = state.tables.get(name) {
                staged.insert(name, table.clone());
            }
        }
        execute(&mut staged, statement)?;

        state.tables.extend(staged);
        advance(&mut state.positions, projection, position);
        state.failed.remove(&(projection.to_string(), position));
        Ok(())
    }

    async fn record_failure(
        &self,
        projection: &str,
        position: u64,
        tenant_id: TenantId,
        error: &str,
    ) -> Result<u32, ProjectionError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let record = state
            .failed
            .entry((projection.to_string(), position))
            .or_insert_with(|| FailedEvent {
                projection_name: projection.to_string(),
                failed_position: position,
                failure_count: 0,
                last_error: String::new(),
                tenant_id,
                last_failed_at: now,
            });
        record.failure_count += 1;
        record.last_error = error.to_string();
        record.last_failed_at = now;
        Ok(record.failure_count)
    }

    async fn skip(&self, projection: &str, position: u64) -> Result<(), ProjectionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        advance(&mut state.positions, projection, position);
        Ok(())
    }

    async fn failed_events(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>, ProjectionError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.failed.values().filter(|e| filter.matches(e)).cloned().collect())
    }

    async fn remove_failed_event(&self, projection: &str, position: u64) -> Result<bool, ProjectionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Ok(state.failed.remove(&(projection.to_string(), position)).is_some())
    }

    async fn select(&self, table: &Table, conditions: &[Condition]) -> Result<Vec<Row>, ProjectionError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let stored = state
            .tables
            .get(table.name)
            .ok_or_else(|| ProjectionError::Execution(format!("relation {} does not exist", table.name)))?;
        stored.check_conditions(conditions)?;
        Ok(stored
            .rows
            .iter()
            .filter(|row| row_matches(row, conditions))
            .cloned()
            .collect())
    }
}
