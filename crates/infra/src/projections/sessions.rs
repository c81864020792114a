//! Read model of login sessions.

use keyward_auth::{HumanEvent, SessionEvent, SessionState, session, user};
use keyward_events::{
    Column, ColumnDef, ColumnType, Condition, Projection, ProjectionError, Statement, StoredEvent, Subscription, Table,
};

pub const SESSIONS_TABLE: &str = "projections.sessions";

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionProjection;

fn key(event: &StoredEvent) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.tenant_id.to_string()),
        Condition::new("id", event.aggregate_id.as_str()),
    ]
}

/// Update the session row, stamping change date and sequence.
fn update(event: &StoredEvent, mut values: Vec<Column>) -> Statement {
    values.push(Column::new("change_date", event.created_at));
    values.push(Column::new("sequence", event.sequence));
    Statement::Update {
        table: SESSIONS_TABLE,
        values,
        conditions: key(event),
    }
}

impl SessionProjection {
    fn reduce_session(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        let decoded: SessionEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        Ok(match decoded {
            SessionEvent::Added => Statement::Create {
                table: SESSIONS_TABLE,
                columns: vec![
                    Column::new("instance_id", event.tenant_id.to_string()),
                    Column::new("id", event.aggregate_id.as_str()),
                    Column::new("resource_owner", event.resource_owner.as_str()),
                    Column::new("state", SessionState::Active.as_str()),
                    Column::new("creation_date", event.created_at),
                    Column::new("change_date", event.created_at),
                    Column::new("sequence", event.sequence),
                    Column::new("metadata", serde_json::json!({})),
                ],
            },
            SessionEvent::UserChecked { user_id, checked_at } => update(
                event,
                vec![
                    Column::new("user_id", user_id.as_str()),
                    Column::new("user_checked_at", checked_at),
                ],
            ),
            SessionEvent::PasswordChecked { checked_at } => {
                update(event, vec![Column::new("password_checked_at", checked_at)])
            }
            SessionEvent::TokenSet { .. } => update(event, Vec::new()),
            SessionEvent::MetadataSet { metadata } => {
                let metadata = serde_json::to_value(&metadata).map_err(|e| ProjectionError::reduce(event, e))?;
                update(event, vec![Column::new("metadata", metadata)])
            }
            SessionEvent::Terminated => update(event, vec![Column::new("state", SessionState::Terminated.as_str())]),
        })
    }

    fn reduce_user(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        let decoded: HumanEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        Ok(match decoded {
            HumanEvent::Removed { .. } => Statement::Delete {
                table: SESSIONS_TABLE,
                conditions: vec![
                    Condition::new("instance_id", event.tenant_id.to_string()),
                    Condition::new("user_id", event.aggregate_id.as_str()),
                ],
            },
            _ => Statement::NoOp,
        })
    }
}

impl Projection for SessionProjection {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn schema(&self) -> Table {
        Table::new(
            SESSIONS_TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("resource_owner", ColumnType::Text),
                ColumnDef::new("state", ColumnType::Text),
                ColumnDef::new("creation_date", ColumnType::Timestamp),
                ColumnDef::new("change_date", ColumnType::Timestamp),
                ColumnDef::new("sequence", ColumnType::Int64),
                ColumnDef::new("user_id", ColumnType::Text).nullable(),
                ColumnDef::new("user_checked_at", ColumnType::Timestamp).nullable(),
                ColumnDef::new("password_checked_at", ColumnType::Timestamp).nullable(),
                ColumnDef::new("metadata", ColumnType::Jsonb),
            ],
            vec!["instance_id", "id"],
        )
        .with_index("sessions_user_idx", vec!["instance_id", "user_id"])
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(session::AGGREGATE_TYPE, &[
                "session.added",
                "session.user.checked",
                "session.password.checked",
                "session.token.set",
                "session.metadata.set",
                "session.terminated",
            ]),
            Subscription::new(user::AGGREGATE_TYPE, &["user.removed"]),
        ]
    }

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        match event.aggregate_type.as_str() {
            session::AGGREGATE_TYPE => self.reduce_session(event),
            user::AGGREGATE_TYPE => self.reduce_user(event),
            _ => Ok(Statement::NoOp),
        }
    }
}
