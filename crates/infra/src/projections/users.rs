//! Users projection for identity read models.
//!
//! One row per human user and tenant. Password hashes never reach the read
//! model; only whether a password is set and when it last changed.

use keyward_auth::{HumanEvent, UserState, user};
use keyward_events::{
    Column, ColumnDef, ColumnType, Condition, Projection, ProjectionError, Statement, StoredEvent, Subscription, Table,
};

pub const USERS_TABLE: &str = "projections.users";

// ─────────────────────────────────────────────────────────────────────────────
// Projection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct UserProjection;

fn key(event: &StoredEvent) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.tenant_id.to_string()),
        Condition::new("id", event.aggregate_id.as_str()),
    ]
}

fn update(event: &StoredEvent, mut values: Vec<Column>) -> Statement {
    values.push(Column::new("change_date", event.created_at));
    values.push(Column::new("sequence", event.sequence));
    Statement::Update {
        table: USERS_TABLE,
        values,
        conditions: key(event),
    }
}

impl Projection for UserProjection {
    fn name(&self) -> &'static str {
        "users"
    }

    fn schema(&self) -> Table {
        Table::new(
            USERS_TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("resource_owner", ColumnType::Text),
                ColumnDef::new("state", ColumnType::Text),
                ColumnDef::new("username", ColumnType::Text),
                ColumnDef::new("email", ColumnType::Text),
                ColumnDef::new("email_verified", ColumnType::Bool),
                ColumnDef::new("password_set", ColumnType::Bool),
                ColumnDef::new("password_changed_at", ColumnType::Timestamp).nullable(),
                ColumnDef::new("creation_date", ColumnType::Timestamp),
                ColumnDef::new("change_date", ColumnType::Timestamp),
                ColumnDef::new("sequence", ColumnType::Int64),
            ],
            vec!["instance_id", "id"],
        )
        .with_index("users_username_idx", vec!["instance_id", "username"])
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(user::AGGREGATE_TYPE, &[
            "user.human.added",
            "user.human.email.changed",
            "user.human.email.verified",
            "user.human.password.changed",
            "user.removed",
        ])]
    }

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        if event.aggregate_type != user::AGGREGATE_TYPE {
            return Ok(Statement::NoOp);
        }
        let decoded: HumanEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        Ok(match decoded {
            HumanEvent::Added {
                username,
                email,
                encoded_hash,
            } => {
                let password_changed_at = encoded_hash.as_ref().map(|_| event.created_at);
                Statement::Create {
                    table: USERS_TABLE,
                    columns: vec![
                        Column::new("instance_id", event.tenant_id.to_string()),
                        Column::new("id", event.aggregate_id.as_str()),
                        Column::new("resource_owner", event.resource_owner.as_str()),
                        Column::new("state", UserState::Active.as_str()),
                        Column::new("username", username),
                        Column::new("email", email),
                        Column::new("email_verified", false),
                        Column::new("password_set", encoded_hash.is_some()),
                        Column::new("password_changed_at", password_changed_at),
                        Column::new("creation_date", event.created_at),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.sequence),
                    ],
                }
            }
            HumanEvent::EmailChanged { email } => update(
                event,
                vec![Column::new("email", email), Column::new("email_verified", false)],
            ),
            HumanEvent::EmailVerified => update(event, vec![Column::new("email_verified", true)]),
            HumanEvent::PasswordChanged { .. } => update(
                event,
                vec![
                    Column::new("password_set", true),
                    Column::new("password_changed_at", event.created_at),
                ],
            ),
            HumanEvent::Removed { .. } => Statement::Delete {
                table: USERS_TABLE,
                conditions: key(event),
            },
            HumanEvent::EmailCodeAdded { .. }
            | HumanEvent::EmailVerificationFailed
            | HumanEvent::MetadataSet { .. }
            | HumanEvent::MetadataRemoved { .. } => Statement::NoOp,
        })
    }
}
