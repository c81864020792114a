//! Per-instance password-age policy.

use keyward_auth::{InstanceEvent, instance};
use keyward_events::{
    Column, ColumnDef, ColumnType, Condition, Projection, ProjectionError, Statement, StoredEvent, Subscription, Table,
};

pub const PASSWORD_AGE_POLICIES_TABLE: &str = "projections.password_age_policies";

#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordAgePolicyProjection;

fn days(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Projection for PasswordAgePolicyProjection {
    fn name(&self) -> &'static str {
        "password_age_policies"
    }

    fn schema(&self) -> Table {
        Table::new(
            PASSWORD_AGE_POLICIES_TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("expire_warn_days", ColumnType::Int64),
                ColumnDef::new("max_age_days", ColumnType::Int64),
                ColumnDef::new("change_date", ColumnType::Timestamp),
                ColumnDef::new("sequence", ColumnType::Int64),
            ],
            vec!["instance_id"],
        )
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(instance::AGGREGATE_TYPE, &[
            "instance.policy.password.age.added",
            "instance.policy.password.age.changed",
        ])]
    }

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        if event.aggregate_type != instance::AGGREGATE_TYPE {
            return Ok(Statement::NoOp);
        }
        let decoded: InstanceEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        let instance_id = event.tenant_id.to_string();
        Ok(match decoded {
            InstanceEvent::PasswordAgePolicyAdded {
                expire_warn_days,
                max_age_days,
            } => Statement::Upsert {
                table: PASSWORD_AGE_POLICIES_TABLE,
                columns: vec![
                    Column::new("instance_id", instance_id),
                    Column::new("expire_warn_days", days(expire_warn_days)),
                    Column::new("max_age_days", days(max_age_days)),
                    Column::new("change_date", event.created_at),
                    Column::new("sequence", event.sequence),
                ],
                conflict_columns: vec!["instance_id"],
            },
            InstanceEvent::PasswordAgePolicyChanged {
                expire_warn_days,
                max_age_days,
            } => {
                let mut values = Vec::with_capacity(4);
                if let Some(value) = expire_warn_days {
                    values.push(Column::new("expire_warn_days", days(value)));
                }
                if let Some(value) = max_age_days {
                    values.push(Column::new("max_age_days", days(value)));
                }
                values.push(Column::new("change_date", event.created_at));
                values.push(Column::new("sequence", event.sequence));
                Statement::Update {
                    table: PASSWORD_AGE_POLICIES_TABLE,
                    values,
                    conditions: vec![Condition::new("instance_id", instance_id)],
                }
            }
            InstanceEvent::OidcSettingsAdded { .. } | InstanceEvent::OidcSettingsChanged { .. } => Statement::NoOp,
        })
    }
}
