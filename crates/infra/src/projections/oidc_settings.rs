//! Per-instance OIDC token lifetimes.

use keyward_auth::{InstanceEvent, instance};
use keyward_events::{
    Column, ColumnDef, ColumnType, Condition, Projection, ProjectionError, Statement, StoredEvent, Subscription, Table,
};

pub const OIDC_SETTINGS_TABLE: &str = "projections.oidc_settings";

#[derive(Debug, Clone, Copy, Default)]
pub struct OidcSettingsProjection;

impl Projection for OidcSettingsProjection {
    fn name(&self) -> &'static str {
        "oidc_settings"
    }

    fn schema(&self) -> Table {
        Table::new(
            OIDC_SETTINGS_TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("access_token_lifetime_secs", ColumnType::Int64),
                ColumnDef::new("refresh_token_expiration_secs", ColumnType::Int64),
                ColumnDef::new("refresh_token_idle_expiration_secs", ColumnType::Int64),
                ColumnDef::new("change_date", ColumnType::Timestamp),
                ColumnDef::new("sequence", ColumnType::Int64),
            ],
            vec!["instance_id"],
        )
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(instance::AGGREGATE_TYPE, &[
            "instance.oidc.settings.added",
            "instance.oidc.settings.changed",
        ])]
    }

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        if event.aggregate_type != instance::AGGREGATE_TYPE {
            return Ok(Statement::NoOp);
        }
        let decoded: InstanceEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        let instance_id = event.tenant_id.to_string();
        Ok(match decoded {
            InstanceEvent::OidcSettingsAdded {
                access_token_lifetime_secs,
                refresh_token_expiration_secs,
                refresh_token_idle_expiration_secs,
            } => Statement::Upsert {
                table: OIDC_SETTINGS_TABLE,
                columns: vec![
                    Column::new("instance_id", instance_id),
                    Column::new("access_token_lifetime_secs", access_token_lifetime_secs),
                    Column::new("refresh_token_expiration_secs", refresh_token_expiration_secs),
                    Column::new("refresh_token_idle_expiration_secs", refresh_token_idle_expiration_secs),
                    Column::new("change_date", event.created_at),
                    Column::new("sequence", event.sequence),
                ],
                conflict_columns: vec!["instance_id"],
            },
            InstanceEvent::OidcSettingsChanged {
                access_token_lifetime_secs,
                refresh_token_expiration_secs,
                refresh_token_idle_expiration_secs,
            } => {
                let changed = [
                    ("access_token_lifetime_secs", access_token_lifetime_secs),
                    ("refresh_token_expiration_secs", refresh_token_expiration_secs),
                    ("refresh_token_idle_expiration_secs", refresh_token_idle_expiration_secs),
                ];
                let mut values: Vec<Column> = changed
                    .into_iter()
                    .filter_map(|(name, value)| value.map(|secs| Column::new(name, secs)))
                    .collect();
                values.push(Column::new("change_date", event.created_at));
                values.push(Column::new("sequence", event.sequence));
                Statement::Update {
                    table: OIDC_SETTINGS_TABLE,
                    values,
                    conditions: vec![Condition::new("instance_id", instance_id)],
                }
            }
            InstanceEvent::PasswordAgePolicyAdded { .. } | InstanceEvent::PasswordAgePolicyChanged { .. } => {
                Statement::NoOp
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use keyward_core::TenantId;

    use super::*;
    use crate::projections::testing::stored;

    #[test]
    fn changes_only_touch_present_values() {
        let tenant = TenantId::new();
        let event = InstanceEvent::OidcSettingsChanged {
            access_token_lifetime_secs: Some(60),
            refresh_token_expiration_secs: None,
            refresh_token_idle_expiration_secs: None,
        };
        let instance_id = tenant.instance_id();
        let Statement::Update { values, conditions, .. } =
            OidcSettingsProjection.reduce(&stored(tenant, instance_id.as_str(), 2, &event)).unwrap()
        else {
            panic!("expected update");
        };
        let names: Vec<&str> = values.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["access_token_lifetime_secs", "change_date", "sequence"]);
        assert_eq!(conditions, vec![Condition::new("instance_id", tenant.to_string())]);
    }

    #[test]
    fn added_settings_upsert_the_instance_row() {
        let tenant = TenantId::new();
        let event = InstanceEvent::OidcSettingsAdded {
            access_token_lifetime_secs: 3600,
            refresh_token_expiration_secs: 0,
            refresh_token_idle_expiration_secs: 0,
        };
        let statement = OidcSettingsProjection
            .reduce(&stored(tenant, tenant.instance_id().as_str(), 1, &event))
            .unwrap();
        assert!(matches!(statement, Statement::Upsert { ref conflict_columns, .. } if conflict_columns == &["instance_id"]));
    }
}
