//! User metadata read model: one row per user and key.

use keyward_auth::{HumanEvent, user};
use keyward_events::{
    Column, ColumnDef, ColumnType, Condition, Projection, ProjectionError, Statement, StoredEvent, Subscription, Table,
};

pub const USER_METADATA_TABLE: &str = "projections.user_metadata";

#[derive(Debug, Clone, Copy, Default)]
pub struct UserMetadataProjection;

fn user_key(event: &StoredEvent) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.tenant_id.to_string()),
        Condition::new("user_id", event.aggregate_id.as_str()),
    ]
}

impl Projection for UserMetadataProjection {
    fn name(&self) -> &'static str {
        "user_metadata"
    }

    fn schema(&self) -> Table {
        Table::new(
            USER_METADATA_TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("user_id", ColumnType::Text),
                ColumnDef::new("key", ColumnType::Text),
                ColumnDef::new("resource_owner", ColumnType::Text),
                ColumnDef::new("value", ColumnType::Jsonb),
                ColumnDef::new("change_date", ColumnType::Timestamp),
                ColumnDef::new("sequence", ColumnType::Int64),
            ],
            vec!["instance_id", "user_id", "key"],
        )
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(user::AGGREGATE_TYPE, &[
            "user.metadata.set",
            "user.metadata.removed",
            "user.removed",
        ])]
    }

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError> {
        if event.aggregate_type != user::AGGREGATE_TYPE {
            return Ok(Statement::NoOp);
        }
        let decoded: HumanEvent = event.decode().map_err(|e| ProjectionError::reduce(event, e))?;
        Ok(match decoded {
            HumanEvent::MetadataSet { key, value } => {
                let value = serde_json::to_value(&value).map_err(|e| ProjectionError::reduce(event, e))?;
                Statement::Upsert {
                    table: USER_METADATA_TABLE,
                    columns: vec![
                        Column::new("instance_id", event.tenant_id.to_string()),
                        Column::new("user_id", event.aggregate_id.as_str()),
                        Column::new("key", key),
                        Column::new("resource_owner", event.resource_owner.as_str()),
                        Column::new("value", value),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.sequence),
                    ],
                    conflict_columns: vec!["instance_id", "user_id", "key"],
                }
            }
            HumanEvent::MetadataRemoved { key } => {
                let mut conditions = user_key(event);
                conditions.push(Condition::new("key", key));
                Statement::Delete {
                    table: USER_METADATA_TABLE,
                    conditions,
                }
            }
            HumanEvent::Removed { .. } => Statement::Delete {
                table: USER_METADATA_TABLE,
                conditions: user_key(event),
            },
            _ => Statement::NoOp,
        })
    }
}

#[cfg(test)]
mod tests {
    use keyward_core::TenantId;

    use super::*;
    use crate::projections::in_memory::InMemoryProjectionStore;
    use crate::projections::store::ProjectionStore;
    use crate::projections::testing::stored;

    #[tokio::test]
    async fn entries_are_upserted_and_removed_per_key() {
        let tenant = TenantId::new();
        let store = InMemoryProjectionStore::new();
        store.init_schema(&UserMetadataProjection.schema()).await.unwrap();
        let events = [
            HumanEvent::MetadataSet { key: "team".into(), value: b"blue".to_vec() },
            HumanEvent::MetadataSet { key: "team".into(), value: b"red".to_vec() },
            HumanEvent::MetadataSet { key: "floor".into(), value: b"3".to_vec() },
            HumanEvent::MetadataRemoved { key: "floor".into() },
        ];
        for (n, event) in events.iter().enumerate() {
            let position = n as u64 + 1;
            let statement = UserMetadataProjection.reduce(&stored(tenant, "u1", position, event)).unwrap();
            store.apply("user_metadata", &statement, position).await.unwrap();
        }

        let rows = store.select(&UserMetadataProjection.schema(), &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["key"].as_text(), Some("team"));
        assert_eq!(rows[0]["sequence"].as_int(), Some(2));
        assert_eq!(rows[0]["value"].as_json(), Some(&serde_json::json!(b"red".to_vec())));
    }

    #[test]
    fn removing_the_user_drops_all_entries() {
        let tenant = TenantId::new();
        let event = HumanEvent::Removed { username: "alice".into() };
        assert_eq!(
            UserMetadataProjection.reduce(&stored(tenant, "u1", 9, &event)).unwrap(),
            Statement::Delete {
                table: USER_METADATA_TABLE,
                conditions: vec![
                    Condition::new("instance_id", tenant.to_string()),
                    Condition::new("user_id", "u1"),
                ],
            }
        );
        assert!(UserMetadataProjection
            .reduce(&stored(tenant, "u1", 2, &HumanEvent::EmailVerified))
            .unwrap()
            .is_noop());
    }
}
