use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{DbTrigger, JobDefinitionId, TenantId, TriggerId, TriggerMetadata};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::TriggerStore;
use crate::error::{HarvestError, Result};

const TRIGGER_COLUMNS: &str = "id, integration_key, trigger_type, tenant_id, \
    job_definition_id, controller_name, created_at, enabled, metadata";

#[derive(Clone)]
pub struct PostgresTriggerStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresTriggerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTriggerStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    integration_key: String,
    trigger_type: String,
    tenant_id: String,
    job_definition_id: Uuid,
    controller_name: String,
    created_at: Option<DateTime<Utc>>,
    enabled: bool,
    metadata: Value,
}

impl TryFrom<TriggerRow> for DbTrigger {
    type Error = HarvestError;

    fn try_from(row: TriggerRow) -> Result<Self> {
        let metadata = match row.metadata {
            Value::Object(map) => TriggerMetadata::from_map(map),
            Value::Null => TriggerMetadata::new(),
            other => {
                return Err(HarvestError::Store(format!(
                    "trigger {} metadata is not an object: {other}",
                    row.id
                )));
            }
        };
        Ok(DbTrigger {
            id: TriggerId::from(row.id),
            integration_key: row.integration_key,
            trigger_type: row.trigger_type,
            tenant_id: TenantId::new(row.tenant_id),
            job_definition_id: JobDefinitionId::from(row.job_definition_id),
            controller_name: row.controller_name,
            created_at: row.created_at,
            enabled: row.enabled,
            metadata,
        })
    }
}

impl PostgresTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PostgresTriggerStore {
    async fn list_active(&self) -> Result<Vec<DbTrigger>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE enabled \
             ORDER BY created_at NULLS FIRST, id"
        );
        sqlx::query_as::<_, TriggerRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DbTrigger::try_from)
            .collect()
    }

    async fn get(&self, id: TriggerId) -> Result<Option<DbTrigger>> {
        let sql = format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = $1");
        sqlx::query_as::<_, TriggerRow>(&sql)
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(DbTrigger::try_from)
            .transpose()
    }

    async fn save(&self, trigger: DbTrigger) -> Result<()> {
        sqlx::query(
            "INSERT INTO triggers (id, integration_key, trigger_type, tenant_id, \
             job_definition_id, controller_name, created_at, enabled, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
               integration_key = EXCLUDED.integration_key, \
               trigger_type = EXCLUDED.trigger_type, \
               tenant_id = EXCLUDED.tenant_id, \
               job_definition_id = EXCLUDED.job_definition_id, \
               controller_name = EXCLUDED.controller_name, \
               created_at = EXCLUDED.created_at, \
               enabled = EXCLUDED.enabled, \
               metadata = EXCLUDED.metadata, \
               updated_at = NOW()",
        )
        .bind(trigger.id.to_uuid())
        .bind(&trigger.integration_key)
        .bind(&trigger.trigger_type)
        .bind(trigger.tenant_id.as_str())
        .bind(trigger.job_definition_id.to_uuid())
        .bind(&trigger.controller_name)
        .bind(trigger.created_at)
        .bind(trigger.enabled)
        .bind(trigger.metadata.into_value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_metadata(
        &self,
        id: TriggerId,
        metadata: TriggerMetadata,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE triggers SET metadata = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.to_uuid())
        .bind(metadata.into_value())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HarvestError::NotFound(format!("trigger {id}")));
        }
        Ok(())
    }

    async fn compare_and_swap_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE triggers SET metadata = $3, updated_at = NOW() \
             WHERE id = $1 AND metadata = $2",
        )
        .bind(id.to_uuid())
        .bind(expected.clone().into_value())
        .bind(metadata.into_value())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM triggers WHERE id = $1)")
                .bind(id.to_uuid())
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(HarvestError::NotFound(format!("trigger {id}")));
        }
        Ok(false)
    }
}
