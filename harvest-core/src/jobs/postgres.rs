use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{
    AgentId, JobDefinitionId, JobInstance, JobInstanceId, JobStatus,
    NewJobInstance,
};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{FailureOutcome, JobInstanceStore, state::ORPHAN_ERROR};
use crate::error::{HarvestError, Result};

const JOB_COLUMNS: &str = "instance_id, job_definition_id, controller_name, \
    definition_version, worker_id, status, priority, attempt_count, attempt_max, \
    timeout_in_minutes, scheduled_start_time, start_time, last_heartbeat, \
    end_time, payload, tags, last_error, created_at";

/// Shared `SET` clause charging one attempt; mirrors `state::fail`. `now` and
/// `error` are the statement's placeholders for those values.
fn charge_attempt_set(now: &str, error: &str) -> String {
    format!(
        "attempt_count = LEAST(attempt_count + 1, attempt_max),
         last_error = {error},
         worker_id = NULL,
         status = CASE WHEN attempt_count + 1 >= attempt_max
                       THEN 'FAILURE' ELSE 'UNASSIGNED' END,
         start_time = CASE WHEN attempt_count + 1 >= attempt_max
                           THEN start_time ELSE NULL END,
         last_heartbeat = CASE WHEN attempt_count + 1 >= attempt_max
                               THEN last_heartbeat ELSE NULL END,
         end_time = CASE WHEN attempt_count + 1 >= attempt_max
                         THEN {now} ELSE end_time END"
    )
}

const STALE_PREDICATE: &str = "status = 'PENDING' \
    AND COALESCE(last_heartbeat, start_time) \
        + make_interval(mins => timeout_in_minutes) < $NOW";

/// Durable job store. Every transition is a single conditional `UPDATE`, so
/// concurrent workers race on the row and exactly one wins.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    instance_id: Uuid,
    job_definition_id: Uuid,
    controller_name: String,
    definition_version: i32,
    worker_id: Option<String>,
    status: String,
    priority: i32,
    attempt_count: i32,
    attempt_max: i32,
    timeout_in_minutes: i32,
    scheduled_start_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    tags: serde_json::Value,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        HarvestError::Store(format!("negative {column} in job_instances: {value}"))
    })
}

fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        HarvestError::InvalidState(format!("{column} out of range: {value}"))
    })
}

impl TryFrom<JobRow> for JobInstance {
    type Error = HarvestError;

    fn try_from(row: JobRow) -> Result<Self> {
        let tags: BTreeMap<String, String> = serde_json::from_value(row.tags)?;
        Ok(JobInstance {
            instance_id: JobInstanceId::from(row.instance_id),
            job_definition_id: JobDefinitionId::from(row.job_definition_id),
            controller_name: row.controller_name,
            definition_version: to_u32("definition_version", row.definition_version)?,
            worker_id: row.worker_id.map(AgentId::new),
            status: JobStatus::parse(&row.status)?,
            priority: row.priority,
            attempt_count: to_u32("attempt_count", row.attempt_count)?,
            attempt_max: to_u32("attempt_max", row.attempt_max)?,
            timeout_in_minutes: to_u32("timeout_in_minutes", row.timeout_in_minutes)?,
            scheduled_start_time: row.scheduled_start_time,
            start_time: row.start_time,
            last_heartbeat: row.last_heartbeat,
            end_time: row.end_time,
            payload: row.payload,
            tags,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn into_outcome(row: JobRow) -> Result<FailureOutcome> {
    let job = JobInstance::try_from(row)?;
    Ok(if job.status == JobStatus::Failure {
        FailureOutcome::Exhausted(job)
    } else {
        FailureOutcome::Requeued(job)
    })
}

fn collect(rows: Vec<JobRow>) -> Result<Vec<JobInstance>> {
    rows.into_iter().map(JobInstance::try_from).collect()
}

impl PostgresJobStore {
    /// Connects the store and verifies the schema is migrated.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                HarvestError::Store(format!(
                    "Job store failed Postgres health check: {e}"
                ))
            })?;

        let idx_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("idx_job_instances_claimable")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !idx_exists {
            return Err(HarvestError::Store(
                "Required index idx_job_instances_claimable is missing; run migrations".into(),
            ));
        }

        info!("Job store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobInstanceStore for PostgresJobStore {
    async fn insert(
        &self,
        request: NewJobInstance,
        now: DateTime<Utc>,
    ) -> Result<JobInstance> {
        let job = request.into_instance(JobInstanceId::new(), now);
        let tags = serde_json::to_value(&job.tags)?;
        let sql = format!(
            "INSERT INTO job_instances (instance_id, job_definition_id, \
             controller_name, definition_version, status, priority, \
             attempt_count, attempt_max, timeout_in_minutes, \
             scheduled_start_time, payload, tags, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $10, $11, $12) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.instance_id.to_uuid())
            .bind(job.job_definition_id.to_uuid())
            .bind(&job.controller_name)
            .bind(to_i32("definition_version", job.definition_version)?)
            .bind(job.status.as_str())
            .bind(job.priority)
            .bind(to_i32("attempt_max", job.attempt_max)?)
            .bind(to_i32("timeout_in_minutes", job.timeout_in_minutes)?)
            .bind(job.scheduled_start_time)
            .bind(&job.payload)
            .bind(tags)
            .bind(job.created_at)
            .fetch_one(&self.pool)
            .await?;
        debug!(instance = %job.instance_id, controller = %job.controller_name, "job inserted");
        JobInstance::try_from(row)
    }

    async fn get(&self, id: JobInstanceId) -> Result<Option<JobInstance>> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM job_instances WHERE instance_id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(JobInstance::try_from)
            .transpose()
    }

    async fn list_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobInstance>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_instances \
             WHERE status = 'UNASSIGNED' AND worker_id IS NULL \
               AND scheduled_start_time <= $1 \
             ORDER BY priority ASC, scheduled_start_time ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn list_owned(&self, worker: &AgentId) -> Result<Vec<JobInstance>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_instances \
             WHERE status = 'PENDING' AND worker_id = $1"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker.as_str())
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn try_claim(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // SKIP LOCKED turns a concurrent claim into an immediate miss
        // instead of a wait on the loser's side.
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET status = 'PENDING',
                worker_id = $2,
                start_time = $3,
                last_heartbeat = $3
            WHERE instance_id = (
                SELECT instance_id
                FROM job_instances
                WHERE instance_id = $1
                  AND status = 'UNASSIGNED'
                  AND worker_id IS NULL
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(id.to_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unclaim(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET status = 'UNASSIGNED',
                worker_id = NULL,
                start_time = NULL,
                last_heartbeat = NULL
            WHERE instance_id = $1
              AND worker_id = $2
              AND status = 'PENDING'
            "#,
        )
        .bind(id.to_uuid())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(
        &self,
        ids: &[JobInstanceId],
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(JobInstanceId::to_uuid).collect();
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET last_heartbeat = GREATEST(COALESCE(last_heartbeat, $3), $3)
            WHERE instance_id = ANY($1)
              AND worker_id = $2
              AND status = 'PENDING'
            "#,
        )
        .bind(ids)
        .bind(worker.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn complete(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET status = 'SUCCESS',
                end_time = $3,
                last_error = NULL
            WHERE instance_id = $1
              AND worker_id = $2
              AND status = 'PENDING'
            "#,
        )
        .bind(id.to_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<FailureOutcome>> {
        let sql = format!(
            "UPDATE job_instances SET {set} \
             WHERE instance_id = $1 AND worker_id = $2 AND status = 'PENDING' \
             RETURNING {JOB_COLUMNS}",
            set = charge_attempt_set("$3", "$4"),
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.to_uuid())
            .bind(worker.as_str())
            .bind(now)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?
            .map(into_outcome)
            .transpose()
    }

    async fn list_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobInstance>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_instances WHERE {pred} \
             ORDER BY last_heartbeat ASC NULLS FIRST",
            pred = STALE_PREDICATE.replace("$NOW", "$1"),
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn requeue_orphan(
        &self,
        id: JobInstanceId,
        observed_heartbeat: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let sql = format!(
            "UPDATE job_instances SET {set} \
             WHERE instance_id = $1 \
               AND last_heartbeat IS NOT DISTINCT FROM $2 \
               AND {pred} \
             RETURNING {JOB_COLUMNS}",
            set = charge_attempt_set("$3", "$4"),
            pred = STALE_PREDICATE.replace("$NOW", "$3"),
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.to_uuid())
            .bind(observed_heartbeat)
            .bind(now)
            .bind(ORPHAN_ERROR)
            .fetch_optional(&self.pool)
            .await?
            .map(into_outcome)
            .transpose()
    }
}
