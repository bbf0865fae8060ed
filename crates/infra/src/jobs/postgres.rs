//! Postgres-backed job record store and task queue.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | Store / Queue error |
//! |------------|-----------------|---------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` / `AlreadyEnqueued` |
//! | Database (other) | any | `Storage` / `Unavailable` |
//! | PoolClosed, IO, other | N/A | `Storage` / `Unavailable` |
//!
//! ## Atomicity
//!
//! Record transitions lock the row (`SELECT ... FOR UPDATE`) and apply the
//! same transition rules as the in-memory store inside one transaction.
//! Leases use `FOR UPDATE SKIP LOCKED`, so concurrent workers never pick the
//! same entry; `extend`, `ack` and `retry` are conditional on the lease
//! token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use complyflow_analysis::{AnalysisPayload, InputRef, ResultRef};
use complyflow_core::{DomainError, JobId, TenantId};

use super::queue::{QueueError, TaskQueue};
use super::record_store::{JobRecordStore, StoreError};
use super::types::{
    FailureReason, JobFailure, JobRecord, JobStats, JobStatus, LeaseToken, LeasedTask, NewTask, TaskEntry,
    TaskOutcome, TaskState, chrono_duration,
};

/// Tables used by both adapters. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id               UUID PRIMARY KEY,
    tenant_id        UUID NOT NULL,
    status           TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    progress         SMALLINT NOT NULL DEFAULT 0,
    progress_message TEXT NOT NULL,
    result_ref       TEXT,
    failure_reason   TEXT,
    failure_detail   TEXT,
    input_ref        TEXT NOT NULL,
    frameworks       TEXT[] NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    CONSTRAINT result_ref_iff_completed CHECK ((status = 'completed') = (result_ref IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS analysis_jobs_tenant_updated
    ON analysis_jobs (tenant_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS analysis_tasks (
    job_id       UUID PRIMARY KEY,
    tenant_id    UUID NOT NULL,
    payload      JSONB NOT NULL,
    attempt      INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    state        TEXT NOT NULL CHECK (state IN ('ready', 'leased', 'settled')),
    outcome      TEXT,
    lease_worker TEXT,
    lease_token  UUID,
    leased_until TIMESTAMPTZ,
    available_at TIMESTAMPTZ NOT NULL,
    enqueued_at  TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS analysis_tasks_deliverable
    ON analysis_tasks (state, available_at);
"#;

/// Create the tables if they don't exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

const JOB_COLUMNS: &str = "id, tenant_id, status, progress, progress_message, result_ref, failure_reason, \
     failure_detail, input_ref, frameworks, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Lock the row, apply `f`, write the result back, in one transaction.
    async fn mutate<T, F>(&self, op: &'static str, job_id: JobId, f: F) -> Result<(T, JobRecord), StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<T, DomainError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(|e| store_error(op, e))?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 FOR UPDATE"))
            .bind(*job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| store_error(op, e))?
            .ok_or(StoreError::NotFound(job_id))?;

        let mut record = record_from_row(&row)?;
        let out = f(&mut record)?;

        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2, progress = $3, progress_message = $4, result_ref = $5,
                failure_reason = $6, failure_detail = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.progress_message)
        .bind(record.result_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(record.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(record.failure.as_ref().map(|f| f.detail.clone()))
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error(op, e))?;

        tx.commit().await.map_err(|e| store_error(op, e))?;
        Ok((out, record))
    }

    async fn fetch_for_tenant(&self, op: &'static str, sql: &str, tenant_id: TenantId, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(*tenant_id.as_uuid())
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| store_error(op, e))?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self, record), fields(job_id = %record.id, tenant_id = %record.tenant_id), err)]
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO analysis_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(*record.id.as_uuid())
        .bind(*record.tenant_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.progress_message)
        .bind(record.result_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(record.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(record.failure.as_ref().map(|f| f.detail.clone()))
        .bind(record.input_ref.as_str())
        .bind(&record.frameworks)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                store_error("create", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete_pending(&self, job_id: JobId) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM analysis_jobs WHERE id = $1 AND status = 'pending'")
            .bind(*job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| store_error("delete_pending", e))?
            .rows_affected();

        if deleted == 1 {
            return Ok(());
        }
        match self.get(job_id).await? {
            None => Err(StoreError::NotFound(job_id)),
            Some(r) => Err(StoreError::InvalidTransition(format!(
                "job {job_id} is {}, only pending jobs can be removed",
                r.status
            ))),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"))
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| store_error("get", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get_for_tenant(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        match self.get(job_id).await? {
            Some(r) if r.tenant_id != tenant_id => Err(StoreError::TenantIsolation),
            other => Ok(other),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_processing(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.mutate("mark_processing", job_id, |r| r.start()).await.map(|(_, r)| r)
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    async fn record_progress(&self, job_id: JobId, progress: i16, message: &str) -> Result<i16, StoreError> {
        let message = message.to_string();
        self.mutate("record_progress", job_id, move |r| r.advance(progress, &message))
            .await
            .map(|(p, _)| p)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_completed(&self, job_id: JobId, result_ref: ResultRef) -> Result<JobRecord, StoreError> {
        self.mutate("mark_completed", job_id, move |r| r.complete(result_ref))
            .await
            .map(|(_, r)| r)
    }

    #[instrument(skip(self), fields(job_id = %job_id, reason = failure.reason.as_str()), err)]
    async fn mark_failed(&self, job_id: JobId, failure: JobFailure) -> Result<JobRecord, StoreError> {
        self.mutate("mark_failed", job_id, move |r| r.fail(failure))
            .await
            .map(|(_, r)| r)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn latest_for_tenant(&self, tenant_id: TenantId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE tenant_id = $1 ORDER BY updated_at DESC, id DESC LIMIT $2"
        );
        Ok(self.fetch_for_tenant("latest_for_tenant", &sql, tenant_id, 1).await?.into_iter().next())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE tenant_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.fetch_for_tenant("list_recent", &sql, tenant_id, limit).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM analysis_jobs WHERE tenant_id = $1 GROUP BY status")
            .bind(*tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| store_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| store_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| store_error("stats", e))?;
            let status: JobStatus = status.parse()?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let map = |e: sqlx::Error| StoreError::Storage(format!("failed to decode job row: {e}"));

    let status: String = row.try_get("status").map_err(map)?;
    let result_ref: Option<String> = row.try_get("result_ref").map_err(map)?;
    let failure_reason: Option<String> = row.try_get("failure_reason").map_err(map)?;
    let failure_detail: Option<String> = row.try_get("failure_detail").map_err(map)?;
    let input_ref: String = row.try_get("input_ref").map_err(map)?;

    let failure = match failure_reason {
        Some(reason) => Some(JobFailure::new(
            reason.parse::<FailureReason>()?,
            failure_detail.unwrap_or_default(),
        )),
        None => None,
    };

    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map)?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(map)?),
        status: status.parse()?,
        progress: row.try_get("progress").map_err(map)?,
        progress_message: row.try_get("progress_message").map_err(map)?,
        result_ref: result_ref.map(ResultRef::new),
        failure,
        input_ref: InputRef::new(input_ref)?,
        frameworks: row.try_get("frameworks").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn store_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::Storage(format!("database error in {operation}: {}", db.message())),
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTaskQueue {
    pool: Arc<PgPool>,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Distinguish "never existed" from "lease no longer ours" after a
    /// conditional update touched nothing.
    async fn missing_or_lost(&self, job_id: JobId) -> QueueError {
        match self.get(job_id).await {
            Ok(Some(_)) => QueueError::LeaseLost(job_id),
            Ok(None) => QueueError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    #[instrument(skip(self, task), fields(job_id = %task.job_id, tenant_id = %task.tenant_id), err)]
    async fn enqueue(&self, task: NewTask) -> Result<(), QueueError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO analysis_tasks
                (job_id, tenant_id, payload, attempt, max_attempts, state, available_at, enqueued_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, 'ready', $5, $5, $5)
            "#,
        )
        .bind(*task.job_id.as_uuid())
        .bind(*task.tenant_id.as_uuid())
        .bind(Json(&task.payload))
        .bind(i32::try_from(task.max_attempts).unwrap_or(i32::MAX))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::AlreadyEnqueued(task.job_id)
            } else {
                queue_error("enqueue", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn lease(&self, worker: &str, lease_for: Duration) -> Result<Option<LeasedTask>, QueueError> {
        let now = Utc::now();
        let token = LeaseToken::new();
        let until = now + chrono_duration(lease_for);

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT job_id
                FROM analysis_tasks
                WHERE (state = 'ready' AND available_at <= $4)
                   OR (state = 'leased' AND leased_until <= $4)
                ORDER BY CASE WHEN state = 'leased' THEN leased_until ELSE available_at END, enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE analysis_tasks t
            SET attempt = CASE WHEN t.state = 'leased' THEN t.attempt + 1 ELSE t.attempt END,
                state = 'leased',
                lease_worker = $1,
                lease_token = $2,
                leased_until = $3,
                updated_at = $4
            FROM next
            WHERE t.job_id = next.job_id
            RETURNING t.job_id, t.tenant_id, t.payload, t.attempt, t.max_attempts
            "#,
        )
        .bind(worker)
        .bind(token.as_uuid())
        .bind(until)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| queue_error("lease", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let map = |e: sqlx::Error| QueueError::Unavailable(format!("failed to decode task row: {e}"));
        let payload: Json<AnalysisPayload> = row.try_get("payload").map_err(map)?;
        let attempt: i32 = row.try_get("attempt").map_err(map)?;
        let max_attempts: i32 = row.try_get("max_attempts").map_err(map)?;

        Ok(Some(LeasedTask {
            job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id").map_err(map)?),
            tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(map)?),
            payload: payload.0,
            attempt: attempt.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
            token,
            leased_until: until,
        }))
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id, attempt = lease.attempt), err)]
    async fn extend(&self, lease: &LeasedTask, lease_for: Duration) -> Result<(), QueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET leased_until = $3, updated_at = $4
            WHERE job_id = $1 AND state = 'leased' AND lease_token = $2 AND attempt = $5
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(now + chrono_duration(lease_for))
        .bind(now)
        .bind(i32::try_from(lease.attempt).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| queue_error("extend", e))?
        .rows_affected();

        if updated == 1 {
            Ok(())
        } else {
            Err(self.missing_or_lost(lease.job_id).await)
        }
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id, outcome = outcome.as_str()), err)]
    async fn ack(&self, lease: &LeasedTask, outcome: TaskOutcome) -> Result<(), QueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET state = 'settled', outcome = $3, lease_token = NULL, leased_until = NULL, updated_at = $4
            WHERE job_id = $1 AND state = 'leased' AND lease_token = $2 AND attempt = $5
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(outcome.as_str())
        .bind(Utc::now())
        .bind(i32::try_from(lease.attempt).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| queue_error("ack", e))?
        .rows_affected();

        if updated == 1 {
            Ok(())
        } else {
            Err(self.missing_or_lost(lease.job_id).await)
        }
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id, attempt = lease.attempt), err)]
    async fn retry(&self, lease: &LeasedTask, delay: Duration) -> Result<(), QueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET state = 'ready', attempt = attempt + 1, available_at = $3,
                lease_token = NULL, leased_until = NULL, updated_at = $4
            WHERE job_id = $1 AND state = 'leased' AND lease_token = $2 AND attempt = $5
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(now + chrono_duration(delay))
        .bind(now)
        .bind(i32::try_from(lease.attempt).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| queue_error("retry", e))?
        .rows_affected();

        if updated == 1 {
            Ok(())
        } else {
            Err(self.missing_or_lost(lease.job_id).await)
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<TaskEntry>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, tenant_id, payload, attempt, max_attempts, state, outcome,
                   lease_worker, lease_token, leased_until, available_at, enqueued_at, updated_at
            FROM analysis_tasks
            WHERE job_id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| queue_error("get", e))?;

        row.as_ref().map(task_from_row).transpose()
    }
}

fn task_from_row(row: &PgRow) -> Result<TaskEntry, QueueError> {
    let map = |e: sqlx::Error| QueueError::Unavailable(format!("failed to decode task row: {e}"));

    let state: String = row.try_get("state").map_err(map)?;
    let state = match state.as_str() {
        "ready" => TaskState::Ready,
        "leased" => {
            let token: Option<Uuid> = row.try_get("lease_token").map_err(map)?;
            let until: Option<DateTime<Utc>> = row.try_get("leased_until").map_err(map)?;
            let worker: Option<String> = row.try_get("lease_worker").map_err(map)?;
            TaskState::Leased {
                worker: worker.unwrap_or_default(),
                token: LeaseToken::from_uuid(token.unwrap_or_else(Uuid::nil)),
                until: until.unwrap_or_else(Utc::now),
            }
        }
        "settled" => {
            let outcome: Option<String> = row.try_get("outcome").map_err(map)?;
            TaskState::Settled {
                outcome: match outcome.as_deref() {
                    Some("completed") => TaskOutcome::Completed,
                    _ => TaskOutcome::Failed,
                },
            }
        }
        other => return Err(QueueError::Unavailable(format!("unknown task state '{other}'"))),
    };

    let payload: Json<AnalysisPayload> = row.try_get("payload").map_err(map)?;
    let attempt: i32 = row.try_get("attempt").map_err(map)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(map)?;

    Ok(TaskEntry {
        job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id").map_err(map)?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(map)?),
        payload: payload.0,
        attempt: attempt.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        state,
        available_at: row.try_get("available_at").map_err(map)?,
        enqueued_at: row.try_get("enqueued_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

fn queue_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db) => QueueError::Unavailable(format!("database error in {operation}: {}", db.message())),
        sqlx::Error::PoolClosed => QueueError::Unavailable(format!("connection pool closed in {operation}")),
        other => QueueError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
