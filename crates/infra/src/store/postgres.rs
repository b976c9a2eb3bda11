//! Postgres-backed job store.
//!
//! Status changes run in a transaction that locks the row (`SELECT ... FOR
//! UPDATE`), applies the domain state machine in Rust and writes the result
//! back, so concurrent workers cannot interleave a read-modify-write on the
//! same task or job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `Unavailable` (job row missing) |
//! | Database (other) | any | `Unavailable` |
//! | PoolClosed / Io / Other | n/a | `Unavailable` |
//!
//! ## Finalization claims
//!
//! `jobs.finalize_lease_until` holds the claim of the finalizer currently
//! working on a job. It is taken under the same row lock as status changes,
//! which makes it the fan-in barrier shared by every process on the
//! database.
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous and is called from plain worker threads. The
//! store keeps a handle to a tokio runtime and `block_on`s each query on it;
//! it must therefore not be called from inside an async task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use docbatch_core::{
    FileStatus, FileTask, FileTaskId, FileTaskUpdate, Job, JobId, JobStatus,
};

use super::{lease_expiry, FinalizeClaim, JobStore, StoreError};

/// Schema applied by [`PostgresJobStore::migrate`]. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              UUID PRIMARY KEY,
    status          TEXT        NOT NULL,
    file_count      BIGINT      NOT NULL CHECK (file_count >= 0),
    completed_count BIGINT      NOT NULL DEFAULT 0,
    failed_count    BIGINT      NOT NULL DEFAULT 0,
    artifact        TEXT        NULL,
    error_message   TEXT        NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    CHECK (completed_count + failed_count <= file_count)
);

CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status);

CREATE TABLE IF NOT EXISTS file_tasks (
    id            UUID PRIMARY KEY,
    job_id        UUID        NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    name          TEXT        NOT NULL,
    status        TEXT        NOT NULL,
    error_message TEXT        NULL,
    output_ref    TEXT        NULL,
    attempt       INTEGER     NOT NULL DEFAULT 0,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    UNIQUE (job_id, name)
);

CREATE INDEX IF NOT EXISTS file_tasks_job_status_idx ON file_tasks (job_id, status);

ALTER TABLE jobs ADD COLUMN IF NOT EXISTS finalize_lease_until TIMESTAMPTZ NULL;
"#;

const JOB_COLUMNS: &str = "id, status, file_count, completed_count, failed_count, \
                           artifact, error_message, created_at, updated_at";

const TASK_COLUMNS: &str = "id, job_id, name, status, error_message, output_ref, \
                            attempt, created_at, updated_at";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool. `runtime` drives every query.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect to `database_url` on `runtime` and apply the schema.
    pub fn connect(database_url: &str, runtime: Handle) -> Result<Self, StoreError> {
        let pool = runtime
            .block_on(PgPool::connect(database_url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, runtime);
        store.block_on(store.migrate())?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("job store schema applied");
        Ok(())
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    async fn insert_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError> {
        let job = Job::new(id, file_count);
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, file_count, completed_count, failed_count,
                              created_at, updated_at)
            VALUES ($1, $2, $3, 0, 0, $4, $5)
            "#,
        )
        .bind(*id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.file_count as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;
        Ok(job)
    }

    async fn insert_file_tasks(
        &self,
        job_id: JobId,
        names: &[String],
    ) -> Result<Vec<FileTask>, StoreError> {
        let mut tx = self.begin().await?;

        let job = lock_job(&mut tx, job_id).await?;
        let existing: i64 = sqlx::query("SELECT COUNT(*) FROM file_tasks WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|e| map_sqlx_error("create_file_tasks", e))?;
        if existing as usize + names.len() > job.file_count {
            return Err(docbatch_core::DomainError::invariant(format!(
                "job {job_id} expects {} files, got {}",
                job.file_count,
                existing as usize + names.len()
            ))
            .into());
        }

        let mut created = Vec::with_capacity(names.len());
        for name in names {
            let task = FileTask::new(job_id, name.clone())?;
            sqlx::query(
                r#"
                INSERT INTO file_tasks (id, job_id, name, status, attempt, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 0, $5, $6)
                "#,
            )
            .bind(*task.id.as_uuid())
            .bind(*job_id.as_uuid())
            .bind(&task.name)
            .bind(task.status.as_str())
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_file_tasks", e))?;
            created.push(task);
        }

        commit(tx, "create_file_tasks").await?;
        Ok(created)
    }

    async fn fetch_job(&self, id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .ok_or(StoreError::JobNotFound(id))?;
        job_from_row(&row)
    }

    async fn fetch_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM file_tasks WHERE job_id = $1 AND name = $2"
        ))
        .bind(*job_id.as_uuid())
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_file_task", e))?;

        match row {
            Some(row) => task_from_row(&row),
            // Distinguish "job deleted" from "no such file in a live job".
            None => {
                self.fetch_job(job_id).await?;
                Err(StoreError::FileTaskNotFound(format!("{name} in job {job_id}")))
            }
        }
    }

    async fn fetch_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError> {
        self.fetch_job(job_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM file_tasks WHERE job_id = $1 ORDER BY created_at, id"
        ))
        .bind(*job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_file_tasks", e))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn fetch_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs_by_status", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, update), fields(file_task_id = %id), err)]
    async fn apply_file_task_update(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM file_tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_file_task_status", e))?
        .ok_or_else(|| StoreError::FileTaskNotFound(id.to_string()))?;

        let mut task = task_from_row(&row)?;
        task.apply(update)?;

        sqlx::query(
            r#"
            UPDATE file_tasks
            SET status = $2, error_message = $3, output_ref = $4, attempt = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.error_message.as_deref())
        .bind(task.output_ref.as_deref())
        .bind(task.attempt as i32)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_file_task_status", e))?;

        commit(tx, "update_file_task_status").await?;
        Ok(task)
    }

    async fn count_by_status(&self, job_id: JobId, status: FileStatus) -> Result<usize, StoreError> {
        self.fetch_job(job_id).await?;
        let count: i64 =
            sqlx::query("SELECT COUNT(*) FROM file_tasks WHERE job_id = $1 AND status = $2")
                .bind(*job_id.as_uuid())
                .bind(status.as_str())
                .fetch_one(&*self.pool)
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|e| map_sqlx_error("count_file_tasks_by_status", e))?;
        Ok(count as usize)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn apply_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        job.transition(status, completed_count, failed_count)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, completed_count = $3, failed_count = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.completed_count as i64)
        .bind(job.failed_count as i64)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_job_status", e))?;

        commit(tx, "update_job_status").await?;
        Ok(job)
    }

    async fn apply_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let job = lock_job(&mut tx, id).await?;
        if job.is_terminal() {
            return Err(docbatch_core::DomainError::invariant(format!(
                "job {id} is already finalized"
            ))
            .into());
        }

        sqlx::query(
            "UPDATE jobs SET artifact = $2, error_message = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .bind(artifact.as_deref())
        .bind(error_message.as_deref())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_job_result", e))?;

        commit(tx, "set_job_result").await
    }

    async fn remove_job(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn claim(&self, id: JobId, lease: Duration) -> Result<FinalizeClaim, StoreError> {
        let mut tx = self.begin().await?;
        let job = lock_job(&mut tx, id).await?;
        if job.is_terminal() {
            return Ok(FinalizeClaim::Terminal);
        }

        let now = Utc::now();
        let held_until: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT finalize_lease_until FROM jobs WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("claim_finalization", e))?;
        if held_until.is_some_and(|until| until > now) {
            return Ok(FinalizeClaim::Held);
        }

        let terminal: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_tasks WHERE job_id = $1 AND status IN ($2, $3)",
        )
        .bind(*id.as_uuid())
        .bind(FileStatus::Completed.as_str())
        .bind(FileStatus::Failed.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_finalization", e))?;
        if (terminal as usize) < job.file_count {
            return Ok(FinalizeClaim::Outstanding);
        }

        sqlx::query("UPDATE jobs SET finalize_lease_until = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(lease_expiry(now, lease))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_finalization", e))?;
        commit(tx, "claim_finalization").await?;
        debug!(job_id = %id, "finalization claimed");
        Ok(FinalizeClaim::Acquired(job))
    }

    async fn release_claim(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET finalize_lease_until = NULL WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_finalization", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }
}

async fn lock_job(tx: &mut Transaction<'static, Postgres>, id: JobId) -> Result<Job, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(*id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?
    .ok_or(StoreError::JobNotFound(id))?;
    job_from_row(&row)
}

async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> Result<(), StoreError> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Unavailable(format!("failed to decode job row: {e}"));
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let file_count: i64 = row.try_get("file_count").map_err(decode)?;
    let completed_count: i64 = row.try_get("completed_count").map_err(decode)?;
    let failed_count: i64 = row.try_get("failed_count").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        status: status.parse()?,
        file_count: file_count as usize,
        completed_count: completed_count as usize,
        failed_count: failed_count as usize,
        artifact: row.try_get("artifact").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        created_at,
        updated_at,
    })
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<FileTask, StoreError> {
    let decode =
        |e: sqlx::Error| StoreError::Unavailable(format!("failed to decode file task row: {e}"));
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let job_id: Uuid = row.try_get("job_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempt: i32 = row.try_get("attempt").map_err(decode)?;

    Ok(FileTask {
        id: FileTaskId::from_uuid(id),
        job_id: JobId::from_uuid(job_id),
        name: row.try_get("name").map_err(decode)?,
        status: status.parse()?,
        error_message: row.try_get("error_message").map_err(decode)?,
        output_ref: row.try_get("output_ref").map_err(decode)?,
        attempt: attempt.max(0) as u32,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23503") => StoreError::Unavailable(format!("{msg} (job row missing)")),
                _ => StoreError::Unavailable(msg),
            }
        }
        other => StoreError::Unavailable(format!("{operation}: {other}")),
    }
}

impl JobStore for PostgresJobStore {
    fn create_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError> {
        self.block_on(self.insert_job(id, file_count))
    }

    fn create_file_tasks(
        &self,
        job_id: JobId,
        names: &[String],
    ) -> Result<Vec<FileTask>, StoreError> {
        self.block_on(self.insert_file_tasks(job_id, names))
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.block_on(self.fetch_job(id))
    }

    fn find_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError> {
        self.block_on(self.fetch_file_task(job_id, name))
    }

    fn list_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError> {
        self.block_on(self.fetch_file_tasks(job_id))
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.block_on(self.fetch_jobs_by_status(status))
    }

    fn update_file_task_status(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError> {
        self.block_on(self.apply_file_task_update(id, update))
    }

    fn count_file_tasks_by_status(
        &self,
        job_id: JobId,
        status: FileStatus,
    ) -> Result<usize, StoreError> {
        self.block_on(self.count_by_status(job_id, status))
    }

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError> {
        self.block_on(self.apply_job_status(id, status, completed_count, failed_count))
    }

    fn set_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.block_on(self.apply_job_result(id, artifact, error_message))
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.block_on(self.remove_job(id))
    }

    fn claim_finalization(
        &self,
        id: JobId,
        lease: Duration,
    ) -> Result<FinalizeClaim, StoreError> {
        self.block_on(self.claim(id, lease))
    }

    fn release_finalization(&self, id: JobId) -> Result<(), StoreError> {
        self.block_on(self.release_claim(id))
    }
}
