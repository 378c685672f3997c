//! Postgres-backed job store implementation.
//!
//! All coordination between nodes happens in the database:
//!
//! - `claim` picks rows with `FOR UPDATE SKIP LOCKED`, so concurrent fetchers
//!   never block on (or double-claim) each other's rows
//! - every transition is a conditional `UPDATE ... WHERE state = ...`
//! - `insert_unique` serializes writers of one signature with a transaction
//!   scoped advisory lock, then checks and inserts
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / Other | N/A | `Database` |
//!
//! Row decoding failures (bad state text, malformed error history) map to
//! `Serialization`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use jobforge_core::{AttemptError, ExecutorId, Job, JobId, JobState, ReplaceField, UniqueOpts};

use super::{Cancelled, ExecutorHeartbeat, Inserted, JobFilter, JobStats, JobStore, StoreError};

/// DDL applied by [`PostgresJobStore::install`].
pub const SCHEMA: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, queue, worker, args, state, priority, attempt, max_attempts, \
     scheduled_at, inserted_at, attempted_at, attempted_by, completed_at, discarded_at, \
     cancelled_at, errors, unique_key, tags, meta";

/// Postgres job store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn install(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("install", e))?;
        debug!("job schema installed");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut tx = begin(&self.pool).await?;
        insert_row(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self, job, unique, replace), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn insert_unique(
        &self,
        mut job: Job,
        unique: &UniqueOpts,
        replace: &[ReplaceField],
        now: DateTime<Utc>,
    ) -> Result<Inserted, StoreError> {
        let key = job
            .unique_key
            .clone()
            .unwrap_or_else(|| unique.signature(&job.queue, &job.worker, &job.args));
        job.unique_key = Some(key.clone());

        let mut tx = begin(&self.pool).await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(&key))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("unique_lock", e))?;

        let states: Vec<String> = unique.states.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobforge_jobs
            WHERE unique_key = $1
                AND state = ANY($2)
                AND ($3::timestamptz IS NULL OR inserted_at >= $3)
            ORDER BY inserted_at DESC
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(&key)
        .bind(&states)
        .bind(unique.window_start(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("unique_lookup", e))?;

        let result = match row {
            Some(row) => {
                let mut existing = decode_job(&row)?;
                if existing.replace_from(&job, replace, now) {
                    update_replaced(&mut tx, &existing).await?;
                }
                Inserted::Conflict(existing)
            }
            None => {
                insert_row(&mut tx, &job).await?;
                Inserted::Inserted(job)
            }
        };

        commit(tx).await?;
        Ok(result)
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn insert_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StoreError> {
        if jobs.is_empty() {
            return Ok(jobs);
        }

        let mut tx = begin(&self.pool).await?;
        for job in &jobs {
            insert_row(&mut tx, job).await?;
        }
        commit(tx).await?;
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobforge_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobforge_jobs
            WHERE ($1::text IS NULL OR queue = $1)
                AND ($2::text IS NULL OR worker = $2)
                AND (cardinality($3::text[]) = 0 OR state = ANY($3))
                AND ($4::text IS NULL OR $4 = ANY(tags))
            ORDER BY id
            LIMIT $5
            "#
        ))
        .bind(filter.queue.as_deref())
        .bind(filter.worker.as_deref())
        .bind(&states)
        .bind(filter.tag.as_deref())
        .bind(to_limit(filter.limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(executor = %executor), err)]
    async fn claim(
        &self,
        queue: &str,
        executor: ExecutorId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM jobforge_jobs
                WHERE state = 'available'
                    AND queue = $1
                    AND scheduled_at <= $2
                    AND attempt < max_attempts
                ORDER BY priority, scheduled_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobforge_jobs AS j
            SET state = 'executing',
                attempt = j.attempt + 1,
                attempted_at = $2,
                attempted_by = $4
            FROM picked
            WHERE j.id = picked.id
            RETURNING {}
            "#,
            returning_columns("j")
        ))
        .bind(queue)
        .bind(now)
        .bind(to_limit(limit))
        .bind(executor.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not keep the CTE order.
        jobs.sort_by(|a, b| (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id)));
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state), err)]
    async fn record_outcome(&self, job: &Job) -> Result<bool, StoreError> {
        let Some(owner) = job.attempted_by else {
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE jobforge_jobs
            SET state = $3,
                attempt = $4,
                max_attempts = $5,
                scheduled_at = $6,
                completed_at = $7,
                discarded_at = $8,
                cancelled_at = $9,
                errors = $10
            WHERE id = $1
                AND state = 'executing'
                AND attempted_by = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(owner.as_uuid())
        .bind(job.state.as_str())
        .bind(job.attempt as i32)
        .bind(job.max_attempts as i32)
        .bind(job.scheduled_at)
        .bind(job.completed_at)
        .bind(job.discarded_at)
        .bind(job.cancelled_at)
        .bind(encode_errors(&job.errors)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outcome", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Cancelled>, StoreError> {
        let mut tx = begin(&self.pool).await?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobforge_jobs WHERE id = $1 FOR UPDATE"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_lookup", e))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        let prior = job.state;
        if job.cancel(now) {
            sqlx::query(
                r#"
                UPDATE jobforge_jobs
                SET state = 'cancelled', cancelled_at = $2
                WHERE id = $1
                    AND state IN ('scheduled', 'available', 'executing')
                "#,
            )
            .bind(id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;
        }

        commit(tx).await?;
        Ok(Some(Cancelled { prior, job }))
    }

    #[instrument(skip(self), err)]
    async fn stage_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM jobforge_jobs
                WHERE state = 'scheduled' AND scheduled_at <= $1
                ORDER BY scheduled_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobforge_jobs AS j
            SET state = 'available'
            FROM due
            WHERE j.id = due.id AND j.state = 'scheduled'
            RETURNING j.queue
            "#,
        )
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stage_scheduled", e))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("queue").map_err(decode_error))
            .collect()
    }

    #[instrument(skip(self, beat), fields(executor = %beat.executor_id, queue = %beat.queue), err)]
    async fn heartbeat(&self, beat: &ExecutorHeartbeat) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobforge_executors (id, node, queue, started_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET heartbeat_at = EXCLUDED.heartbeat_at
            "#,
        )
        .bind(beat.executor_id.as_uuid())
        .bind(&beat.node)
        .bind(&beat.queue)
        .bind(beat.started_at)
        .bind(beat.heartbeat_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn deregister(&self, executor: ExecutorId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobforge_executors WHERE id = $1")
            .bind(executor.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("deregister", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn orphaned(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM jobforge_jobs AS j
            WHERE j.state = 'executing'
                AND NOT EXISTS (
                    SELECT 1 FROM jobforge_executors AS e
                    WHERE e.id = j.attempted_by AND e.heartbeat_at >= $1
                )
            ORDER BY j.attempted_at
            LIMIT $2
            "#,
            returning_columns("j")
        ))
        .bind(stale_before)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("orphaned", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn prune(&self, before: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            WITH old AS (
                SELECT id
                FROM jobforge_jobs
                WHERE state IN ('completed', 'discarded', 'cancelled')
                    AND COALESCE(completed_at, discarded_at, cancelled_at) < $1
                ORDER BY COALESCE(completed_at, discarded_at, cancelled_at)
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM jobforge_jobs AS j
            USING old
            WHERE j.id = old.id
            "#,
        )
        .bind(before)
        .bind(to_limit(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn prune_executors(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobforge_executors WHERE heartbeat_at < $1")
            .bind(stale_before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_executors", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS total
            FROM jobforge_jobs
            WHERE ($1::text IS NULL OR queue = $1)
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            let state = JobState::from_str(&state).map_err(|e| StoreError::Serialization(e.to_string()))?;
            stats.add(state, total.max(0) as u64);
        }
        Ok(stats)
    }
}

async fn begin(pool: &PgPool) -> Result<Transaction<'static, Postgres>, StoreError> {
    pool.begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn insert_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO jobforge_jobs ({JOB_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#
    ))
    .bind(job.id.as_uuid())
    .bind(&job.queue)
    .bind(&job.worker)
    .bind(&job.args)
    .bind(job.state.as_str())
    .bind(job.priority)
    .bind(job.attempt as i32)
    .bind(job.max_attempts as i32)
    .bind(job.scheduled_at)
    .bind(job.inserted_at)
    .bind(job.attempted_at)
    .bind(job.attempted_by.map(Uuid::from))
    .bind(job.completed_at)
    .bind(job.discarded_at)
    .bind(job.cancelled_at)
    .bind(encode_errors(&job.errors)?)
    .bind(job.unique_key.as_deref())
    .bind(&job.tags)
    .bind(&job.meta)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

/// Write back the replaceable columns of a conflicting job.
///
/// An `available` row is never moved back to `scheduled`.
async fn update_replaced(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE jobforge_jobs
        SET args = $2,
            max_attempts = $3,
            meta = $4,
            priority = $5,
            scheduled_at = $6,
            state = CASE WHEN state = 'available' THEN state ELSE $7 END,
            tags = $8
        WHERE id = $1
            AND state IN ('scheduled', 'available')
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(&job.args)
    .bind(job.max_attempts as i32)
    .bind(&job.meta)
    .bind(job.priority)
    .bind(job.scheduled_at)
    .bind(job.state.as_str())
    .bind(&job.tags)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("replace_job", e))?;
    Ok(())
}

fn returning_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Advisory lock key for a hex signature: its first 64 bits.
fn advisory_key(signature: &str) -> i64 {
    signature
        .get(..16)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .map_or(0, |bits| bits as i64)
}

fn encode_errors(errors: &[AttemptError]) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(errors).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to decode job row: {err}"))
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    queue: String,
    worker: String,
    args: serde_json::Value,
    state: String,
    priority: i16,
    attempt: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
    attempted_at: Option<DateTime<Utc>>,
    attempted_by: Option<Uuid>,
    completed_at: Option<DateTime<Utc>>,
    discarded_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    errors: serde_json::Value,
    unique_key: Option<String>,
    tags: Vec<String>,
    meta: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            worker: row.try_get("worker")?,
            args: row.try_get("args")?,
            state: row.try_get("state")?,
            priority: row.try_get("priority")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            inserted_at: row.try_get("inserted_at")?,
            attempted_at: row.try_get("attempted_at")?,
            attempted_by: row.try_get("attempted_by")?,
            completed_at: row.try_get("completed_at")?,
            discarded_at: row.try_get("discarded_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            errors: row.try_get("errors")?,
            unique_key: row.try_get("unique_key")?,
            tags: row.try_get("tags")?,
            meta: row.try_get("meta")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::from_str(&row.state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let errors: Vec<AttemptError> = serde_json::from_value(row.errors)
            .map_err(|e| StoreError::Serialization(format!("invalid error history for {}: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue: row.queue,
            worker: row.worker,
            args: row.args,
            state,
            priority: row.priority,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_at: row.scheduled_at,
            inserted_at: row.inserted_at,
            attempted_at: row.attempted_at,
            attempted_by: row.attempted_by.map(ExecutorId::from_uuid),
            completed_at: row.completed_at,
            discarded_at: row.discarded_at,
            cancelled_at: row.cancelled_at,
            errors,
            unique_key: row.unique_key,
            tags: row.tags,
            meta: row.meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_uses_signature_prefix() {
        let sig = "00000000000000ff".to_string() + &"a".repeat(48);
        assert_eq!(advisory_key(&sig), 255);
        assert_eq!(advisory_key("ffffffffffffffff"), -1);
        assert_eq!(advisory_key("short"), 0);
    }

    #[test]
    fn returning_columns_are_qualified() {
        let cols = returning_columns("j");
        assert!(cols.starts_with("j.id, j.queue"));
        assert!(cols.ends_with("j.meta"));
        assert_eq!(cols.matches("j.").count(), JOB_COLUMNS.split(',').count());
    }

    #[test]
    fn schema_creates_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS jobforge_jobs"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS jobforge_executors"));
    }
}
