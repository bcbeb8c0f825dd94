// crates/taskflow/src/jobs/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::broker::Broker;
use crate::jobs::model::{
    Delivery, Job, JobFailure, JobId, JobState, Payload, QueueDepth, QueueMessage, StateCounts,
};
use crate::jobs::store::{apply_transition, ResultStore, Transition};

const UNIQUE_VIOLATION: &str = "23505";

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

// ----------------------------
// Broker
// ----------------------------

#[derive(Debug, sqlx::FromRow)]
struct LeasedRow {
    job_id: Uuid,
    queue: String,
    handler_name: String,
    payload_schema: String,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    delivery_count: i32,
}

/// Durable broker on a `queue_messages` table. Survives restarts of both
/// producers and workers.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, message: QueueMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (job_id, queue, handler_name, payload_schema, payload, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.job_id)
        .bind(&message.queue)
        .bind(&message.handler_name)
        .bind(&message.payload.schema)
        .bind(&message.payload.bytes)
        .bind(message.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(QueueError::broker)?;

        Ok(())
    }

    /// Lease exactly one visible message for this worker.
    /// Uses SELECT ... FOR UPDATE SKIP LOCKED to avoid double-claim.
    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let lease_id = Uuid::new_v4();

        let row = sqlx::query_as::<_, LeasedRow>(
            r#"
            WITH candidate AS (
              SELECT seq
              FROM queue_messages
              WHERE queue = $1
                AND lease_id IS NULL
                AND visible_at <= now()
              ORDER BY visible_at ASC, seq ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE queue_messages m
            SET lease_id = $2,
                leased_by = $3,
                lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                delivery_count = m.delivery_count + 1
            FROM candidate
            WHERE m.seq = candidate.seq
            RETURNING m.job_id, m.queue, m.handler_name, m.payload_schema, m.payload,
                      m.enqueued_at, m.delivery_count
            "#,
        )
        .bind(queue)
        .bind(lease_id)
        .bind(worker_id)
        .bind(millis(visibility_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::broker)?;

        Ok(row.map(|r| Delivery {
            message: QueueMessage {
                job_id: r.job_id,
                queue: r.queue,
                handler_name: r.handler_name,
                payload: Payload::new(r.payload_schema, r.payload),
                enqueued_at: r.enqueued_at,
            },
            lease_id,
            delivery_count: r.delivery_count,
            worker_id: worker_id.to_string(),
        }))
    }

    /// The `lease_id` guard keeps a worker whose lease expired from removing
    /// a message another worker now owns.
    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let res = sqlx::query("DELETE FROM queue_messages WHERE lease_id = $1")
            .bind(delivery.lease_id)
            .execute(&self.pool)
            .await
            .map_err(QueueError::broker)?;

        Ok(res.rows_affected() > 0)
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lease_id = NULL,
                leased_by = NULL,
                lease_expires_at = NULL,
                visible_at = now() + ($2::bigint * interval '1 millisecond')
            WHERE lease_id = $1
            "#,
        )
        .bind(delivery.lease_id)
        .bind(millis(delay))
        .execute(&self.pool)
        .await
        .map_err(QueueError::broker)?;

        Ok(res.rows_affected() > 0)
    }

    async fn reap_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lease_id = NULL,
                leased_by = NULL,
                lease_expires_at = NULL
            WHERE lease_id IS NOT NULL
              AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(QueueError::broker)?;

        Ok(res.rows_affected())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let (ready, leased): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE lease_id IS NULL),
              COUNT(*) FILTER (WHERE lease_id IS NOT NULL)
            FROM queue_messages
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(QueueError::broker)?;

        Ok(QueueDepth { ready, leased })
    }
}

// ----------------------------
// Result store
// ----------------------------

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    handler_name: String,
    payload_schema: String,
    payload: Vec<u8>,
    state: String,
    attempt_count: i32,
    max_retries: i32,
    result: Option<Value>,
    error_code: Option<String>,
    error_message: Option<String>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    replay_of: Option<Uuid>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

fn failure(code: Option<String>, message: Option<String>) -> Option<JobFailure> {
    code.map(|code| JobFailure {
        code,
        message: message.unwrap_or_default(),
    })
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(r: JobRow) -> Result<Self> {
        let state = JobState::parse(&r.state)
            .ok_or_else(|| QueueError::store(format!("job {} has unknown state {:?}", r.id, r.state)))?;

        Ok(Job {
            id: r.id,
            queue: r.queue,
            handler_name: r.handler_name,
            payload: Payload::new(r.payload_schema, r.payload),
            state,
            attempt_count: r.attempt_count,
            max_retries: r.max_retries,
            result: r.result,
            error: failure(r.error_code, r.error_message),
            last_error: failure(r.last_error_code, r.last_error_message),
            replay_of: r.replay_of,
            enqueued_at: r.enqueued_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            expires_at: r.expires_at,
        })
    }
}

/// Result store on a `job_results` table. Transitions lock the row, apply the
/// shared transition rules and write the whole record back.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    ttl: Option<chrono::Duration>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, ttl: None }
    }

    pub fn with_ttl(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl: chrono::Duration::from_std(ttl).ok(),
        }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM job_results
            WHERE id = $1
              AND (expires_at IS NULL OR expires_at > $2)
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .map_err(QueueError::store)?;

        row.ok_or(QueueError::NotFound(job_id))?.try_into()
    }

    async fn write_back(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_results
            SET state = $2,
                attempt_count = $3,
                result = $4,
                error_code = $5,
                error_message = $6,
                last_error_code = $7,
                last_error_message = $8,
                started_at = $9,
                finished_at = $10,
                expires_at = $11,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(job.attempt_count)
        .bind(&job.result)
        .bind(job.error.as_ref().map(|e| e.code.as_str()))
        .bind(job.error.as_ref().map(|e| e.message.as_str()))
        .bind(job.last_error.as_ref().map(|e| e.code.as_str()))
        .bind(job.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.expires_at)
        .execute(&mut **tx)
        .await
        .map_err(QueueError::store)?;

        Ok(())
    }

    async fn transition(&self, job_id: JobId, to: JobState, outcome: Transition) -> Result<Job> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(QueueError::store)?;

        let mut job = Self::lock_row(&mut tx, job_id, now).await?;
        apply_transition(&mut job, to, outcome, self.ttl, now)?;
        Self::write_back(&mut tx, &job).await?;

        tx.commit().await.map_err(QueueError::store)?;
        Ok(job)
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn insert_pending(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_results (
                id, queue, handler_name, payload_schema, payload,
                state, attempt_count, max_retries, replay_of, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(&job.handler_name)
        .bind(&job.payload.schema)
        .bind(&job.payload.bytes)
        .bind(job.state.as_str())
        .bind(job.attempt_count)
        .bind(job.max_retries)
        .bind(job.replay_of)
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code == UNIQUE_VIOLATION);
            if duplicate {
                QueueError::DuplicateJob(job.id)
            } else {
                QueueError::store(e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM job_results
            WHERE id = $1
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::store)?;

        row.ok_or(QueueError::NotFound(job_id))?.try_into()
    }

    async fn mark_started(&self, job_id: JobId) -> Result<Job> {
        self.transition(job_id, JobState::Started, Transition::Start)
            .await
    }

    async fn mark_retry(&self, job_id: JobId, error: JobFailure) -> Result<Job> {
        self.transition(job_id, JobState::Retry, Transition::Retry(error))
            .await
    }

    async fn mark_success(&self, job_id: JobId, result: Option<Value>) -> Result<Job> {
        self.transition(job_id, JobState::Success, Transition::Succeed(result))
            .await
    }

    async fn mark_failure(&self, job_id: JobId, error: JobFailure) -> Result<Job> {
        self.transition(job_id, JobState::Failure, Transition::Fail(error))
            .await
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(QueueError::store)?;

        let mut job = Self::lock_row(&mut tx, job_id, now).await?;
        if job.state != JobState::Pending {
            return Err(QueueError::NotCancellable {
                job_id,
                state: job.state,
            });
        }
        apply_transition(&mut job, JobState::Cancelled, Transition::Cancel, self.ttl, now)?;
        Self::write_back(&mut tx, &job).await?;

        tx.commit().await.map_err(QueueError::store)?;
        Ok(job)
    }

    async fn remove(&self, job_id: JobId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM job_results WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(QueueError::store)?;

        Ok(res.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM job_results
            WHERE expires_at IS NOT NULL
              AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(QueueError::store)?;

        Ok(res.rows_affected())
    }

    async fn counts(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*)
            FROM job_results
            WHERE expires_at IS NULL OR expires_at > now()
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(QueueError::store)?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            if let Some(state) = JobState::parse(&state) {
                counts.bump(state, n);
            }
        }
        Ok(counts)
    }
}
