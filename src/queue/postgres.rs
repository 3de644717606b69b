use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{
    ClaimedTask, EnqueueResult, FailOutcome, NewTask, QueueCounts, RetryPolicy, TaskQueue, status,
};

/// Postgres-backed queue. All queues share the `queue_tasks` table and are
/// told apart by the `queue` column. Claiming uses `FOR UPDATE SKIP LOCKED`
/// so any number of worker processes can pull from the same queue.
pub struct PgTaskQueue {
    pool: PgPool,
    name: String,
    policy: RetryPolicy,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool, name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            name: name.into(),
            policy,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    run_id: Uuid,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct CountsRow {
    waiting: i64,
    active: i64,
    delayed: i64,
    completed: i64,
    failed: i64,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: NewTask) -> Result<EnqueueResult, QueueError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"INSERT INTO queue_tasks (id, queue, run_id, payload, max_attempts, dedupe_key, run_at)
               VALUES ($1, $2, $3, $4, $5, $6, NOW() + $7::bigint * INTERVAL '1 millisecond')
               ON CONFLICT (queue, dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING
               RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(&self.name)
        .bind(task.run_id)
        .bind(&task.payload)
        .bind(self.policy.max_attempts)
        .bind(&task.dedupe_key)
        .bind(millis(task.delay))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueResult::Created(id));
        }

        let existing: Uuid = sqlx::query_scalar(
            "SELECT id FROM queue_tasks WHERE queue = $1 AND dedupe_key = $2",
        )
        .bind(&self.name)
        .bind(&task.dedupe_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(EnqueueResult::Duplicate(existing))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, ClaimRow>(
            r#"UPDATE queue_tasks SET
                   status = 'active',
                   attempts = attempts + 1,
                   updated_at = NOW()
               WHERE id IN (
                   SELECT id FROM queue_tasks
                   WHERE queue = $1 AND status = 'pending' AND run_at <= NOW()
                   ORDER BY run_at
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, run_id, payload, attempts, max_attempts"#,
        )
        .bind(&self.name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ClaimedTask {
                id: r.id,
                run_id: r.run_id,
                payload: r.payload,
                attempts: r.attempts,
                max_attempts: r.max_attempts,
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE queue_tasks SET status = $2, updated_at = NOW(), finished_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status::COMPLETED)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let (attempts, max_attempts): (i32, i32) =
            sqlx::query_as("SELECT attempts, max_attempts FROM queue_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(QueueError::NotFound(id))?;

        if retryable && attempts < max_attempts {
            let delay = self.policy.backoff(attempts);
            sqlx::query(
                r#"UPDATE queue_tasks SET
                       status = $2,
                       last_error = $3,
                       run_at = NOW() + $4::bigint * INTERVAL '1 millisecond',
                       updated_at = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status::PENDING)
            .bind(error)
            .bind(millis(delay))
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::Retrying { delay })
        } else {
            sqlx::query(
                r#"UPDATE queue_tasks SET
                       status = $2,
                       last_error = $3,
                       updated_at = NOW(),
                       finished_at = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status::FAILED)
            .bind(error)
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::Exhausted)
        }
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"SELECT
                   COUNT(*) FILTER (WHERE status = 'pending' AND run_at <= NOW()) AS waiting,
                   COUNT(*) FILTER (WHERE status = 'active') AS active,
                   COUNT(*) FILTER (WHERE status = 'pending' AND run_at > NOW()) AS delayed,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
               FROM queue_tasks
               WHERE queue = $1"#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts {
            waiting: row.waiting,
            active: row.active,
            delayed: row.delayed,
            completed: row.completed,
            failed: row.failed,
        })
    }

    async fn pending_for_run(&self, run_id: Uuid) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM queue_tasks
               WHERE queue = $1 AND run_id = $2 AND status IN ('pending', 'active')"#,
        )
        .bind(&self.name)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn heartbeat(&self, ids: &[Uuid]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"UPDATE queue_tasks SET updated_at = NOW()
               WHERE queue = $1 AND status = 'active' AND id = ANY($2)"#,
        )
        .bind(&self.name)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"UPDATE queue_tasks SET status = 'pending', run_at = NOW(), updated_at = NOW()
               WHERE queue = $1 AND status = 'active'
                 AND updated_at <= NOW() - $2::bigint * INTERVAL '1 millisecond'"#,
        )
        .bind(&self.name)
        .bind(millis(stale_after))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"DELETE FROM queue_tasks
               WHERE queue = $1 AND status IN ('completed', 'failed') AND finished_at < $2"#,
        )
        .bind(&self.name)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
