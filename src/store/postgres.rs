use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::import_run::{CounterDelta, FailureDetail, ImportRun, ImportStats};
use crate::models::job::{JobRecord, StoredJob};
use crate::models::source::FeedSource;
use crate::store::Store;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    external_id: String,
    source: String,
    title: String,
    description: String,
    company: String,
    location: String,
    job_type: String,
    category: String,
    salary: Option<String>,
    url: String,
    published_at: DateTime<Utc>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for StoredJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(StoredJob {
            id: row.id,
            record: JobRecord {
                external_id: row.external_id,
                source: row.source.parse().map_err(StoreError::Corrupt)?,
                title: row.title,
                description: row.description,
                company: row.company,
                location: row.location,
                job_type: row.job_type.parse().map_err(StoreError::Corrupt)?,
                category: row.category,
                salary: row.salary,
                url: row.url,
                published_at: row.published_at,
            },
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    source: String,
    feed_url: String,
    total_fetched: i32,
    total_imported: i32,
    new_count: i32,
    updated_count: i32,
    unchanged_count: i32,
    failed_count: i32,
    failure_details: Json<Vec<FailureDetail>>,
    status: String,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<RunRow> for ImportRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(ImportRun {
            id: row.id,
            source: row.source.parse().map_err(StoreError::Corrupt)?,
            feed_url: row.feed_url,
            total_fetched: row.total_fetched,
            total_imported: row.total_imported,
            new_count: row.new_count,
            updated_count: row.updated_count,
            unchanged_count: row.unchanged_count,
            failed_count: row.failed_count,
            failure_details: row.failure_details.0,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    total_imports: i64,
    total_jobs_fetched: i64,
    total_jobs_imported: i64,
    total_new_jobs: i64,
    total_updated_jobs: i64,
    total_unchanged_jobs: i64,
    total_failed_jobs: i64,
    completed_imports: i64,
    failed_imports: i64,
    running_imports: i64,
}

/// Postgres-backed store. Counter changes are single `UPDATE ... SET x = x + n`
/// statements so concurrent workers never lose increments.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn delta_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for PgStore {
    async fn find_job(
        &self,
        external_id: &str,
        source: FeedSource,
    ) -> Result<Option<StoredJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE external_id = $1 AND source = $2",
        )
        .bind(external_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(StoredJob::try_from).transpose()
    }

    async fn insert_job(&self, record: &JobRecord) -> Result<StoredJob, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (external_id, source, title, description, company, location, job_type, category, salary, url, published_at, is_active) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE) RETURNING *",
        )
        .bind(&record.external_id)
        .bind(record.source.as_str())
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.company)
        .bind(&record.location)
        .bind(record.job_type.as_str())
        .bind(&record.category)
        .bind(&record.salary)
        .bind(&record.url)
        .bind(record.published_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, &record.natural_key()))?;
        StoredJob::try_from(row)
    }

    async fn update_job(&self, id: i64, record: &JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET title = $2, description = $3, company = $4, location = $5, job_type = $6, category = $7, salary = $8, url = $9, published_at = $10, is_active = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.company)
        .bind(&record.location)
        .bind(record.job_type.as_str())
        .bind(&record.category)
        .bind(&record.salary)
        .bind(&record.url)
        .bind(record.published_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job {id} not found")));
        }
        Ok(())
    }

    async fn create_run(
        &self,
        source: FeedSource,
        feed_url: &str,
    ) -> Result<ImportRun, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "INSERT INTO import_runs (id, source, feed_url) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(source.as_str())
        .bind(feed_url)
        .fetch_one(&self.pool)
        .await?;
        ImportRun::try_from(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM import_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ImportRun::try_from).transpose()
    }

    async fn set_total_fetched(&self, id: Uuid, total: i32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE import_runs SET total_fetched = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(total)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_counters(&self, id: Uuid, delta: CounterDelta) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE import_runs SET total_imported = total_imported + $2, new_count = new_count + $3, updated_count = updated_count + $4, unchanged_count = unchanged_count + $5 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(delta_i32(delta.imported()))
        .bind(delta_i32(delta.new))
        .bind(delta_i32(delta.updated))
        .bind(delta_i32(delta.unchanged))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(&self, id: Uuid, detail: FailureDetail) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE import_runs SET failed_count = failed_count + 1, failure_details = failure_details || jsonb_build_array($2::jsonb) WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(Json(&detail))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "UPDATE import_runs SET status = 'completed', completed_at = NOW(), duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
             WHERE id = $1 AND status = 'running'
               AND total_imported + unchanged_count + failed_count >= total_fetched
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ImportRun::try_from).transpose()
    }

    async fn fail_run(&self, id: Uuid, error: &str) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "UPDATE import_runs SET status = 'failed', error = $2, completed_at = NOW(), duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
             WHERE id = $1 AND status = 'running'
             RETURNING *",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ImportRun::try_from).transpose()
    }

    async fn list_runs(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ImportRun>, i64), StoreError> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM import_runs")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM import_runs ORDER BY started_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let runs = rows
            .into_iter()
            .map(ImportRun::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((runs, total.0))
    }

    async fn run_stats(&self) -> Result<ImportStats, StoreError> {
        let row = sqlx::query_as::<_, StatsRow>(
            "SELECT
                COUNT(*) AS total_imports,
                COALESCE(SUM(total_fetched), 0)::BIGINT AS total_jobs_fetched,
                COALESCE(SUM(total_imported), 0)::BIGINT AS total_jobs_imported,
                COALESCE(SUM(new_count), 0)::BIGINT AS total_new_jobs,
                COALESCE(SUM(updated_count), 0)::BIGINT AS total_updated_jobs,
                COALESCE(SUM(unchanged_count), 0)::BIGINT AS total_unchanged_jobs,
                COALESCE(SUM(failed_count), 0)::BIGINT AS total_failed_jobs,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_imports,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_imports,
                COUNT(*) FILTER (WHERE status = 'running') AS running_imports
             FROM import_runs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ImportStats {
            total_imports: row.total_imports,
            total_jobs_fetched: row.total_jobs_fetched,
            total_jobs_imported: row.total_jobs_imported,
            total_new_jobs: row.total_new_jobs,
            total_updated_jobs: row.total_updated_jobs,
            total_unchanged_jobs: row.total_unchanged_jobs,
            total_failed_jobs: row.total_failed_jobs,
            completed_imports: row.completed_imports,
            failed_imports: row.failed_imports,
            running_imports: row.running_imports,
        })
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM import_runs WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
