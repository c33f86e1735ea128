use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, Transition};
use crate::models::result::ResultSummary;
use crate::services::job_table::{JobTable, JobTableError};

const JOB_COLUMNS: &str = "job_id, status, filename, content_type, input_key, result_key, \
                           summary, error, attempt_count, created_at, updated_at, completed_at";

/// Job table stored in PostgreSQL. Transitions are `UPDATE ... WHERE status = $expected`,
/// plus `attempt_count = $attempt` for exits from `processing`.
#[derive(Clone)]
pub struct PgJobTable {
    pool: PgPool,
}

impl PgJobTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A conditional write matched nothing: tell a missing row, a stale
    /// status and a superseded attempt apart.
    async fn explain_miss(&self, job_id: Uuid, expected: JobStatus, fence: Option<i32>) -> JobTableError {
        let current: Option<(String, i32)> =
            match sqlx::query_as("SELECT status, attempt_count FROM pipeline_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(current) => current,
                Err(e) => return e.into(),
            };

        let Some((status, attempt_count)) = current else {
            return JobTableError::NotFound(job_id);
        };
        let actual = match status.parse::<JobStatus>() {
            Ok(actual) => actual,
            Err(_) => return JobTableError::Corrupt(format!("unknown status '{}'", status)),
        };

        match fence {
            Some(attempt) if actual == expected => JobTableError::Superseded {
                job_id,
                attempt,
                current: attempt_count,
            },
            _ => JobTableError::Conflict {
                job_id,
                expected,
                actual,
            },
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobTableError> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|_| JobTableError::Corrupt(format!("unknown status '{}'", status_str)))?;
    let summary: Option<Json<ResultSummary>> = row.try_get("summary")?;

    Ok(Job {
        job_id: row.try_get("job_id")?,
        status,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        input_key: row.try_get("input_key")?,
        result_key: row.try_get("result_key")?,
        summary: summary.map(|Json(s)| s),
        error: row.try_get("error")?,
        attempt_count: row.try_get("attempt_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobTable for PgJobTable {
    async fn create(&self, job: &Job) -> Result<(), JobTableError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_jobs
                (job_id, status, filename, content_type, input_key, attempt_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(job.status.as_ref())
        .bind(&job.filename)
        .bind(&job.content_type)
        .bind(&job.input_key)
        .bind(job.attempt_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobTableError::Duplicate(job.job_id));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobTableError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_jobs WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition(
        &self,
        job_id: Uuid,
        transition: Transition,
    ) -> Result<Job, JobTableError> {
        let expected = transition.expected();
        let fence = transition.fence();
        let effects = transition.effects(Utc::now());

        let row = sqlx::query(&format!(
            r#"
            UPDATE pipeline_jobs
            SET status = $3,
                attempt_count = attempt_count + $4,
                result_key = $5,
                summary = $6,
                error = $7,
                completed_at = COALESCE($8, completed_at),
                updated_at = $9
            WHERE job_id = $1 AND status = $2
              AND ($10::INTEGER IS NULL OR attempt_count = $10)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(expected.as_ref())
        .bind(effects.status.as_ref())
        .bind(effects.attempt_delta)
        .bind(effects.result_key)
        .bind(effects.summary.map(Json))
        .bind(effects.error)
        .bind(effects.completed_at)
        .bind(effects.updated_at)
        .bind(fence)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.explain_miss(job_id, expected, fence).await),
        }
    }

    async fn touch(&self, job_id: Uuid, expected: JobStatus, attempt: i32) -> Result<Job, JobTableError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE pipeline_jobs
            SET updated_at = NOW()
            WHERE job_id = $1 AND status = $2 AND attempt_count = $3
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(expected.as_ref())
        .bind(attempt)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.explain_miss(job_id, expected, Some(attempt)).await),
        }
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, JobTableError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM pipeline_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(status.map(|s| s.as_ref().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, JobTableError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM pipeline_jobs
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        ))
        .bind(status.as_ref())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn delete_abandoned(&self, job_id: Uuid) -> Result<bool, JobTableError> {
        let result = sqlx::query(
            "DELETE FROM pipeline_jobs WHERE job_id = $1 AND status = 'pending_upload'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), JobTableError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
