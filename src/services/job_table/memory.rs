use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobTable, JobTableError};
use crate::models::job::{Job, JobStatus, Transition};

/// In-process job table for local mode and tests.
#[derive(Debug, Default)]
pub struct MemoryJobTable {
    rows: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row's timestamps. Lets tests age rows without sleeping.
    pub async fn backdate(&self, job_id: Uuid, to: DateTime<Utc>) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&job_id) {
            Some(job) => {
                job.updated_at = to;
                if job.status == JobStatus::PendingUpload {
                    job.created_at = to;
                }
                true
            }
            None => false,
        }
    }
}

fn check(job: &Job, expected: JobStatus, fence: Option<i32>) -> Result<(), JobTableError> {
    if job.status != expected {
        return Err(JobTableError::Conflict {
            job_id: job.job_id,
            expected,
            actual: job.status,
        });
    }
    match fence {
        Some(attempt) if attempt != job.attempt_count => Err(JobTableError::Superseded {
            job_id: job.job_id,
            attempt,
            current: job.attempt_count,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl JobTable for MemoryJobTable {
    async fn create(&self, job: &Job) -> Result<(), JobTableError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&job.job_id) {
            return Err(JobTableError::Duplicate(job.job_id));
        }
        rows.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobTableError> {
        Ok(self.rows.read().await.get(&job_id).cloned())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        transition: Transition,
    ) -> Result<Job, JobTableError> {
        let mut rows = self.rows.write().await;
        let job = rows.get_mut(&job_id).ok_or(JobTableError::NotFound(job_id))?;
        check(job, transition.expected(), transition.fence())?;

        job.apply(transition.effects(Utc::now()));
        Ok(job.clone())
    }

    async fn touch(&self, job_id: Uuid, expected: JobStatus, attempt: i32) -> Result<Job, JobTableError> {
        let mut rows = self.rows.write().await;
        let job = rows.get_mut(&job_id).ok_or(JobTableError::NotFound(job_id))?;
        check(job, expected, Some(attempt))?;

        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, JobTableError> {
        let rows = self.rows.read().await;
        let mut jobs: Vec<Job> = rows
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, JobTableError> {
        let rows = self.rows.read().await;
        let mut jobs: Vec<Job> = rows
            .values()
            .filter(|job| job.status == status && job.updated_at < updated_before)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn delete_abandoned(&self, job_id: Uuid) -> Result<bool, JobTableError> {
        let mut rows = self.rows.write().await;
        match rows.get(&job_id) {
            Some(job) if job.status == JobStatus::PendingUpload => {
                rows.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<(), JobTableError> {
        Ok(())
    }
}
