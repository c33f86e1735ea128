//! Out-of-band retention and recovery. Never reachable from the API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::SweepPolicy;
use crate::models::job::{Job, JobStatus, Transition};
use crate::services::job_table::{JobTable, JobTableError};
use crate::services::queue::WorkQueue;

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// `pending_upload` rows past the TTL.
    pub abandoned: usize,
    /// Of those, rows actually deleted.
    pub purged: usize,
    /// Stalled `processing` rows sent back to `queued`.
    pub requeued: usize,
    /// Stalled `processing` rows failed with attempts exhausted.
    pub failed: usize,
    /// `uploaded` rows whose enqueue was completed.
    pub enqueued: usize,
    /// Long-waiting `queued` rows given a fresh message.
    pub republished: usize,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub struct Sweeper {
    jobs: Arc<dyn JobTable>,
    queue: Arc<dyn WorkQueue>,
    policy: SweepPolicy,
}

impl Sweeper {
    pub fn new(jobs: Arc<dyn JobTable>, queue: Arc<dyn WorkQueue>, policy: SweepPolicy) -> Self {
        Self { jobs, queue, policy }
    }

    /// `pending_upload` jobs created more than the TTL before `now`.
    pub async fn find_abandoned(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobTableError> {
        self.jobs
            .list_stale(
                JobStatus::PendingUpload,
                cutoff(now, self.policy.pending_upload_ttl),
                self.policy.batch_size,
            )
            .await
    }

    /// One pass over all retention rules. Errors on individual jobs are
    /// logged and skipped; listing failures abort the pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, JobTableError> {
        let mut report = SweepReport::default();
        self.sweep_abandoned(now, &mut report).await?;
        self.recover_stalled(now, &mut report).await?;
        self.finish_enqueues(now, &mut report).await?;
        self.republish_queued(now, &mut report).await?;

        if report != SweepReport::default() {
            tracing::info!(
                abandoned = report.abandoned,
                purged = report.purged,
                requeued = report.requeued,
                failed = report.failed,
                enqueued = report.enqueued,
                republished = report.republished,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_abandoned(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobTableError> {
        let abandoned = self.find_abandoned(now).await?;
        report.abandoned = abandoned.len();
        metrics::gauge!("sweeper_abandoned_pending").set(abandoned.len() as f64);

        for job in abandoned {
            tracing::info!(job_id = %job.job_id, created_at = %job.created_at, "Upload abandoned");
            if !self.policy.purge_abandoned {
                continue;
            }
            match self.jobs.delete_abandoned(job.job_id).await {
                Ok(true) => {
                    report.purged += 1;
                    metrics::counter!("sweeper_abandoned_total").increment(1);
                }
                // Confirmed between listing and deleting.
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Could not purge abandoned job"),
            }
        }
        Ok(())
    }

    /// A worker that died mid-job leaves the row in `processing`. Apply the
    /// same bounded retry a failing attempt would. Live workers keep their
    /// row fresh, and the attempt fence rejects a run that resurfaces later.
    async fn recover_stalled(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobTableError> {
        let stalled = self
            .jobs
            .list_stale(
                JobStatus::Processing,
                cutoff(now, self.policy.processing_timeout),
                self.policy.batch_size,
            )
            .await?;

        for job in stalled {
            let attempts = job.attempt_count + 1;
            if attempts < self.policy.max_attempts {
                let retry = Transition::Retry {
                    attempt: job.attempt_count,
                };
                match self.jobs.transition(job.job_id, retry).await {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job.job_id, error = %e, "Could not requeue stalled job");
                        continue;
                    }
                }
                report.requeued += 1;
                metrics::counter!("sweeper_recovered_total").increment(1);
                tracing::warn!(job_id = %job.job_id, from = "processing", to = "queued", attempt_count = attempts, "Stalled job requeued");
                if let Err(e) = self.queue.publish(job.job_id).await {
                    // Picked up again by the queued rule once it goes stale.
                    tracing::warn!(job_id = %job.job_id, error = %e, "Publish for requeued job failed");
                }
            } else {
                let fail = Transition::Fail {
                    attempt: job.attempt_count,
                    error: format!("worker timed out after {} attempts", attempts),
                };
                match self.jobs.transition(job.job_id, fail).await {
                    Ok(_) => {
                        report.failed += 1;
                        metrics::counter!("jobs_failed_total").increment(1);
                        tracing::error!(job_id = %job.job_id, from = "processing", to = "failed", attempt_count = attempts, "Stalled job failed");
                    }
                    Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Could not fail stalled job"),
                }
            }
        }
        Ok(())
    }

    /// Finish confirmations whose publish failed and were never retried.
    async fn finish_enqueues(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobTableError> {
        let stranded = self
            .jobs
            .list_stale(
                JobStatus::Uploaded,
                cutoff(now, self.policy.uploaded_grace),
                self.policy.batch_size,
            )
            .await?;

        for job in stranded {
            if let Err(e) = self.queue.publish(job.job_id).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "Queue still unavailable for stranded job");
                continue;
            }
            match self.jobs.transition(job.job_id, Transition::Enqueue).await {
                Ok(_) => {
                    report.enqueued += 1;
                    metrics::counter!("sweeper_recovered_total").increment(1);
                    tracing::info!(job_id = %job.job_id, from = "uploaded", to = "queued", "Stranded upload enqueued");
                }
                Err(JobTableError::Conflict { .. }) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Could not enqueue stranded job"),
            }
        }
        Ok(())
    }

    /// Give long-waiting `queued` rows a fresh message. Covers a requeue whose
    /// publish failed; a surplus message is dropped by the worker's guard.
    async fn republish_queued(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobTableError> {
        let waiting = self
            .jobs
            .list_stale(
                JobStatus::Queued,
                cutoff(now, self.policy.queued_timeout),
                self.policy.batch_size,
            )
            .await?;

        for job in waiting {
            if let Err(e) = self.queue.publish(job.job_id).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "Queue still unavailable for waiting job");
                continue;
            }
            report.republished += 1;
            metrics::counter!("sweeper_recovered_total").increment(1);
            tracing::info!(job_id = %job.job_id, attempt_count = job.attempt_count, "Waiting job republished");

            // Restart the clock so the next pass does not publish it again.
            match self
                .jobs
                .touch(job.job_id, JobStatus::Queued, job.attempt_count)
                .await
            {
                Ok(_) | Err(JobTableError::Conflict { .. }) | Err(JobTableError::Superseded { .. }) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Could not refresh waiting job"),
            }
        }
        Ok(())
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                    match self.queue.depth().await {
                        Ok(depth) => metrics::gauge!("work_queue_depth").set(depth as f64),
                        Err(e) => tracing::warn!(error = %e, "Could not read queue depth"),
                    }
                }
            }
        }
        tracing::info!("Sweeper stopped");
    }
}
