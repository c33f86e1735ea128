//! Worker harness: lease a message, guard on the job row, run the analyzer,
//! commit the outcome, and only then drop the message.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::models::job::{Job, JobStatus, Transition};
use crate::models::result::AnalysisResult;
use crate::services::analyzer::{AnalysisError, Analyzer};
use crate::services::job_table::{JobTable, JobTableError};
use crate::services::queue::{Delivery, QueueError, WorkQueue};
use crate::services::storage::{ObjectStore, StorageError};

/// Object key for a job's result document.
pub fn result_key(job_id: Uuid) -> String {
    format!("results/{}/results.json", job_id)
}

/// What one call to [`Worker::process_next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing arrived within the receive wait.
    Idle,
    Completed(Uuid),
    /// The attempt failed and the job went back to `queued`.
    Retried(Uuid),
    Failed(Uuid),
    /// Job not yet `queued`; the message will be redelivered shortly.
    Deferred(Uuid),
    /// Duplicate or orphaned delivery, dropped without work.
    Dropped(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job table error: {0}")]
    JobTable(#[from] JobTableError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Failure inside one processing attempt. Always ends the attempt; the job
/// row decides whether another one follows.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("input object {0} is missing; was the upload completed?")]
    MissingInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("could not encode result document: {0}")]
    Encode(#[from] serde_json::Error),

    /// The sweeper recovered this run; its outcome must not be committed.
    #[error("run superseded: {0}")]
    Superseded(JobTableError),
}

/// The row left this run's `processing` state: another actor owns it now.
fn is_lost(err: &JobTableError) -> bool {
    matches!(
        err,
        JobTableError::Conflict { .. } | JobTableError::Superseded { .. }
    )
}

pub struct Worker {
    id: usize,
    jobs: Arc<dyn JobTable>,
    queue: Arc<dyn WorkQueue>,
    storage: Arc<dyn ObjectStore>,
    analyzer: Arc<dyn Analyzer>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: usize,
        jobs: Arc<dyn JobTable>,
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn Analyzer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            jobs,
            queue,
            storage,
            analyzer,
            settings,
        }
    }

    /// Receive and fully handle at most one message.
    pub async fn process_next(&self) -> Result<Outcome, WorkerError> {
        let delivery = match self
            .queue
            .receive(self.settings.lease, self.settings.receive_wait)
            .await?
        {
            Some(d) => d,
            None => return Ok(Outcome::Idle),
        };
        let job_id = delivery.message.job_id;

        let job = match self.jobs.get(job_id).await? {
            Some(job) => job,
            None => {
                tracing::warn!(worker = self.id, job_id = %job_id, "Message for unknown job, dropping");
                self.ack(&delivery).await?;
                return Ok(Outcome::Dropped(job_id));
            }
        };

        match job.status {
            JobStatus::Queued => {}
            JobStatus::Uploaded => {
                // Published by a confirm whose enqueue write has not landed yet.
                tracing::debug!(worker = self.id, job_id = %job_id, "Job not yet queued, deferring delivery");
                self.queue
                    .extend(&delivery.receipt, self.settings.redelivery_delay)
                    .await?;
                return Ok(Outcome::Deferred(job_id));
            }
            status => return self.drop_duplicate(&delivery, status).await,
        }

        let job = match self.jobs.transition(job_id, Transition::StartProcessing).await {
            Ok(job) => job,
            Err(JobTableError::Conflict { actual, .. }) => {
                return self.drop_duplicate(&delivery, actual).await
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            worker = self.id,
            job_id = %job_id,
            from = "queued",
            to = "processing",
            attempt = job.attempt_count + 1,
            "Processing job"
        );

        let started = Instant::now();
        let attempt = self.attempt_with_heartbeat(&job, &delivery).await;
        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());

        match attempt {
            Ok(result) => self.complete(&job, &delivery, &result).await,
            Err(AttemptError::Superseded(reason)) => self.lost_job(&delivery, &reason).await,
            Err(e) => self.handle_failure(&job, &delivery, e).await,
        }
    }

    /// Delete a handled message. A lease that already lapsed is not an error:
    /// whoever holds the redelivered copy will find the job moved on.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match self.queue.delete(&delivery.receipt).await {
            Err(QueueError::LeaseLost(receipt)) => {
                tracing::warn!(worker = self.id, job_id = %delivery.message.job_id, receipt = %receipt, "Lease lapsed before delete");
                Ok(())
            }
            other => other,
        }
    }

    async fn drop_duplicate(&self, delivery: &Delivery, status: JobStatus) -> Result<Outcome, WorkerError> {
        let job_id = delivery.message.job_id;
        metrics::counter!("duplicate_deliveries_total").increment(1);
        tracing::info!(worker = self.id, job_id = %job_id, status = %status, "Duplicate delivery, dropping");
        self.ack(delivery).await?;
        Ok(Outcome::Dropped(job_id))
    }

    /// Run the attempt while extending the lease and touching the row every
    /// heartbeat interval. Gives up early once the row is no longer ours.
    async fn attempt_with_heartbeat(
        &self,
        job: &Job,
        delivery: &Delivery,
    ) -> Result<AnalysisResult, AttemptError> {
        let work = self.attempt(job);
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval());
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.extend(&delivery.receipt, self.settings.lease).await {
                        // The processing guard still keeps a redelivered copy from running.
                        tracing::warn!(worker = self.id, job_id = %job.job_id, error = %e, "Lease extension failed");
                    }
                    match self
                        .jobs
                        .touch(job.job_id, JobStatus::Processing, job.attempt_count)
                        .await {
                        Ok(_) => {}
                        Err(e) if is_lost(&e) => return Err(AttemptError::Superseded(e)),
                        Err(e) => {
                            tracing::warn!(worker = self.id, job_id = %job.job_id, error = %e, "Could not refresh job row");
                        }
                    }
                }
            }
        }
    }

    async fn attempt(&self, job: &Job) -> Result<AnalysisResult, AttemptError> {
        let media = match self.storage.get(&job.input_key).await {
            Ok(media) => media,
            Err(StorageError::NotFound(key)) => return Err(AttemptError::MissingInput(key)),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(worker = self.id, job_id = %job.job_id, bytes = media.len(), "Downloaded input");

        let result = self.analyzer.analyze(job, &media).await?;

        let document = serde_json::to_vec(&result)?;
        self.storage
            .put(&result_key(job.job_id), &document, "application/json")
            .await?;
        Ok(result)
    }

    async fn complete(
        &self,
        job: &Job,
        delivery: &Delivery,
        result: &AnalysisResult,
    ) -> Result<Outcome, WorkerError> {
        let transition = Transition::Complete {
            attempt: job.attempt_count,
            result_key: result_key(job.job_id),
            summary: result.summary(),
        };
        match self.jobs.transition(job.job_id, transition).await {
            Ok(done) => {
                self.ack(delivery).await?;
                metrics::counter!("jobs_completed_total").increment(1);
                tracing::info!(
                    worker = self.id,
                    job_id = %job.job_id,
                    from = "processing",
                    to = "completed",
                    attempt_count = done.attempt_count,
                    food_items = result.meal_summary.num_food_items,
                    "Job completed"
                );
                Ok(Outcome::Completed(job.job_id))
            }
            Err(e) if is_lost(&e) => self.lost_job(delivery, &e).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_failure(
        &self,
        job: &Job,
        delivery: &Delivery,
        error: AttemptError,
    ) -> Result<Outcome, WorkerError> {
        let attempts = job.attempt_count + 1;

        if attempts < self.settings.max_attempts {
            let retry = Transition::Retry {
                attempt: job.attempt_count,
            };
            match self.jobs.transition(job.job_id, retry).await {
                Ok(_) => {}
                Err(e) if is_lost(&e) => return self.lost_job(delivery, &e).await,
                Err(e) => return Err(e.into()),
            }
            metrics::counter!("job_retries_total").increment(1);
            tracing::warn!(
                worker = self.id,
                job_id = %job.job_id,
                from = "processing",
                to = "queued",
                attempt_count = attempts,
                error = %error,
                "Attempt failed, job re-queued"
            );

            // A fresh message restarts the lease clock. If it cannot be
            // published, the old one is kept and redelivered on lease expiry.
            if let Err(e) = self.queue.publish(job.job_id).await {
                tracing::warn!(worker = self.id, job_id = %job.job_id, error = %e, "Re-publish failed, keeping leased message");
                return Ok(Outcome::Retried(job.job_id));
            }
            self.ack(delivery).await?;
            return Ok(Outcome::Retried(job.job_id));
        }

        let message = format!("failed after {} attempts: {}", attempts, error);
        let fail = Transition::Fail {
            attempt: job.attempt_count,
            error: message,
        };
        match self.jobs.transition(job.job_id, fail).await {
            Ok(_) => {}
            Err(e) if is_lost(&e) => return self.lost_job(delivery, &e).await,
            Err(e) => return Err(e.into()),
        }
        self.ack(delivery).await?;
        metrics::counter!("jobs_failed_total").increment(1);
        tracing::error!(
            worker = self.id,
            job_id = %job.job_id,
            from = "processing",
            to = "failed",
            attempt_count = attempts,
            error = %error,
            "Job failed"
        );
        Ok(Outcome::Failed(job.job_id))
    }

    /// The row left this run under us (the sweeper recovered it).
    async fn lost_job(&self, delivery: &Delivery, reason: &JobTableError) -> Result<Outcome, WorkerError> {
        let job_id = delivery.message.job_id;
        tracing::warn!(worker = self.id, job_id = %job_id, reason = %reason, "Job moved on during processing, discarding outcome");
        self.ack(delivery).await?;
        Ok(Outcome::Dropped(job_id))
    }

    /// Loop until `shutdown` flips to true. A job in progress is finished
    /// first; the receive wait bounds how long an idle worker takes to notice.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.id, "Worker ready, starting job processing loop");
        while !*shutdown.borrow() {
            match self.process_next().await {
                Ok(Outcome::Idle) => {
                    tracing::trace!(worker = self.id, "No jobs available");
                }
                Ok(outcome) => {
                    tracing::debug!(worker = self.id, ?outcome, "Delivery handled");
                }
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Error processing job, will retry");
                    tokio::time::sleep(self.settings.receive_wait).await;
                }
            }
        }
        tracing::info!(worker = self.id, "Worker stopped");
    }
}

/// A fixed set of workers sharing one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        jobs: Arc<dyn JobTable>,
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn Analyzer>,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..settings.concurrency)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    jobs.clone(),
                    queue.clone(),
                    storage.clone(),
                    analyzer.clone(),
                    settings.clone(),
                );
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to observe shutdown and return.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analyzer::ProbeAnalyzer;
    use crate::services::job_table::MemoryJobTable;
    use crate::services::queue::MemoryWorkQueue;
    use crate::services::storage::MemoryObjectStore;
    use chrono::Utc;
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            max_attempts: 3,
            lease: Duration::from_secs(30),
            redelivery_delay: Duration::from_millis(20),
            receive_wait: Duration::from_millis(20),
            concurrency: 1,
        }
    }

    struct Harness {
        jobs: Arc<MemoryJobTable>,
        queue: Arc<MemoryWorkQueue>,
        storage: Arc<MemoryObjectStore>,
        worker: Worker,
    }

    fn harness() -> Harness {
        let jobs = Arc::new(MemoryJobTable::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let storage = Arc::new(MemoryObjectStore::new("http://localhost:3000", "AES256"));
        let worker = Worker::new(
            0,
            jobs.clone(),
            queue.clone(),
            storage.clone(),
            Arc::new(ProbeAnalyzer),
            settings(),
        );
        Harness {
            jobs,
            queue,
            storage,
            worker,
        }
    }

    async fn seed(h: &Harness, status: JobStatus) -> Uuid {
        let id = Uuid::new_v4();
        let key = format!("uploads/{}/input.jpg", id);
        h.jobs
            .create(&Job::new(id, "meal.jpg", "image/jpeg", key, Utc::now()))
            .await
            .unwrap();
        let path = [
            (JobStatus::Uploaded, Transition::MarkUploaded),
            (JobStatus::Queued, Transition::Enqueue),
            (JobStatus::Processing, Transition::StartProcessing),
        ];
        for (reached, t) in path {
            h.jobs.transition(id, t).await.unwrap();
            if reached == status {
                break;
            }
        }
        id
    }

    #[test]
    fn test_result_key_layout() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(id), format!("results/{}/results.json", id));
    }

    #[tokio::test]
    async fn test_idle_when_queue_is_empty() {
        let h = harness();
        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Idle);
    }

    #[tokio::test]
    async fn test_completes_job_and_deletes_message() {
        let h = harness();
        let id = seed(&h, JobStatus::Queued).await;
        h.storage
            .put(&format!("uploads/{}/input.jpg", id), &[1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        h.queue.publish(id).await.unwrap();

        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Completed(id));

        let job = h.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.result_key, Some(result_key(id)));
        assert!(h.storage.get(&result_key(id)).await.is_ok());
        assert_eq!(h.queue.depth().await.unwrap(), 0);
        assert_eq!(h.queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_missing_input_is_retried_then_failed() {
        let h = harness();
        let id = seed(&h, JobStatus::Queued).await;
        h.queue.publish(id).await.unwrap();

        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Retried(id));
        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Retried(id));
        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Failed(id));

        let job = h.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(job.error.unwrap().contains("missing"));
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_dropped() {
        let h = harness();
        let id = seed(&h, JobStatus::Processing).await;
        h.queue.publish(id).await.unwrap();

        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Dropped(id));
        let job = h.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(h.queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_orphan_message_is_dropped() {
        let h = harness();
        let id = Uuid::new_v4();
        h.queue.publish(id).await.unwrap();
        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Dropped(id));
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uploaded_job_is_deferred_not_dropped() {
        let h = harness();
        let id = seed(&h, JobStatus::Uploaded).await;
        h.queue.publish(id).await.unwrap();

        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Deferred(id));
        assert_eq!(h.queue.in_flight().await, 1);

        h.jobs.transition(id, Transition::Enqueue).await.unwrap();
        h.storage
            .put(&format!("uploads/{}/input.jpg", id), &[9], "image/jpeg")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.worker.process_next().await.unwrap(), Outcome::Completed(id));
    }
}
