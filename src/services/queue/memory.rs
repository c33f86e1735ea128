use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, JobMessage, QueueError, Receipt, WorkQueue};

/// Longest a blocked receive sleeps before re-checking for expired leases.
const RECLAIM_TICK: Duration = Duration::from_millis(50);

struct InFlight {
    message: JobMessage,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobMessage>,
    in_flight: HashMap<Receipt, InFlight>,
}

impl QueueState {
    /// Move messages whose lease ran out back to the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Receipt> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(r, _)| r.clone())
            .collect();

        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                tracing::debug!(job_id = %f.message.job_id, receipt = %receipt, "Lease expired, message visible again");
                self.ready.push_back(f.message);
            }
        }
    }
}

/// In-process leased queue for local mode and tests.
#[derive(Default)]
pub struct MemoryWorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently leased to a consumer.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state
            .lock()
            .await
            .ready
            .push_back(JobMessage { job_id });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(
        &self,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;

        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some(message) = state.ready.pop_front() {
                    let receipt = Receipt::generate();
                    state.in_flight.insert(
                        receipt.clone(),
                        InFlight {
                            message,
                            deadline: now + lease,
                        },
                    );
                    return Ok(Some(Delivery { message, receipt }));
                }
            }

            let now = Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            let nap = (give_up_at - now).min(RECLAIM_TICK);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn extend(&self, receipt: &Receipt, duration: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.reclaim_expired(now);

        match state.in_flight.get_mut(receipt) {
            Some(f) => {
                f.deadline = now + duration;
                Ok(())
            }
            None => Err(QueueError::LeaseLost(receipt.clone())),
        }
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        match self.state.lock().await.in_flight.remove(receipt) {
            Some(_) => Ok(()),
            None => Err(QueueError::LeaseLost(receipt.clone())),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.ready.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
