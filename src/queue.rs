//! Job queue interface
//!
//! An append-only queue partitioned by project id: per-project FIFO,
//! at-least-once delivery, and a visibility timeout that returns a dead
//! worker's jobs to the queue. At most one job per project is in flight at
//! any instant, which is what serializes graph mutations per project.
//!
//! [`MemoryJobQueue`] implements the whole contract in-process; a broker
//! client can slot in behind the same trait.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::AnalysisJob;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("unknown delivery receipt {0}")]
    UnknownReceipt(u64),
}

/// A dequeued job plus the receipt that acknowledges it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: AnalysisJob,
    pub receipt: u64,
    /// How many times this envelope has been delivered (1 = first time).
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub redelivered_total: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: AnalysisJob) -> Result<(), QueueError>;

    /// Pop the next deliverable job, honoring per-project exclusivity.
    /// `None` when nothing is deliverable right now.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery; the job will not be redelivered.
    async fn ack(&self, receipt: u64) -> Result<(), QueueError>;

    async fn stats(&self) -> QueueStats;
}

#[derive(Debug)]
struct InFlight {
    job: AnalysisJob,
    project_id: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    partitions: BTreeMap<String, VecDeque<(AnalysisJob, u32)>>,
    in_flight: HashMap<u64, InFlight>,
    redelivered_total: u64,
    closed: bool,
}

pub struct MemoryJobQueue {
    state: RwLock<QueueState>,
    receipt_counter: AtomicU64,
    visibility_timeout: Duration,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            receipt_counter: AtomicU64::new(1),
            visibility_timeout,
        }
    }

    pub async fn close(&self) {
        self.state.write().await.closed = true;
    }

    /// Move expired in-flight deliveries back to the front of their
    /// partition so per-project order survives redelivery.
    fn reclaim_expired(state: &mut QueueState, visibility_timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, inflight)| now.duration_since(inflight.delivered_at) >= visibility_timeout)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(inflight) = state.in_flight.remove(&receipt) {
                warn!(
                    job_id = %inflight.job.job_id,
                    project = %inflight.project_id,
                    "visibility timeout expired, returning job to queue"
                );
                state.redelivered_total += 1;
                state
                    .partitions
                    .entry(inflight.project_id)
                    .or_default()
                    .push_front((inflight.job, inflight.delivery_count));
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: AnalysisJob) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        debug!(job_id = %job.job_id, project = %job.project_id, "enqueued analysis job");
        state
            .partitions
            .entry(job.project_id.clone())
            .or_default()
            .push_back((job, 0));
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        Self::reclaim_expired(&mut state, self.visibility_timeout);

        // A partition with an in-flight delivery is skipped entirely; that
        // is the one-active-job-per-project guarantee.
        let busy: Vec<String> = state
            .in_flight
            .values()
            .map(|inflight| inflight.project_id.clone())
            .collect();
        let candidate = state
            .partitions
            .iter_mut()
            .find(|(project_id, partition)| {
                !partition.is_empty() && !busy.contains(project_id)
            })
            .map(|(project_id, partition)| (project_id.clone(), partition.pop_front()));

        let Some((project_id, Some((job, prior_deliveries)))) = candidate else {
            return Ok(None);
        };
        let receipt = self.receipt_counter.fetch_add(1, Ordering::SeqCst);
        let delivery_count = prior_deliveries + 1;
        state.in_flight.insert(
            receipt,
            InFlight {
                job: job.clone(),
                project_id,
                delivered_at: Instant::now(),
                delivery_count,
            },
        );
        Ok(Some(Delivery {
            job,
            receipt,
            delivery_count,
        }))
    }

    async fn ack(&self, receipt: u64) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state
            .in_flight
            .remove(&receipt)
            .map(|_| ())
            .ok_or(QueueError::UnknownReceipt(receipt))
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.read().await;
        QueueStats {
            pending: state.partitions.values().map(VecDeque::len).sum(),
            in_flight: state.in_flight.len(),
            redelivered_total: state.redelivered_total,
        }
    }
}
