//! Bounded execution of pipeline invocations.
//!
//! Inference is CPU/GPU bound, so invocations run on the blocking thread
//! pool and never on request-handling tasks. At most `workers` invocations
//! run at once and at most `queue_depth` wait for a slot; further single
//! submissions are rejected with [`PoolError::Saturated`].

use crate::error::PoolError;
use crate::pipeline::{PlatePipeline, Thresholds};
use common::plate_tasks::{BatchItem, ImageResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use telemetry::metrics;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

pub struct InferencePool {
    pipeline: Arc<PlatePipeline>,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    workers: usize,
    queue_depth: usize,
}

/// Holds one place in the wait queue until dropped
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let remaining = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::PLATE_SERVICE_POOL_WAITING.set(remaining as i64);
    }
}

enum Admission {
    /// Reject when the queue is full
    Bounded,
    /// Wait regardless of queue length (work that was already admitted)
    Unbounded,
}

impl InferencePool {
    pub fn new(pipeline: Arc<PlatePipeline>, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        info!(workers, queue_depth, "Inference pool ready");

        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(workers)),
            waiting: Arc::new(AtomicUsize::new(0)),
            workers,
            queue_depth,
        }
    }

    pub fn pipeline(&self) -> &Arc<PlatePipeline> {
        &self.pipeline
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Invocations currently running
    pub fn active(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Invocations waiting for a worker
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// True when a new single submission would be rejected
    pub fn is_saturated(&self) -> bool {
        self.permits.available_permits() == 0 && self.waiting() >= self.queue_depth
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Stop admitting work; running invocations finish normally
    pub fn close(&self) {
        self.permits.close();
        info!("Inference pool closed");
    }

    /// Run one image through the pipeline on a worker
    pub async fn submit(&self, bytes: Vec<u8>, thresholds: Thresholds) -> Result<ImageResult, PoolError> {
        let permit = self.acquire(Admission::Bounded).await?;
        self.run(permit, bytes, thresholds).await
    }

    /// Process images in order, one at a time.
    ///
    /// Cancellation is observed between images: the image in flight
    /// completes, every later one is reported as cancelled.
    pub async fn process_batch(
        &self,
        images: Vec<Vec<u8>>,
        thresholds: Thresholds,
        cancel: CancellationToken,
    ) -> Vec<BatchItem> {
        let total = images.len();
        let mut items = Vec::with_capacity(total);

        for (position, bytes) in images.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.acquire(Admission::Unbounded) => permit,
            };

            let item = match permit {
                Ok(permit) => match self.run(permit, bytes, thresholds).await {
                    Ok(result) => BatchItem::Completed { result },
                    Err(e) => {
                        warn!(position, error = %e, "Batch image failed");
                        BatchItem::Failed {
                            error: e.to_string(),
                        }
                    }
                },
                Err(e) => BatchItem::Failed {
                    error: e.to_string(),
                },
            };
            items.push(item);
        }

        if items.len() < total {
            info!(
                completed = items.len(),
                cancelled = total - items.len(),
                "Batch cancelled"
            );
            items.resize(total, BatchItem::Cancelled);
        }

        items
    }

    async fn acquire(&self, admission: Admission) -> Result<OwnedSemaphorePermit, PoolError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(tokio::sync::TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(tokio::sync::TryAcquireError::NoPermits) => {}
        }

        let queue_depth = self.queue_depth;
        let reserved = match admission {
            Admission::Unbounded => {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                true
            }
            Admission::Bounded => self
                .waiting
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < queue_depth).then_some(n + 1)
                })
                .is_ok(),
        };

        if !reserved {
            metrics::PLATE_SERVICE_POOL_REJECTIONS.inc();
            warn!(
                workers = self.workers,
                queued = self.waiting(),
                "Inference pool saturated, rejecting submission"
            );
            return Err(PoolError::Saturated {
                workers: self.workers,
                queued: self.waiting(),
            });
        }

        let slot = QueueSlot(self.waiting.clone());
        metrics::PLATE_SERVICE_POOL_WAITING.set(self.waiting() as i64);
        debug!(queued = self.waiting(), "Waiting for inference worker");

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        drop(slot);

        Ok(permit)
    }

    async fn run(
        &self,
        permit: OwnedSemaphorePermit,
        bytes: Vec<u8>,
        thresholds: Thresholds,
    ) -> Result<ImageResult, PoolError> {
        metrics::PLATE_SERVICE_POOL_ACTIVE.set(self.active() as i64);

        let pipeline = self.pipeline.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = pipeline.process(&bytes, thresholds);
            drop(permit);
            result
        })
        .await;

        metrics::PLATE_SERVICE_POOL_ACTIVE.set(self.active() as i64);

        joined
            .map_err(|e| PoolError::Worker(e.to_string()))?
            .map_err(PoolError::from)
    }
}
