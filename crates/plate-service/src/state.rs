use crate::error::PoolError;
use crate::pipeline::Thresholds;
use crate::worker::InferencePool;
use common::plate_tasks::{BatchItem, ImageResult, PipelineInfo};
use std::sync::Arc;
use telemetry::metrics;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct PlateServiceState {
    inner: Arc<PlateServiceStateInner>,
}

struct PlateServiceStateInner {
    node_id: String,
    pool: InferencePool,
    shutdown: CancellationToken,
}

impl PlateServiceState {
    pub fn new(node_id: String, pool: InferencePool) -> Self {
        Self {
            inner: Arc::new(PlateServiceStateInner {
                node_id,
                pool,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn pool(&self) -> &InferencePool {
        &self.inner.pool
    }

    /// Request thresholds merged over the pipeline defaults
    pub fn thresholds(&self, plate: Option<f32>, character: Option<f32>) -> Thresholds {
        self.inner
            .pool
            .pipeline()
            .default_thresholds()
            .with_overrides(plate, character)
    }

    pub async fn recognize(&self, image: Vec<u8>, thresholds: Thresholds) -> Result<ImageResult, PoolError> {
        self.inner.pool.submit(image, thresholds).await
    }

    /// Process a batch in order; shutting the service down cancels the
    /// images that have not started yet
    pub async fn recognize_batch(
        &self,
        images: Vec<Vec<u8>>,
        thresholds: Thresholds,
    ) -> Result<Vec<BatchItem>, PoolError> {
        let pool = &self.inner.pool;
        if pool.is_closed() {
            return Err(PoolError::Closed);
        }
        if pool.is_saturated() {
            metrics::PLATE_SERVICE_POOL_REJECTIONS.inc();
            return Err(PoolError::Saturated {
                workers: pool.workers(),
                queued: pool.waiting(),
            });
        }

        let cancel = self.inner.shutdown.child_token();
        Ok(pool.process_batch(images, thresholds, cancel).await)
    }

    pub fn pipeline_info(&self) -> PipelineInfo {
        self.inner.pool.pipeline().info()
    }

    /// Ready when accepting work and both detectors are healthy
    pub fn is_ready(&self) -> bool {
        let pipeline = self.inner.pool.pipeline();
        let info = pipeline.info();

        for detector in [&info.plate_detector, &info.char_detector] {
            metrics::PLATE_SERVICE_DETECTOR_HEALTH
                .with_label_values(&[detector.id.as_str()])
                .set(i64::from(detector.healthy));
        }

        !self.inner.shutdown.is_cancelled() && !self.inner.pool.is_closed() && pipeline.is_healthy()
    }

    pub fn shutdown(&self) {
        info!("Shutting down plate service...");
        self.inner.shutdown.cancel();
        self.inner.pool.close();
        info!("Plate service shutdown complete");
    }
}
