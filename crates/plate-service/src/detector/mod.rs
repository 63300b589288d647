pub mod onnx;
pub mod scripted;

pub use onnx::{DetectorConfig, OnnxDetector};
pub use scripted::ScriptedDetector;

use anyhow::Result;
use common::plate_tasks::{Detection, DetectorInfo};
use image::DynamicImage;

/// Object detector contract shared by the plate and character passes.
///
/// Implementations are loaded once and shared read-only between concurrent
/// pipeline invocations, so `detect` takes `&self`. Backends that are not
/// safe for concurrent inference serialize internally.
pub trait Detector: Send + Sync {
    /// Short identifier used in logs and metrics (e.g., "plate", "char")
    fn id(&self) -> &str;

    /// Run detection on a decoded image.
    ///
    /// With `threshold` set, only detections with `confidence >= threshold`
    /// are returned; without it, no confidence filtering is applied. The
    /// returned order carries no meaning. A zero-sized image yields an
    /// empty vector.
    fn detect(&self, image: &DynamicImage, threshold: Option<f32>) -> Result<Vec<Detection>>;

    /// Execution provider actually in use (CPU, CUDA, TensorRT)
    fn execution_provider(&self) -> String {
        "CPU".to_string()
    }

    /// Weight file this detector was loaded from, if any
    fn model_path(&self) -> Option<&str> {
        None
    }

    /// Whether the detector can currently serve requests
    fn health_check(&self) -> bool {
        true
    }

    fn info(&self) -> DetectorInfo {
        DetectorInfo {
            id: self.id().to_string(),
            model_path: self.model_path().map(str::to_string),
            execution_provider: self.execution_provider(),
            healthy: self.health_check(),
        }
    }
}

/// Keep detections at or above `threshold`; keep everything when `None`
pub fn retain_confident(detections: &mut Vec<Detection>, threshold: Option<f32>) {
    if let Some(threshold) = threshold {
        detections.retain(|d| d.confidence >= threshold);
    }
}
