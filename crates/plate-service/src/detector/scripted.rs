/// In-memory detector that replays fixed detections, for tests and dry runs
use super::{retain_confident, Detector};
use anyhow::Result;
use common::plate_tasks::Detection;
use image::DynamicImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Detector returning scripted detections instead of running a model.
///
/// A queued response is consumed per call; once the queue is empty every
/// call returns the fallback set.
pub struct ScriptedDetector {
    id: String,
    queued: Mutex<VecDeque<Vec<Detection>>>,
    fallback: Vec<Detection>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    /// Detector that returns `detections` on every call
    pub fn new(id: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            id: id.into(),
            queued: Mutex::new(VecDeque::new()),
            fallback: detections,
            calls: AtomicUsize::new(0),
        }
    }

    /// Detector that returns one response per call, then nothing
    pub fn with_sequence(id: impl Into<String>, responses: Vec<Vec<Detection>>) -> Self {
        Self {
            id: id.into(),
            queued: Mutex::new(responses.into()),
            fallback: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `detect` calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect(&self, image: &DynamicImage, threshold: Option<f32>) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let mut detections = {
            let mut queued = self
                .queued
                .lock()
                .map_err(|e| anyhow::anyhow!("Failed to lock scripted responses: {}", e))?;
            queued.pop_front().unwrap_or_else(|| self.fallback.clone())
        };

        retain_confident(&mut detections, threshold);
        Ok(detections)
    }
}
