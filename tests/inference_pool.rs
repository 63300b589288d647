/// Integration tests for the bounded inference pool
use common::plate_tasks::{BatchItem, BoundingBox, Detection};
use image::DynamicImage;
use plate_service::{
    annotate::Annotator,
    artifacts::ArtifactStore,
    detector::{Detector, ScriptedDetector},
    Alphabet, InferencePool, PipelineConfig, PlatePipeline, PoolError, Thresholds,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Plate detector that blocks every call until the gate is opened
#[derive(Default)]
struct GatedDetector {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl GatedDetector {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl Detector for GatedDetector {
    fn id(&self) -> &str {
        "plate"
    }

    fn detect(&self, _image: &DynamicImage, _threshold: Option<f32>) -> anyhow::Result<Vec<Detection>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        Ok(vec![Detection::new(BoundingBox::new(0, 0, 20, 10), 0, 0.9)])
    }
}

fn png_image() -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::new_rgb8(40, 20)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn setup(gate: Arc<GatedDetector>, workers: usize, queue_depth: usize) -> (Arc<InferencePool>, TempDir) {
    let dir = TempDir::new().unwrap();
    let pipeline = PlatePipeline::new(
        gate,
        Arc::new(ScriptedDetector::new(
            "char",
            vec![Detection::new(BoundingBox::new(0, 0, 10, 10), 4, 0.9)],
        )),
        Arc::new(Alphabet::default()),
        ArtifactStore::new(dir.path(), "results").unwrap(),
        Annotator::without_labels(),
        PipelineConfig {
            char_crop_size: None,
            ..PipelineConfig::default()
        },
    )
    .unwrap();

    (
        Arc::new(InferencePool::new(Arc::new(pipeline), workers, queue_depth)),
        dir,
    )
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_saturated_pool_rejects_then_recovers() {
    let gate = Arc::new(GatedDetector::default());
    let (pool, _dir) = setup(gate.clone(), 1, 1);

    // first submission occupies the only worker
    let running = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(png_image(), Thresholds::default()).await }
    });
    wait_until("first submission to start", || gate.entered() == 1).await;
    assert_eq!(pool.active(), 1);

    // second submission takes the only queue slot
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(png_image(), Thresholds::default()).await }
    });
    wait_until("second submission to queue", || pool.waiting() == 1).await;
    assert!(pool.is_saturated());

    // third is turned away immediately
    let err = pool
        .submit(png_image(), Thresholds::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Saturated { workers: 1, queued: 1 }));

    gate.open();
    let first = running.await.unwrap().unwrap();
    let second = queued.await.unwrap().unwrap();

    assert_eq!(first.detections[0].plate_string.as_str(), "4");
    assert_eq!(second.detections[0].plate_string.as_str(), "4");
    assert_eq!(pool.waiting(), 0);
    assert_eq!(pool.active(), 0);
    assert!(!pool.is_saturated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_cancelled_between_images() {
    let gate = Arc::new(GatedDetector::default());
    let (pool, _dir) = setup(gate.clone(), 1, 0);
    let cancel = CancellationToken::new();

    let batch = tokio::spawn({
        let pool = pool.clone();
        let cancel = cancel.clone();
        async move {
            pool.process_batch(
                vec![png_image(), png_image(), png_image()],
                Thresholds::default(),
                cancel,
            )
            .await
        }
    });

    wait_until("first batch image to start", || gate.entered() == 1).await;
    cancel.cancel();
    gate.open();

    let items = batch.await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(matches!(&items[0], BatchItem::Completed { result } if result.detections.len() == 1));
    assert_eq!(items[1], BatchItem::Cancelled);
    assert_eq!(items[2], BatchItem::Cancelled);
    assert_eq!(gate.entered(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_keeps_order_and_isolates_failures() {
    let gate = Arc::new(GatedDetector::default());
    gate.open();
    let (pool, _dir) = setup(gate.clone(), 2, 0);

    let items = pool
        .process_batch(
            vec![png_image(), b"garbage".to_vec(), png_image()],
            Thresholds::default(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(items.len(), 3);
    assert!(matches!(items[0], BatchItem::Completed { .. }));
    assert!(matches!(&items[1], BatchItem::Failed { error } if error.contains("invalid image")));
    assert!(matches!(items[2], BatchItem::Completed { .. }));
    // the undecodable image never reached the detector
    assert_eq!(gate.entered(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_waits_instead_of_rejecting() {
    let gate = Arc::new(GatedDetector::default());
    let (pool, _dir) = setup(gate.clone(), 1, 0);

    let single = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(png_image(), Thresholds::default()).await }
    });
    wait_until("single submission to start", || gate.entered() == 1).await;

    let batch = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.process_batch(vec![png_image()], Thresholds::default(), CancellationToken::new())
                .await
        }
    });
    wait_until("batch to queue", || pool.waiting() == 1).await;

    gate.open();
    assert!(single.await.unwrap().is_ok());
    let items = batch.await.unwrap();
    assert!(matches!(items[0], BatchItem::Completed { .. }));
}
