use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Plate Service Metrics ====
    pub static ref PLATE_SERVICE_IMAGES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "plate_service_images_processed_total",
                "Total number of images run through the plate pipeline",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_PLATES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "plate_service_plates_total",
                "Plate detections by outcome (recognized, unknown, skipped)",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_CHARACTERS: IntCounter = {
        let metric = IntCounter::new(
            "plate_service_characters_total",
            "Characters kept after confidence filtering",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_INFERENCE_TIME: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "plate_service_inference_time_seconds",
                "Time spent in detector inference (excluding pre/post processing)",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0]),
            &["detector", "execution_provider"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_PIPELINE_LATENCY: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "plate_service_pipeline_latency_seconds",
                "End-to-end latency of one image through the pipeline",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_ARTIFACT_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "plate_service_artifact_failures_total",
                "Artifacts that could not be written",
            ),
            &["kind"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_POOL_ACTIVE: IntGauge = {
        let metric = IntGauge::new(
            "plate_service_pool_active",
            "Pipeline invocations currently running",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_POOL_WAITING: IntGauge = {
        let metric = IntGauge::new(
            "plate_service_pool_waiting",
            "Pipeline invocations waiting for a worker",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_POOL_REJECTIONS: IntCounter = {
        let metric = IntCounter::new(
            "plate_service_pool_rejections_total",
            "Submissions rejected because the inference pool was saturated",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PLATE_SERVICE_DETECTOR_HEALTH: IntGaugeVec = {
        let metric = IntGaugeVec::new(
            Opts::new(
                "plate_service_detector_health",
                "Health status of detectors (1=healthy, 0=unhealthy)",
            ),
            &["detector"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Register every metric so that `/metrics` lists them before first use
pub fn init_metrics() {
    lazy_static::initialize(&PLATE_SERVICE_IMAGES_PROCESSED);
    lazy_static::initialize(&PLATE_SERVICE_PLATES);
    lazy_static::initialize(&PLATE_SERVICE_CHARACTERS);
    lazy_static::initialize(&PLATE_SERVICE_INFERENCE_TIME);
    lazy_static::initialize(&PLATE_SERVICE_PIPELINE_LATENCY);
    lazy_static::initialize(&PLATE_SERVICE_ARTIFACT_FAILURES);
    lazy_static::initialize(&PLATE_SERVICE_POOL_ACTIVE);
    lazy_static::initialize(&PLATE_SERVICE_POOL_WAITING);
    lazy_static::initialize(&PLATE_SERVICE_POOL_REJECTIONS);
    lazy_static::initialize(&PLATE_SERVICE_DETECTOR_HEALTH);
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}
