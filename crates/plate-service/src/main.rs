use anyhow::{Context, Result};
use plate_service::{
    annotate::Annotator,
    api,
    artifacts::ArtifactStore,
    config::PlateServiceConfig,
    detector::{Detector, OnnxDetector},
    Alphabet, InferencePool, PlatePipeline, PlateServiceState,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize telemetry (logging and metrics); the guard flushes file logs
    let _log_guard = telemetry::init_with_service("plate-service");
    telemetry::metrics::init_metrics();

    info!("Starting Plate Service...");

    // Load configuration from environment
    let config = PlateServiceConfig::from_env()?;
    info!(
        "Plate Service configuration: bind={}, node_id={}, workers={}, queue_depth={}",
        config.bind_addr, config.node_id, config.workers, config.queue_depth
    );

    // Load both detectors once; they are shared by every invocation
    let plate_detector: Arc<dyn Detector> = Arc::new(
        OnnxDetector::load("plate", config.plate_detector.clone())
            .context("Failed to load plate detector")?,
    );
    let char_detector: Arc<dyn Detector> = Arc::new(
        OnnxDetector::load("char", config.char_detector.clone())
            .context("Failed to load character detector")?,
    );
    info!(
        plate_provider = %plate_detector.execution_provider(),
        char_provider = %char_detector.execution_provider(),
        "Detectors loaded"
    );

    let alphabet = Alphabet::new(config.alphabet_version.clone(), &config.alphabet)
        .context("Invalid PLATE_ALPHABET")?;
    info!(
        version = alphabet.version(),
        symbols = alphabet.len(),
        "Alphabet loaded"
    );

    let store = ArtifactStore::new(config.results_dir.clone(), config.results_url_prefix.clone())
        .with_context(|| format!("Failed to prepare {}", config.results_dir.display()))?;
    let annotator = Annotator::new(config.font_path.as_deref())?;
    if !annotator.has_labels() {
        info!("ANNOTATION_FONT_PATH not set, annotations will carry boxes only");
    }

    let pipeline = PlatePipeline::new(
        plate_detector,
        char_detector,
        Arc::new(alphabet),
        store,
        annotator,
        config.pipeline.clone(),
    )?;

    let pool = InferencePool::new(Arc::new(pipeline), config.workers, config.queue_depth);
    let state = PlateServiceState::new(config.node_id.clone(), pool);

    // Build HTTP router
    let app = api::router(state.clone(), config.max_body_bytes);

    // Bind and serve
    info!("Binding to {}", config.bind_addr);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Plate Service listening on {}", config.bind_addr);

    // Run with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: PlateServiceState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
    state.shutdown();
}
