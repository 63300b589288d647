use crate::alphabet::{DEFAULT_ALPHABET, DEFAULT_ALPHABET_VERSION};
use crate::api::DEFAULT_MAX_BODY_BYTES;
use crate::detector::DetectorConfig;
use crate::pipeline::{PipelineConfig, Thresholds};
use crate::worker::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct PlateServiceConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Node ID for this plate service instance
    pub node_id: String,

    pub plate_detector: DetectorConfig,
    pub char_detector: DetectorConfig,

    /// Symbols indexed by character class id, and their version tag
    pub alphabet: String,
    pub alphabet_version: String,

    /// Directory artifacts are written to
    pub results_dir: PathBuf,

    /// Prefix of the artifact references returned to callers
    pub results_url_prefix: String,

    /// Label font for annotations; boxes only when unset
    pub font_path: Option<PathBuf>,

    pub pipeline: PipelineConfig,

    pub workers: usize,
    pub queue_depth: usize,
    pub max_body_bytes: usize,
}

impl PlateServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            env::var("PLATE_SERVICE_ADDR").unwrap_or_else(|_| "0.0.0.0:8085".to_string());

        let node_id = env::var("NODE_ID").unwrap_or_else(|_| {
            format!(
                "plate-service-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            )
        });

        let execution_provider =
            env::var("EXECUTION_PROVIDER").unwrap_or_else(|_| "CPU".to_string());
        let device_id: i32 = parse_var("DEVICE_ID", 0)?;

        let mut plate_detector = DetectorConfig::plate(
            env::var("PLATE_MODEL_PATH").unwrap_or_else(|_| "models/plate_detector.onnx".to_string()),
        )
        .with_execution_provider(&execution_provider, device_id);

        let mut char_detector = DetectorConfig::character(
            env::var("CHAR_MODEL_PATH").unwrap_or_else(|_| "models/char_detector.onnx".to_string()),
        )
        .with_execution_provider(&execution_provider, device_id);

        let input_size: u32 = parse_var("MODEL_INPUT_SIZE", plate_detector.input_size)?;
        plate_detector.input_size = input_size;
        char_detector.input_size = input_size;

        let thresholds = Thresholds::new(
            parse_var("PLATE_CONF_THRESHOLD", Thresholds::default().plate)?,
            parse_var("CHAR_CONF_THRESHOLD", Thresholds::default().character)?,
        );
        thresholds
            .validate()
            .context("Invalid default confidence threshold")?;

        let defaults = PipelineConfig::default();
        let char_crop_size = match parse_var::<u32>("CHAR_CROP_SIZE", defaults.char_crop_size.unwrap_or(0))? {
            0 => None,
            size => Some(size),
        };

        let pipeline = PipelineConfig {
            thresholds,
            row_threshold_fraction: check_row_threshold_fraction(parse_var(
                "ROW_THRESHOLD_FRACTION",
                defaults.row_threshold_fraction,
            )?)?,
            char_crop_size,
            jpeg_quality: parse_var("JPEG_QUALITY", defaults.jpeg_quality)?,
        };

        Ok(Self {
            bind_addr,
            node_id,
            plate_detector,
            char_detector,
            alphabet: env::var("PLATE_ALPHABET").unwrap_or_else(|_| DEFAULT_ALPHABET.to_string()),
            alphabet_version: env::var("PLATE_ALPHABET_VERSION")
                .unwrap_or_else(|_| DEFAULT_ALPHABET_VERSION.to_string()),
            results_dir: env::var("RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("runs/results")),
            results_url_prefix: env::var("RESULTS_URL_PREFIX")
                .unwrap_or_else(|_| "results".to_string()),
            font_path: env::var("ANNOTATION_FONT_PATH").ok().map(PathBuf::from),
            pipeline,
            workers: parse_var("INFERENCE_WORKERS", DEFAULT_WORKERS)?,
            queue_depth: parse_var("INFERENCE_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH)?,
            max_body_bytes: parse_var("MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
        })
    }
}

/// Parse `name` from the environment, falling back to `default` when unset
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(_) => Ok(default),
    }
}

/// Row tolerance must be a positive finite fraction of character height
fn check_row_threshold_fraction(value: f32) -> Result<f32> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        anyhow::bail!("Invalid ROW_THRESHOLD_FRACTION: {} (must be finite and > 0)", value)
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid {}: '{}'", name, value))
}
