use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Crates whose chatter is capped at `warn` unless RUST_LOG says otherwise
const QUIET_TARGETS: &[&str] = &["hyper", "tokio", "ort", "tower_http"];

/// Log output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// Compact text format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl LogFormat {
    /// Parse log format from environment variable
    pub fn from_env() -> Self {
        Self::parse(&env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => Self::default(),
        }
    }
}

/// Configuration for structured logging
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log output format (pretty/compact/json)
    pub format: LogFormat,
    /// Service name (e.g., "plate-service")
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Node ID for multi-instance deployments
    pub node_id: Option<String>,
    /// Environment (dev/staging/production)
    pub environment: String,
    /// Enable span events (enter/exit/close)
    pub enable_span_events: bool,
    /// Log to file in addition to stdout
    pub log_to_file: bool,
    /// Log file directory
    pub log_dir: Option<String>,
}

impl LogConfig {
    /// Create a new log configuration from the environment
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::from_env(),
            service_name: service_name.into(),
            service_version: env::var("SERVICE_VERSION").unwrap_or_else(|_| "0.1.0".to_string()),
            node_id: env::var("NODE_ID").ok(),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            enable_span_events: env::var("LOG_SPAN_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_to_file: env::var("LOG_TO_FILE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_dir: env::var("LOG_DIR").ok(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.enable_span_events = enable;
        self
    }

    /// Enable daily rolling JSON log files in `log_dir`
    pub fn with_file_logging(mut self, log_dir: impl Into<String>) -> Self {
        self.log_to_file = true;
        self.log_dir = Some(log_dir.into());
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn build_filter() -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for target in QUIET_TARGETS {
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize structured logging with the given configuration.
///
/// When file logging is enabled the returned guard must be kept alive for
/// the lifetime of the process, otherwise buffered lines are lost.
pub fn init_structured_logging(config: LogConfig) -> Option<WorkerGuard> {
    let span_events = config.span_events();
    let registry = tracing_subscriber::registry().with(build_filter());
    let mut guard = None;

    match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(span_events.clone())
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_writer(io::stdout);

            match config.log_dir.as_ref().filter(|_| config.log_to_file) {
                Some(log_dir) => {
                    let file_appender = tracing_appender::rolling::daily(
                        log_dir,
                        format!("{}.log", config.service_name),
                    );
                    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
                    let file_layer = fmt::layer()
                        .json()
                        .with_span_events(span_events)
                        .with_writer(non_blocking);

                    registry.with(json_layer).with(file_layer).init();
                    guard = Some(file_guard);
                }
                None => registry.with(json_layer).init(),
            }
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(false);

            registry.with(compact_layer).init();
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true);

            registry.with(pretty_layer).init();
        }
    }

    tracing::info!(
        service.name = %config.service_name,
        service.version = %config.service_version,
        node_id = ?config.node_id,
        environment = %config.environment,
        format = ?config.format,
        "structured logging initialized"
    );

    guard
}

/// Initialize logging with service name
pub fn init_with_service(service_name: impl Into<String>) -> Option<WorkerGuard> {
    init_structured_logging(LogConfig::new(service_name))
}
