pub mod alphabet;
pub mod annotate;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod detector;
pub mod error;
pub mod grouping;
pub mod pipeline;
pub mod state;
pub mod worker;

pub use alphabet::Alphabet;
pub use config::PlateServiceConfig;
pub use error::{PipelineError, PoolError};
pub use pipeline::{PipelineConfig, PlatePipeline, Thresholds};
pub use state::PlateServiceState;
pub use worker::InferencePool;
