use thiserror::Error;

/// Errors that abort a whole `process` call.
///
/// Degenerate crops and empty character sets are not errors; they are
/// handled by the skip and `UNKNOWN` policies of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The uploaded bytes could not be decoded as an image
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),

    /// A detector produced a class id the alphabet has no symbol for
    #[error(
        "class id {class_id} is outside alphabet '{version}' ({alphabet_len} symbols); \
         model and alphabet versions do not match"
    )]
    AlphabetMismatch {
        class_id: usize,
        alphabet_len: usize,
        version: String,
    },

    #[error("invalid {name} threshold {value}: must be within [0, 1]")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("invalid alphabet: {0}")]
    InvalidAlphabet(String),

    /// The artifact root could not be prepared
    #[error("artifact store error: {0}")]
    Artifact(#[from] std::io::Error),

    /// The plate detector failed; nothing can be produced for the image
    #[error("plate detection failed: {0:#}")]
    Inference(anyhow::Error),
}

impl PipelineError {
    /// True for errors caused by the caller's input rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidImage(_) | PipelineError::InvalidThreshold { .. }
        )
    }
}

/// Errors from submitting work to the inference pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker is busy and the wait queue is full
    #[error("inference pool saturated: {workers} running, {queued} queued")]
    Saturated { workers: usize, queued: usize },

    #[error("inference pool is shut down")]
    Closed,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The blocking worker panicked or was aborted
    #[error("inference worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_mismatch_message() {
        let err = PipelineError::AlphabetMismatch {
            class_id: 40,
            alphabet_len: 35,
            version: "v5".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("40"));
        assert!(message.contains("v5"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_threshold_is_client_error() {
        let err = PipelineError::InvalidThreshold {
            name: "plate",
            value: 1.5,
        };
        assert!(err.is_client_error());
        assert!(err.to_string().contains("1.5"));
    }
}
