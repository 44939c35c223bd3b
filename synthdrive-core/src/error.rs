//! Error taxonomy for the generation pipeline

use std::fmt::Display;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the pipeline components
#[derive(Debug, Error)]
pub enum FactoryError {
    /// A pre-installed model directory or file is absent
    #[error("{component} model missing at {}; run the model installer first", path.display())]
    MissingArtifact {
        component: &'static str,
        path: PathBuf,
    },

    /// Captioning failed; the job is aborted before generation starts
    #[error("Vision error: {0}")]
    Vision(String),

    /// Sampling failed, usually by exhausting device memory
    #[error("Generation error: {0}")]
    Generation(String),

    /// The background worker ended without reporting a result
    #[error("generation worker stopped without a result")]
    WorkerLost,

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, FactoryError>;

impl FactoryError {
    pub fn vision(err: impl Display) -> Self {
        Self::Vision(format!("{err:#}"))
    }

    pub fn generation(err: impl Display) -> Self {
        Self::Generation(format!("{err:#}"))
    }

    /// Whether a generation failure looks like device memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::Generation(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("out of memory") || msg.contains("out_of_memory")
            }
            _ => false,
        }
    }

    /// Fatal before any job can run; the caller has to fix the install.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(self, Self::MissingArtifact { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_artifact_display() {
        let err = FactoryError::MissingArtifact {
            component: "captioning",
            path: PathBuf::from("models/blip-image-captioning-base"),
        };
        let msg = err.to_string();
        assert!(msg.contains("captioning"));
        assert!(msg.contains("blip-image-captioning-base"));
        assert!(msg.contains("installer"));
        assert!(err.is_missing_artifact());
    }

    #[test]
    fn test_vision_error_display() {
        let err = FactoryError::vision("unsupported image layout");
        assert_eq!(err.to_string(), "Vision error: unsupported image layout");
    }

    #[test]
    fn test_out_of_memory_detection() {
        let oom =
            FactoryError::generation("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")");
        assert!(oom.is_out_of_memory());

        let other = FactoryError::generation("shape mismatch in conv2d");
        assert!(!other.is_out_of_memory());
        assert!(!FactoryError::WorkerLost.is_out_of_memory());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: FactoryError = io.into();
        assert!(matches!(err, FactoryError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FactoryError>();
    }
}
