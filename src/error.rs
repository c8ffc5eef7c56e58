use thiserror::Error;

pub type SsdResult<T> = Result<T, SsdError>;

/// Errors raised by the box pipeline.
///
/// Everything except [`SsdError::NonFinite`] and [`SsdError::TensorData`] is a
/// configuration or shape problem detected before any numerical work starts.
#[derive(Debug, Error)]
pub enum SsdError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("prior count mismatch: expected {expected} priors, got {actual}")]
    PriorCountMismatch { expected: usize, actual: usize },
    #[error("prior {index} has a non-positive size ({w}, {h})")]
    DegeneratePrior { index: usize, w: f32, h: f32 },
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("invalid ground truth: {0}")]
    InvalidGroundTruth(String),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
}

impl SsdError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SsdError::InvalidConfig(msg.into())
    }
}
