use thiserror::Error;

pub type Result<T> = std::result::Result<T, QnnError>;

#[derive(Debug, Error)]
pub enum QnnError {
    /// A buffer or inference operation was attempted outside of a `Ready` session.
    #[error("accelerator must be initialized before buffer preparation or inference")]
    NotInitialized,

    /// The bit packing scheme only handles 1 to 8 bits per activation.
    #[error("unsupported activation bit width {bits}, the packing scheme handles 1 to 8 bits")]
    UnsupportedBitWidth { bits: u32 },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("accelerator resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("invalid threshold set: {0}")]
    InvalidThresholds(String),

    #[error("invalid convolution geometry: {0}")]
    InvalidGeometry(String),

    #[error("layer {0:?} not found in layer table")]
    MissingLayer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parameter serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl QnnError {
    pub(crate) fn shape(expected: &[usize], actual: &[usize]) -> Self {
        QnnError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
