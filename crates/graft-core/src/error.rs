//! Error types for graft.

use thiserror::Error;

/// Result type alias for graft operations.
pub type Result<T> = std::result::Result<T, GraftError>;

/// Errors that can occur while converting a checkpoint.
///
/// All variants are fatal: a conversion is either correct end to end or it
/// is aborted. Nothing is retried.
#[derive(Error, Debug)]
pub enum GraftError {
    /// Checkpoint file could not be parsed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A remote fetch (checkpoint, test image) failed.
    #[error("download error: {0}")]
    Download(String),

    /// An upload to the artifact hub failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// A tensor expected by the model schema is absent from the state dict.
    #[error("missing tensor: {0}")]
    MissingTensor(String),

    /// A tensor is present but its shape does not match the model schema.
    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Parameter name being bound.
        name: String,
        /// Shape required by the model schema.
        expected: Vec<usize>,
        /// Shape found in the state dict.
        got: Vec<usize>,
    },

    /// The state dict holds tensors the model schema never consumed.
    #[error("unexpected tensors left after binding: {0}")]
    UnexpectedTensors(String),

    /// Two state dicts collided while merging under a namespace prefix.
    #[error("key collision while merging: {0}")]
    KeyCollision(String),

    /// A golden-output assertion failed; the conversion is incorrect.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Image decoding or preprocessing error.
    #[error("image error: {0}")]
    Image(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
