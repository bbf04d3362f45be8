// THEORY:
// A single error type for the whole crate. The categories mirror how each failure is
// handled by the caller rather than where it happens:
// - `InvalidWindowSize`, `InvalidParameter`, `Configuration` are fatal and raised before any
//   optimization context exists.
// - `ShapeMismatch` is fatal for the call that raised it.
// - `Data` (and the I/O flavours beneath it) is recoverable at the pipeline level: the
//   offending video is skipped and the run continues.
// Running out of iterations is never an error; it is reported through the attack outcome.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttackError {
    #[error("window size must be odd and positive, got {0}")]
    InvalidWindowSize(usize),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AttackError {
    /// Whether the pipeline may skip the current video and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Data(_) | Self::Io(_) | Self::Image(_))
    }
}

pub type Result<T> = std::result::Result<T, AttackError>;
