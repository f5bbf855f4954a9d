use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The profile violates one of its invariants. Raised by `Profile::validate`
    /// and never retried.
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// A frame handed to the inverse transform does not hold exactly one
    /// window of coefficients.
    #[error("invalid frame: expected {expected} coefficients, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    /// The consumer of a hash stream went away before generation finished.
    #[error("hash sink closed")]
    SinkClosed,

    #[error("unsupported audio: {0}")]
    UnsupportedAudio(String),

    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}
