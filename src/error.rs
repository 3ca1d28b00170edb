//! Error types for homography fitting, motion models and deconvolution.

use thiserror::Error;

/// Errors raised by the deblurring core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Homography is singular (determinant {determinant:e})")]
    SingularHomography { determinant: f64 },

    #[error("Correspondence count mismatch: {left} points vs {right} points")]
    CorrespondenceMismatch { left: usize, right: usize },

    #[error("Need at least {required} point correspondences, got {got}")]
    TooFewCorrespondences { required: usize, got: usize },

    #[error("Degenerate point configuration for normalization")]
    DegenerateCorrespondences,

    #[error("SVD did not produce right singular vectors")]
    SvdFailed,

    #[error("Unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(usize),

    #[error("Buffer size mismatch: expected {expected} samples, got {got}")]
    BufferSize { expected: usize, got: usize },

    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Motion model has no samples")]
    EmptyMotion,

    #[error("Motion sample {index} out of range ({samples} samples)")]
    SampleOutOfRange { index: usize, samples: usize },

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: usize, height: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
