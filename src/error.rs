//! Error types for the estimator.

use thiserror::Error;

/// Estimator error type.
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Non-positive integration step: dt = {dt}")]
    InvalidTimestep { dt: f64 },

    #[error("Normal equations not positive definite at keyframe {key}")]
    Singular { key: usize },
}

pub type Result<T> = std::result::Result<T, FusionError>;
