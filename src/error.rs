//! Errors returned by model construction, decoding and file loading.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HmmError {
    /// The observation sequence has no time steps.
    #[error("observation sequence is empty")]
    EmptyInput,

    /// The observation matrix has the wrong number of columns. Observations are always
    /// time-major: one row per time step, one column per dimension.
    #[error(
        "observation dimensionality ({actual}) does not match HMM emission dimensionality \
         ({expected})"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    /// The model parameters do not describe valid probability distributions.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Malformed arguments to an auxiliary operation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Malformed observation or model file
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HmmError>;
