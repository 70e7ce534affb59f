//! Error types for the camsolve library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::linalg::LinAlgError;
use std::num::{ParseFloatError, ParseIntError};
use thiserror::Error;

/// Main result type used throughout the camsolve library
pub type CamSolveResult<T> = Result<T, CamSolveError>;

/// Main error type for the camsolve library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CamSolveError {
    /// Malformed solve request or options, detected before any numeric work
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A node required by the solve could not be resolved in the scene
    #[error("Topology error: {0}")]
    Topology(String),

    /// The scene evaluator failed to produce a value
    #[error("Scene evaluation error: {0}")]
    SceneEvaluation(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// IO related errors (option files)
    #[error("IO error: {0}")]
    Io(String),

    /// The caller requested cancellation while the solve was running
    #[error("Solve interrupted by user")]
    Interrupted,
}

impl From<std::io::Error> for CamSolveError {
    fn from(err: std::io::Error) -> Self {
        CamSolveError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CamSolveError {
    fn from(err: serde_json::Error) -> Self {
        CamSolveError::InvalidInput(format!("Failed to parse JSON: {err}"))
    }
}

impl From<ParseFloatError> for CamSolveError {
    fn from(err: ParseFloatError) -> Self {
        CamSolveError::InvalidInput(format!("Failed to parse float: {err}"))
    }
}

impl From<ParseIntError> for CamSolveError {
    fn from(err: ParseIntError) -> Self {
        CamSolveError::InvalidInput(format!("Failed to parse integer: {err}"))
    }
}

impl From<LinAlgError> for CamSolveError {
    fn from(err: LinAlgError) -> Self {
        CamSolveError::LinearAlgebra(err.to_string())
    }
}
