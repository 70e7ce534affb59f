//! Levenberg-Marquardt backends for the reprojection problem.
//!
//! Every backend runs the same damped normal-equation engine
//! ([`LevenbergMarquardt`]) and differs in its defaults, the features it
//! advertises and its damping policy:
//! - `levmar`: Nielsen damping on an identity diagonal
//! - `cminpack_lmdif`: step-quality damping with Marquardt scaling, dense
//!   forward-difference Jacobian
//! - `cminpack_lmder`: as `lmdif` with forward or central differences and a
//!   sparse, relationship-aware Jacobian

use faer::sparse::SparseColMat;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CamSolveError, CamSolveResult};

pub mod finite_difference;
pub mod levenberg_marquardt;

pub use finite_difference::{
    AutoDiffType, central_difference, forward_difference, numeric_jacobian,
};
pub use levenberg_marquardt::{
    DampingStrategy, LevenbergMarquardt, LevenbergMarquardtConfig, LevenbergMarquardtSummary,
    OptimizationOutcome,
};

/// Selectable solver backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    Levmar,
    CminpackLmdif,
    #[default]
    CminpackLmder,
}

/// Features a backend supports. Requests are validated against this once,
/// before a solve starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverCapabilities {
    pub supports_auto_diff_forward: bool,
    pub supports_auto_diff_central: bool,
    pub supports_parameter_bounds: bool,
    pub supports_robust_loss: bool,
}

/// Backend defaults for options the caller leaves unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverDefaults {
    pub iterations: usize,
    pub tau: f64,
    pub epsilon1: f64,
    pub epsilon2: f64,
    pub epsilon3: f64,
    pub delta: f64,
    pub auto_diff_type: AutoDiffType,
    pub auto_param_scale: bool,
}

impl SolverType {
    pub const ALL: [SolverType; 3] = [
        SolverType::Levmar,
        SolverType::CminpackLmdif,
        SolverType::CminpackLmder,
    ];

    pub fn capabilities(self) -> SolverCapabilities {
        match self {
            SolverType::Levmar => SolverCapabilities {
                supports_auto_diff_forward: true,
                supports_auto_diff_central: true,
                supports_parameter_bounds: true,
                supports_robust_loss: true,
            },
            SolverType::CminpackLmdif => SolverCapabilities {
                supports_auto_diff_forward: true,
                supports_auto_diff_central: false,
                supports_parameter_bounds: true,
                supports_robust_loss: false,
            },
            SolverType::CminpackLmder => SolverCapabilities {
                supports_auto_diff_forward: true,
                supports_auto_diff_central: true,
                supports_parameter_bounds: true,
                supports_robust_loss: false,
            },
        }
    }

    pub fn defaults(self) -> SolverDefaults {
        let auto_param_scale = !matches!(self, SolverType::Levmar);
        SolverDefaults {
            iterations: 100,
            tau: 1.0,
            epsilon1: 1e-6,
            epsilon2: 1e-6,
            epsilon3: 1e-6,
            delta: 1e-4,
            auto_diff_type: AutoDiffType::Forward,
            auto_param_scale,
        }
    }

    pub fn damping_strategy(self) -> DampingStrategy {
        match self {
            SolverType::Levmar => DampingStrategy::Nielsen,
            SolverType::CminpackLmdif | SolverType::CminpackLmder => DampingStrategy::StepQuality,
        }
    }

    /// Whether the backend re-measures every residual for each Jacobian column.
    pub fn dense_jacobian(self) -> bool {
        matches!(self, SolverType::CminpackLmdif)
    }

    pub fn supports_auto_diff(self, auto_diff_type: AutoDiffType) -> bool {
        let caps = self.capabilities();
        match auto_diff_type {
            AutoDiffType::Off => true,
            AutoDiffType::Forward => caps.supports_auto_diff_forward,
            AutoDiffType::Central => caps.supports_auto_diff_central,
        }
    }
}

impl fmt::Display for SolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverType::Levmar => write!(f, "levmar"),
            SolverType::CminpackLmdif => write!(f, "cminpack_lmdif"),
            SolverType::CminpackLmder => write!(f, "cminpack_lmder"),
        }
    }
}

impl FromStr for SolverType {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "levmar" => Ok(SolverType::Levmar),
            "cminpack_lmdif" | "cminpack_lm" => Ok(SolverType::CminpackLmdif),
            "cminpack_lmder" => Ok(SolverType::CminpackLmder),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown solver type: {other}"
            ))),
        }
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationStatus {
    /// Residual norm below epsilon3
    ResidualToleranceReached,
    /// Parameter step below epsilon2
    ParameterToleranceReached,
    /// Gradient infinity norm below epsilon1
    GradientToleranceReached,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// The damped system could not be solved
    NumericalFailure,
    /// User requested termination
    UserTerminated,
    /// Other failure
    Failed(String),
}

impl OptimizationStatus {
    /// Whether the solve produced usable parameters.
    ///
    /// Reaching the iteration cap and user termination are valid terminal
    /// states.
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            OptimizationStatus::NumericalFailure | OptimizationStatus::Failed(_)
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::ResidualToleranceReached => write!(f, "Residual tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
            OptimizationStatus::UserTerminated => write!(f, "User terminated"),
            OptimizationStatus::Failed(msg) => write!(f, "Failed: {msg}"),
        }
    }
}

/// Progress of one LM iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationState {
    pub iteration: usize,
    /// `0.5 * ||e||^2` at the current (accepted) parameters.
    pub cost: f64,
    pub damping: f64,
    pub step_norm: f64,
    pub gradient_norm: f64,
    pub accepted: bool,
}

/// A least squares problem `min 0.5 ||e(p)||^2`.
///
/// Implementations return [`CamSolveError::Interrupted`] from any method to
/// stop the optimizer; it then reports [`OptimizationStatus::UserTerminated`]
/// with the last accepted parameters.
pub trait LeastSquaresProblem {
    fn num_parameters(&self) -> usize;

    fn num_residuals(&self) -> usize;

    fn residuals(&mut self, params: &DVector<f64>) -> CamSolveResult<DVector<f64>>;

    /// Jacobian at `params`, where `residuals` is `e(params)`.
    fn jacobian(
        &mut self,
        params: &DVector<f64>,
        residuals: &DVector<f64>,
    ) -> CamSolveResult<SparseColMat<usize, f64>>;

    fn on_iteration(&mut self, _state: &IterationState) -> CamSolveResult<()> {
        Ok(())
    }
}
