//! Sparse linear solvers for the damped normal equations.
//!
//! Both solvers answer the same question: given the Jacobian `J`, residuals
//! `r`, a damping `lambda` and a scaling diagonal `D`, find the step `h` with
//! `(J^T J + lambda D) h = -J^T r`.

use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod cholesky;
pub mod qr;

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = SparseColMat<usize, f64>;

/// Linear algebra specific errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    #[error("Matrix construction failed: {0}")]
    MatrixConstruction(String),

    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Which factorization solves the damped system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

pub trait SparseLinearSolver {
    /// Solve `(J^T J + lambda D) h = -J^T r` for `h`.
    fn solve_damped(
        &mut self,
        jacobian: &SparseMatrix,
        residuals: &Mat<f64>,
        lambda: f64,
        diagonal: &[f64],
    ) -> LinAlgResult<Mat<f64>>;
}

pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
    }
}

/// Sparse diagonal matrix `scale * diag(values)`.
pub(crate) fn sparse_diagonal(values: &[f64], scale: f64) -> LinAlgResult<SparseMatrix> {
    let n = values.len();
    let triplets: Vec<_> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| Triplet::new(i, i, scale * v))
        .collect();
    SparseColMat::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| LinAlgError::MatrixConstruction(format!("{e:?}")))
}

pub(crate) fn check_dimensions(
    jacobian: &SparseMatrix,
    residuals: &Mat<f64>,
    diagonal: &[f64],
) -> LinAlgResult<()> {
    if jacobian.nrows() != residuals.nrows() || residuals.ncols() != 1 {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Jacobian has {} rows, residual vector is {}x{}",
            jacobian.nrows(),
            residuals.nrows(),
            residuals.ncols()
        )));
    }
    if jacobian.ncols() != diagonal.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Jacobian has {} columns, scaling diagonal has {} entries",
            jacobian.ncols(),
            diagonal.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two residuals in two unknowns, solution of the undamped system is (1, -2).
    fn small_system() -> (SparseMatrix, Mat<f64>) {
        let jacobian = SparseColMat::try_new_from_triplets(
            3,
            2,
            &[
                Triplet::new(0, 0, 2.0),
                Triplet::new(1, 1, 1.0),
                Triplet::new(2, 0, 1.0),
                Triplet::new(2, 1, 1.0),
            ],
        )
        .unwrap();
        // r = J x0 - b with x* - x0 = (1, -2)
        let residuals = Mat::from_fn(3, 1, |i, _| [-2.0, 2.0, 1.0][i]);
        (jacobian, residuals)
    }

    #[test]
    fn test_solvers_agree_undamped() {
        let (jacobian, residuals) = small_system();
        for solver_type in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
            let mut solver = create_linear_solver(solver_type);
            let step = solver
                .solve_damped(&jacobian, &residuals, 0.0, &[1.0, 1.0])
                .unwrap();
            assert!((step[(0, 0)] - 1.0).abs() < 1e-10, "{solver_type}");
            assert!((step[(1, 0)] + 2.0).abs() < 1e-10, "{solver_type}");
        }
    }

    #[test]
    fn test_solvers_agree_damped() {
        let (jacobian, residuals) = small_system();
        let mut cholesky = SparseCholeskySolver::new();
        let mut qr = SparseQRSolver::new();
        let a = cholesky
            .solve_damped(&jacobian, &residuals, 0.7, &[2.0, 0.5])
            .unwrap();
        let b = qr.solve_damped(&jacobian, &residuals, 0.7, &[2.0, 0.5]).unwrap();
        for i in 0..2 {
            assert!((a[(i, 0)] - b[(i, 0)]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let (jacobian, residuals) = small_system();
        let mut solver = SparseCholeskySolver::new();
        let result = solver.solve_damped(&jacobian, &residuals, 1.0, &[1.0]);
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
    }
}
