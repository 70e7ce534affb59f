use std::ops::Mul;

use faer::Mat;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;

use super::{
    LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix, check_dimensions, sparse_diagonal,
};

/// Solves the damped normal equations with a sparse LLT factorization.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizations: usize,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of numeric factorizations performed so far.
    pub fn factorizations(&self) -> usize {
        self.factorizations
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_damped(
        &mut self,
        jacobian: &SparseMatrix,
        residuals: &Mat<f64>,
        lambda: f64,
        diagonal: &[f64],
    ) -> LinAlgResult<Mat<f64>> {
        check_dimensions(jacobian, residuals, diagonal)?;

        // H = J^T * J
        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::MatrixConstruction(format!("{e:?}")))?
            .mul(jacobian.as_ref());

        // g = J^T * -r
        let gradient = jacobian.as_ref().transpose().mul(-residuals);

        // The pattern of J changes whenever a derivative is exactly zero, so the
        // symbolic analysis is redone for every system.
        let damped = hessian + sparse_diagonal(diagonal, lambda)?;
        let symbolic = solvers::SymbolicLlt::try_new(damped.symbolic(), faer::Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        let cholesky =
            solvers::Llt::try_new_with_symbolic(symbolic, damped.as_ref(), faer::Side::Lower)
                .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        self.factorizations += 1;

        let step = cholesky.solve(gradient);
        if step.col(0).iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::FactorizationFailed(
                "Cholesky solve produced a non-finite step".to_string(),
            ));
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::sparse::{SparseColMat, Triplet};

    #[test]
    fn test_rank_deficient_needs_damping() {
        // Second column is zero: J^T J is singular.
        let jacobian =
            SparseColMat::try_new_from_triplets(2, 2, &[Triplet::new(0, 0, 1.0), Triplet::new(1, 0, 1.0)])
                .unwrap();
        let residuals = Mat::from_fn(2, 1, |i, _| [1.0, 3.0][i]);
        let mut solver = SparseCholeskySolver::new();

        assert!(solver.solve_damped(&jacobian, &residuals, 0.0, &[1.0, 1.0]).is_err());

        let step = solver
            .solve_damped(&jacobian, &residuals, 1.0, &[1.0, 1.0])
            .unwrap();
        // (2 + 1) h0 = -4
        assert!((step[(0, 0)] + 4.0 / 3.0).abs() < 1e-12);
        assert!(step[(1, 0)].abs() < 1e-12);
        assert_eq!(solver.factorizations(), 1);
    }
}
