use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, linalg::solvers::SolveLstsqCore};

use super::{LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix, check_dimensions};

/// Solves the damped system as the least squares problem
/// `[J; sqrt(lambda D)] h = [-r; 0]`, which never forms `J^T J`.
#[derive(Debug, Clone, Default)]
pub struct SparseQRSolver;

impl SparseQRSolver {
    pub fn new() -> Self {
        Self
    }
}

fn augmented_jacobian(
    jacobian: &SparseMatrix,
    lambda: f64,
    diagonal: &[f64],
) -> LinAlgResult<SparseMatrix> {
    let m = jacobian.nrows();
    let n = jacobian.ncols();
    let jacobian = jacobian.as_ref();

    let mut triplets = Vec::with_capacity(jacobian.compute_nnz() + n);
    for col in 0..n {
        let rows = jacobian.row_idx_of_col_raw(col);
        let values = jacobian.val_of_col(col);
        for (&row, &value) in rows.iter().zip(values) {
            triplets.push(Triplet::new(row, col, value));
        }
        let damping = lambda * diagonal[col];
        if damping > 0.0 {
            triplets.push(Triplet::new(m + col, col, damping.sqrt()));
        }
    }
    SparseColMat::try_new_from_triplets(m + n, n, &triplets)
        .map_err(|e| LinAlgError::MatrixConstruction(format!("{e:?}")))
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_damped(
        &mut self,
        jacobian: &SparseMatrix,
        residuals: &Mat<f64>,
        lambda: f64,
        diagonal: &[f64],
    ) -> LinAlgResult<Mat<f64>> {
        check_dimensions(jacobian, residuals, diagonal)?;
        let m = jacobian.nrows();
        let n = jacobian.ncols();
        if m < n && lambda <= 0.0 {
            return Err(LinAlgError::DimensionMismatch(format!(
                "Undamped least squares needs at least {n} rows, got {m}"
            )));
        }

        let j_aug = augmented_jacobian(jacobian, lambda, diagonal)?;
        let mut r_aug = Mat::<f64>::zeros(m + n, 1);
        for i in 0..m {
            r_aug[(i, 0)] = -residuals[(i, 0)];
        }

        let qr = j_aug.as_ref().sp_qr()
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        qr.solve_lstsq_in_place_with_conj(faer::Conj::No, r_aug.as_mut());

        let step = r_aug.submatrix(0, 0, n, 1).to_owned();
        if step.col(0).iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::FactorizationFailed(
                "QR solve produced a non-finite step".to_string(),
            ));
        }
        Ok(step)
    }
}
