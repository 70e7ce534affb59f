//! Finite-difference derivatives.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CamSolveError, CamSolveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoDiffType {
    /// Re-measure the full problem for every column.
    Off,
    #[default]
    Forward,
    Central,
}

impl fmt::Display for AutoDiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoDiffType::Off => write!(f, "off"),
            AutoDiffType::Forward => write!(f, "forward"),
            AutoDiffType::Central => write!(f, "central"),
        }
    }
}

impl FromStr for AutoDiffType {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(AutoDiffType::Off),
            "forward" => Ok(AutoDiffType::Forward),
            "central" => Ok(AutoDiffType::Central),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown auto-diff type: {other}"
            ))),
        }
    }
}

/// `(e(p + dA) - e(p)) / dA`
pub fn forward_difference(perturbed: f64, base: f64, delta: f64) -> f64 {
    (perturbed - base) / delta
}

/// `(e(p + dA) - e(p + dB)) / (dA - dB)`
pub fn central_difference(value_a: f64, value_b: f64, delta_a: f64, delta_b: f64) -> f64 {
    (value_a - value_b) / (delta_a - delta_b)
}

/// Push the non-zero derivatives of one column.
pub(crate) fn push_column(
    triplets: &mut Vec<Triplet<usize, usize, f64>>,
    col: usize,
    rows: impl IntoIterator<Item = (usize, f64)>,
) {
    triplets.extend(
        rows.into_iter()
            .filter(|(_, value)| *value != 0.0)
            .map(|(row, value)| Triplet::new(row, col, value)),
    );
}

pub(crate) fn assemble(
    nrows: usize,
    ncols: usize,
    triplets: &[Triplet<usize, usize, f64>],
) -> CamSolveResult<SparseColMat<usize, f64>> {
    SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
        .map_err(|e| CamSolveError::LinearAlgebra(format!("Jacobian assembly failed: {e:?}")))
}

/// Dense finite-difference Jacobian of `f` at `params`.
///
/// `residuals` must be `f(params)`. `steps(col, value)` returns the step pair
/// `(dA, dB)` for a column: distinct steps give a central difference, equal
/// steps a forward difference along `dA`.
pub fn numeric_jacobian<F, S>(
    mut f: F,
    mut steps: S,
    params: &DVector<f64>,
    residuals: &DVector<f64>,
) -> CamSolveResult<SparseColMat<usize, f64>>
where
    F: FnMut(&DVector<f64>) -> CamSolveResult<DVector<f64>>,
    S: FnMut(usize, f64) -> (f64, f64),
{
    let m = residuals.len();
    let n = params.len();
    let mut triplets = Vec::new();
    let mut perturbed = params.clone();
    for col in 0..n {
        let (delta_a, delta_b) = steps(col, params[col]);
        perturbed[col] = params[col] + delta_a;
        let value_a = f(&perturbed)?;
        if delta_a != delta_b {
            perturbed[col] = params[col] + delta_b;
            let value_b = f(&perturbed)?;
            push_column(
                &mut triplets,
                col,
                (0..m).map(|row| {
                    (row, central_difference(value_a[row], value_b[row], delta_a, delta_b))
                }),
            );
        } else {
            push_column(
                &mut triplets,
                col,
                (0..m).map(|row| (row, forward_difference(value_a[row], residuals[row], delta_a))),
            );
        }
        perturbed[col] = params[col];
    }
    assemble(m, n, &triplets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model(p: &DVector<f64>) -> CamSolveResult<DVector<f64>> {
        Ok(DVector::from_vec(vec![p[0] * p[0], p[0] * p[1], 3.0]))
    }

    #[test]
    fn test_forward_and_central() {
        let p = DVector::from_vec(vec![2.0, -1.0]);
        let e = model(&p).unwrap();
        let forward = numeric_jacobian(model, |_, _| (1e-6, 1e-6), &p, &e)
            .unwrap()
            .to_dense();
        let central = numeric_jacobian(model, |_, _| (1e-4, -1e-4), &p, &e)
            .unwrap()
            .to_dense();
        for j in [&forward, &central] {
            assert_abs_diff_eq!(j[(0, 0)], 4.0, epsilon = 1e-5);
            assert_abs_diff_eq!(j[(1, 0)], -1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(j[(1, 1)], 2.0, epsilon = 1e-5);
            assert_eq!(j[(2, 0)], 0.0);
        }
        // Central differences are exact for quadratics up to rounding.
        assert_abs_diff_eq!(central[(0, 0)], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_rows_not_stored() {
        let p = DVector::from_vec(vec![1.0, 1.0]);
        let e = model(&p).unwrap();
        let j = numeric_jacobian(model, |_, _| (1e-6, 1e-6), &p, &e).unwrap();
        // d(p0^2)/dp1 and the constant row are exact zeros.
        assert_eq!(j.compute_nnz(), 3);
    }

    #[test]
    fn test_steps_follow_each_column() {
        // Column 0 is undefined past 1: step away from the edge.
        let f = |p: &DVector<f64>| -> CamSolveResult<DVector<f64>> {
            if p[0] > 1.0 {
                return Err(CamSolveError::InvalidInput("outside domain".to_string()));
            }
            Ok(DVector::from_vec(vec![2.0 * p[0], p[1] * p[1]]))
        };
        let p = DVector::from_vec(vec![1.0 - 5e-7, 3.0]);
        let e = f(&p).unwrap();
        let delta = 1e-6;
        let j = numeric_jacobian(
            f,
            |col, value| {
                if col == 0 && value + delta > 1.0 {
                    (-delta, -delta)
                } else {
                    (delta, -delta)
                }
            },
            &p,
            &e,
        )
        .unwrap()
        .to_dense();
        assert_abs_diff_eq!(j[(0, 0)], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(j[(1, 1)], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_central_formula_with_asymmetric_steps() {
        // f(x) = 3x: any pair of distinct steps recovers the slope.
        assert_abs_diff_eq!(central_difference(3.0 * 0.2, 3.0 * -0.1, 0.2, -0.1), 3.0, epsilon = 1e-12);
        assert_eq!(forward_difference(1.5, 1.0, 0.5), 1.0);
    }
}
