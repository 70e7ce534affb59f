//! Levenberg-Marquardt engine.
//!
//! Each iteration solves the damped normal equations
//!
//! ```text
//! (J^T J + mu D) h = -J^T e
//! ```
//!
//! where `D` is either the identity or, with auto scaling, the running maximum
//! of the squared Jacobian column norms. The damping `mu` follows one of two
//! policies:
//! - Nielsen: `mu0 = tau * max diag(J^T J / D)`; on success
//!   `mu *= max(1/3, 1 - (2 rho - 1)^3)`, otherwise `mu *= nu, nu *= 2`
//! - step quality: the same `mu0`; `mu *= 0.3` when `rho > 0.75`, `mu *= 10`
//!   and the step rejected when `rho <= 0`
//!
//! with `rho` the ratio of actual to predicted cost reduction.

use faer::Mat;
use nalgebra::DVector;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{CamSolveError, CamSolveResult};
use crate::linalg::{LinearSolverType, SparseMatrix, create_linear_solver};
use crate::optimizer::{IterationState, LeastSquaresProblem, OptimizationStatus};

/// How the damping parameter reacts to the step quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DampingStrategy {
    #[default]
    Nielsen,
    StepQuality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevenbergMarquardtConfig {
    pub max_iterations: usize,
    /// Scale of the initial damping.
    pub tau: f64,
    /// epsilon1, on `||J^T e||_inf`
    pub gradient_tolerance: f64,
    /// epsilon2, on `||h|| / (||p|| + epsilon2)`
    pub parameter_tolerance: f64,
    /// epsilon3, on `||e||`
    pub residual_tolerance: f64,
    pub damping_strategy: DampingStrategy,
    /// Damp with the running maximum of column norms instead of identity.
    pub auto_scale: bool,
    pub linear_solver_type: LinearSolverType,
    pub damping_min: f64,
    pub damping_max: f64,
    pub damping_increase_factor: f64,
    pub damping_decrease_factor: f64,
    pub min_step_quality: f64,
    pub good_step_quality: f64,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tau: 1.0,
            gradient_tolerance: 1e-6,
            parameter_tolerance: 1e-6,
            residual_tolerance: 1e-6,
            damping_strategy: DampingStrategy::default(),
            auto_scale: false,
            linear_solver_type: LinearSolverType::default(),
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            min_step_quality: 0.0,
            good_step_quality: 0.75,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    pub fn with_tolerances(mut self, gradient: f64, parameter: f64, residual: f64) -> Self {
        self.gradient_tolerance = gradient;
        self.parameter_tolerance = parameter;
        self.residual_tolerance = residual;
        self
    }

    pub fn with_damping_strategy(mut self, strategy: DampingStrategy) -> Self {
        self.damping_strategy = strategy;
        self
    }

    pub fn with_auto_scale(mut self, auto_scale: bool) -> Self {
        self.auto_scale = auto_scale;
        self
    }

    pub fn with_linear_solver(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }
}

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardtSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Steps that reduced the cost and were accepted
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    pub max_gradient_norm: f64,
    pub final_gradient_norm: f64,
    pub final_parameter_update_norm: f64,
    pub function_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub total_time: Duration,
}

impl fmt::Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Levenberg-Marquardt Summary ===")?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Unsuccessful steps:        {}", self.unsuccessful_steps)?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        writeln!(f, "Max gradient norm:         {:.6e}", self.max_gradient_norm)?;
        writeln!(f, "Final gradient norm:       {:.6e}", self.final_gradient_norm)?;
        writeln!(
            f,
            "Final param update norm:   {:.6e}",
            self.final_parameter_update_norm
        )?;
        writeln!(
            f,
            "Evaluations:               {} function, {} jacobian",
            self.function_evaluations, self.jacobian_evaluations
        )?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Last accepted parameters.
    pub parameters: DVector<f64>,
    pub status: OptimizationStatus,
    pub summary: LevenbergMarquardtSummary,
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    damping: f64,
    nu: f64,
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            config,
            damping: 0.0,
            nu: 2.0,
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// `mu0 = tau * max_j (J^T J)_jj / D_j`
    fn initial_damping(&self, column_norms: &[f64], scaling: &[f64]) -> f64 {
        let ratio = column_norms
            .iter()
            .zip(scaling)
            .map(|(c, d)| if *d > 0.0 { c / d } else { *c })
            .fold(0.0_f64, f64::max);
        (self.config.tau * ratio).clamp(self.config.damping_min, self.config.damping_max)
    }

    fn update_scaling(&self, scaling: &mut [f64], column_norms: &[f64]) {
        for (d, &c) in scaling.iter_mut().zip(column_norms) {
            *d = if self.config.auto_scale {
                let running = d.max(c);
                if running > 0.0 { running } else { 1.0 }
            } else {
                1.0
            };
        }
    }

    /// Update the damping from the step quality; returns whether the step is accepted.
    fn update_damping(&mut self, rho: f64) -> bool {
        let accepted = match self.config.damping_strategy {
            DampingStrategy::Nielsen => {
                if rho > 0.0 {
                    let t = 2.0 * rho - 1.0;
                    self.damping *= (1.0 / 3.0_f64).max(1.0 - t * t * t);
                    self.nu = 2.0;
                    true
                } else {
                    self.damping *= self.nu;
                    self.nu *= 2.0;
                    false
                }
            }
            DampingStrategy::StepQuality => {
                if rho > self.config.good_step_quality {
                    self.damping *= self.config.damping_decrease_factor;
                    true
                } else if rho <= self.config.min_step_quality {
                    self.damping *= self.config.damping_increase_factor;
                    false
                } else {
                    true
                }
            }
        };
        self.damping = self
            .damping
            .clamp(self.config.damping_min, self.config.damping_max);
        accepted
    }

    /// Compute step quality ratio (actual vs predicted reduction)
    fn compute_step_quality(&self, current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        if !new_cost.is_finite() {
            return -1.0;
        }
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// Reduction of the linear model, `0.5 h^T (mu D h - g)`.
    fn compute_predicted_reduction(&self, step: &DVector<f64>, gradient: &DVector<f64>, scaling: &[f64]) -> f64 {
        step.iter()
            .zip(gradient.iter())
            .zip(scaling)
            .map(|((h, g), d)| 0.5 * h * (self.damping * d * h - g))
            .sum()
    }

    /// Minimize `0.5 ||e(p)||^2` starting from `initial`.
    pub fn minimize<P>(
        &mut self,
        problem: &mut P,
        initial: DVector<f64>,
    ) -> CamSolveResult<OptimizationOutcome>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let start = Instant::now();
        let n = initial.len();
        if n != problem.num_parameters() {
            return Err(CamSolveError::Solver(format!(
                "Problem has {} parameters, initial vector has {}",
                problem.num_parameters(),
                n
            )));
        }

        let mut summary = LevenbergMarquardtSummary::default();
        let mut params = initial;
        let mut residuals = match problem.residuals(&params) {
            Ok(residuals) => residuals,
            Err(CamSolveError::Interrupted) => {
                return Ok(OptimizationOutcome {
                    parameters: params,
                    status: OptimizationStatus::UserTerminated,
                    summary,
                });
            }
            Err(e) => return Err(e),
        };
        summary.function_evaluations += 1;
        let mut cost = 0.5 * residuals.norm_squared();
        summary.initial_cost = cost;

        let mut linear_solver = create_linear_solver(self.config.linear_solver_type);
        let mut scaling = vec![0.0; n];
        let mut jacobian: Option<SparseMatrix> = None;
        let mut gradient = DVector::zeros(n);
        let mut damping_initialized = false;
        self.nu = 2.0;

        let status = loop {
            if jacobian.is_none() {
                let j = match problem.jacobian(&params, &residuals) {
                    Ok(j) => j,
                    Err(CamSolveError::Interrupted) => break OptimizationStatus::UserTerminated,
                    Err(e) => return Err(e),
                };
                summary.jacobian_evaluations += 1;
                if j.nrows() != residuals.len() || j.ncols() != n {
                    return Err(CamSolveError::Solver(format!(
                        "Jacobian is {}x{}, expected {}x{}",
                        j.nrows(),
                        j.ncols(),
                        residuals.len(),
                        n
                    )));
                }
                gradient = transpose_times(&j, &residuals);
                let column_norms = column_norms_squared(&j);
                self.update_scaling(&mut scaling, &column_norms);
                if !damping_initialized {
                    self.damping = self.initial_damping(&column_norms, &scaling);
                    damping_initialized = true;
                }
                let gradient_norm = gradient.amax();
                summary.final_gradient_norm = gradient_norm;
                summary.max_gradient_norm = summary.max_gradient_norm.max(gradient_norm);
                if gradient_norm <= self.config.gradient_tolerance {
                    break OptimizationStatus::GradientToleranceReached;
                }
                jacobian = Some(j);
            }

            if residuals.norm() <= self.config.residual_tolerance {
                break OptimizationStatus::ResidualToleranceReached;
            }
            if summary.iterations >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            let Some(j) = jacobian.as_ref() else {
                break OptimizationStatus::Failed("Jacobian unavailable".to_string());
            };
            summary.iterations += 1;

            let residual_mat = Mat::from_fn(residuals.len(), 1, |i, _| residuals[i]);
            let step = match linear_solver.solve_damped(j, &residual_mat, self.damping, &scaling) {
                Ok(step) => DVector::from_fn(n, |i, _| step[(i, 0)]),
                Err(e) => {
                    warn!("Linear solve failed at iteration {}: {}", summary.iterations, e);
                    break OptimizationStatus::NumericalFailure;
                }
            };
            let step_norm = step.norm();
            summary.final_parameter_update_norm = step_norm;

            let candidate = &params + &step;
            let new_residuals = match problem.residuals(&candidate) {
                Ok(r) => r,
                Err(CamSolveError::Interrupted) => break OptimizationStatus::UserTerminated,
                Err(e) => return Err(e),
            };
            summary.function_evaluations += 1;
            let new_cost = 0.5 * new_residuals.norm_squared();

            let predicted = self.compute_predicted_reduction(&step, &gradient, &scaling);
            let rho = self.compute_step_quality(cost, new_cost, predicted);
            let accepted = self.update_damping(rho) && new_cost.is_finite();
            if accepted {
                params = candidate;
                residuals = new_residuals;
                cost = new_cost;
                jacobian = None;
                summary.successful_steps += 1;
            } else {
                summary.unsuccessful_steps += 1;
            }

            let state = IterationState {
                iteration: summary.iterations,
                cost,
                damping: self.damping,
                step_norm,
                gradient_norm: summary.final_gradient_norm,
                accepted,
            };
            debug!(
                "iteration {} cost {:.6e} rho {:.3} damping {:.3e} step {:.3e} {}",
                state.iteration,
                cost,
                rho,
                self.damping,
                step_norm,
                if accepted { "accepted" } else { "rejected" }
            );
            match problem.on_iteration(&state) {
                Ok(()) => {}
                Err(CamSolveError::Interrupted) => break OptimizationStatus::UserTerminated,
                Err(e) => return Err(e),
            }

            let tolerance = self.config.parameter_tolerance;
            if accepted && step_norm <= tolerance * (params.norm() + tolerance) {
                break OptimizationStatus::ParameterToleranceReached;
            }
        };

        summary.final_cost = cost;
        summary.final_damping = self.damping;
        summary.total_time = start.elapsed();
        Ok(OptimizationOutcome {
            parameters: params,
            status,
            summary,
        })
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

/// `J^T e`
fn transpose_times(jacobian: &SparseMatrix, residuals: &DVector<f64>) -> DVector<f64> {
    let j = jacobian.as_ref();
    DVector::from_fn(j.ncols(), |col, _| {
        j.row_idx_of_col_raw(col)
            .iter()
            .zip(j.val_of_col(col))
            .map(|(&row, &value)| value * residuals[row])
            .sum()
    })
}

/// Diagonal of `J^T J`.
fn column_norms_squared(jacobian: &SparseMatrix) -> Vec<f64> {
    let j = jacobian.as_ref();
    (0..j.ncols())
        .map(|col| j.val_of_col(col).iter().map(|v| v * v).sum())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::finite_difference::{assemble, push_column};
    use approx::assert_abs_diff_eq;

    /// `e = (1 - x, 10 (y - x^2))`, minimum at (1, 1).
    struct Rosenbrock;

    impl LeastSquaresProblem for Rosenbrock {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn residuals(&mut self, p: &DVector<f64>) -> CamSolveResult<DVector<f64>> {
            Ok(DVector::from_vec(vec![1.0 - p[0], 10.0 * (p[1] - p[0] * p[0])]))
        }

        fn jacobian(
            &mut self,
            p: &DVector<f64>,
            _residuals: &DVector<f64>,
        ) -> CamSolveResult<SparseMatrix> {
            let mut triplets = Vec::new();
            push_column(&mut triplets, 0, [(0, -1.0), (1, -20.0 * p[0])]);
            push_column(&mut triplets, 1, [(1, 10.0)]);
            assemble(2, 2, &triplets)
        }
    }

    /// Stops after a fixed number of iterations.
    struct Interrupting {
        after: usize,
    }

    impl LeastSquaresProblem for Interrupting {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn residuals(&mut self, p: &DVector<f64>) -> CamSolveResult<DVector<f64>> {
            Rosenbrock.residuals(p)
        }

        fn jacobian(&mut self, p: &DVector<f64>, r: &DVector<f64>) -> CamSolveResult<SparseMatrix> {
            Rosenbrock.jacobian(p, r)
        }

        fn on_iteration(&mut self, state: &IterationState) -> CamSolveResult<()> {
            if state.iteration >= self.after {
                Err(CamSolveError::Interrupted)
            } else {
                Ok(())
            }
        }
    }

    /// `e = x - 1` with a Jacobian of the wrong sign: every step goes uphill.
    struct Uphill;

    impl LeastSquaresProblem for Uphill {
        fn num_parameters(&self) -> usize {
            1
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn residuals(&mut self, p: &DVector<f64>) -> CamSolveResult<DVector<f64>> {
            Ok(DVector::from_element(1, p[0] - 1.0))
        }

        fn jacobian(&mut self, _p: &DVector<f64>, _r: &DVector<f64>) -> CamSolveResult<SparseMatrix> {
            let mut triplets = Vec::new();
            push_column(&mut triplets, 0, [(0, -1.0)]);
            assemble(1, 1, &triplets)
        }
    }

    fn config(strategy: DampingStrategy, auto_scale: bool) -> LevenbergMarquardtConfig {
        LevenbergMarquardtConfig::new()
            .with_damping_strategy(strategy)
            .with_auto_scale(auto_scale)
            .with_tolerances(1e-12, 1e-12, 1e-12)
            .with_max_iterations(500)
    }

    #[test]
    fn test_rosenbrock_both_strategies() {
        for (strategy, auto_scale) in [
            (DampingStrategy::Nielsen, false),
            (DampingStrategy::StepQuality, true),
            (DampingStrategy::StepQuality, false),
        ] {
            let mut lm = LevenbergMarquardt::with_config(config(strategy, auto_scale));
            let outcome = lm
                .minimize(&mut Rosenbrock, DVector::from_vec(vec![-1.2, 1.0]))
                .unwrap();
            assert!(outcome.status.is_success(), "{:?}", outcome.status);
            assert_abs_diff_eq!(outcome.parameters[0], 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(outcome.parameters[1], 1.0, epsilon = 1e-6);
            assert!(outcome.summary.final_cost < outcome.summary.initial_cost);
        }
    }

    #[test]
    fn test_qr_linear_solver() {
        let mut lm = LevenbergMarquardt::with_config(
            config(DampingStrategy::Nielsen, false).with_linear_solver(LinearSolverType::SparseQR),
        );
        let outcome = lm
            .minimize(&mut Rosenbrock, DVector::from_vec(vec![-1.2, 1.0]))
            .unwrap();
        assert_abs_diff_eq!(outcome.parameters[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_already_converged() {
        let mut lm = LevenbergMarquardt::new();
        let outcome = lm
            .minimize(&mut Rosenbrock, DVector::from_vec(vec![1.0, 1.0]))
            .unwrap();
        assert_eq!(outcome.status, OptimizationStatus::GradientToleranceReached);
        assert_eq!(outcome.summary.iterations, 0);
    }

    #[test]
    fn test_iteration_cap_is_not_failure() {
        let mut lm = LevenbergMarquardt::with_config(
            config(DampingStrategy::Nielsen, false).with_max_iterations(2),
        );
        let outcome = lm
            .minimize(&mut Rosenbrock, DVector::from_vec(vec![-1.2, 1.0]))
            .unwrap();
        assert_eq!(outcome.status, OptimizationStatus::MaxIterationsReached);
        assert_eq!(outcome.summary.iterations, 2);
        assert!(outcome.status.is_success());
    }

    #[test]
    fn test_rejected_steps_do_not_converge_on_parameter_tolerance() {
        // Growing damping shrinks the rejected steps well below the
        // parameter tolerance long before the iteration cap.
        let mut lm = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new()
                .with_damping_strategy(DampingStrategy::Nielsen)
                .with_tolerances(1e-12, 1e-3, 1e-12)
                .with_max_iterations(20),
        );
        let outcome = lm
            .minimize(&mut Uphill, DVector::from_vec(vec![0.0]))
            .unwrap();
        assert_eq!(outcome.status, OptimizationStatus::MaxIterationsReached);
        assert_eq!(outcome.summary.successful_steps, 0);
        assert_eq!(outcome.summary.unsuccessful_steps, 20);
        assert_eq!(outcome.parameters[0], 0.0);
        assert!(outcome.summary.final_parameter_update_norm < 1e-6);
    }

    #[test]
    fn test_interruption_keeps_accepted_state() {
        let mut lm = LevenbergMarquardt::with_config(config(DampingStrategy::Nielsen, false));
        let mut problem = Interrupting { after: 3 };
        let outcome = lm
            .minimize(&mut problem, DVector::from_vec(vec![-1.2, 1.0]))
            .unwrap();
        assert_eq!(outcome.status, OptimizationStatus::UserTerminated);
        assert_eq!(outcome.summary.iterations, 3);
        let cost = 0.5 * Rosenbrock.residuals(&outcome.parameters).unwrap().norm_squared();
        assert_abs_diff_eq!(cost, outcome.summary.final_cost, epsilon = 1e-12);
    }

    #[test]
    fn test_summary_display() {
        let summary = LevenbergMarquardtSummary {
            initial_cost: 2.0,
            final_cost: 1.0,
            iterations: 4,
            successful_steps: 3,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("Total iterations:          4"));
        assert!(text.contains("(75.0%)"));
    }
}
