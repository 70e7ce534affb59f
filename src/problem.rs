//! The reprojection problem as seen by the optimizer.
//!
//! [`ReprojectionProblem`] writes parameter vectors into the scene, measures
//! the batch and hands the optimizer-facing residuals (with the robust loss
//! applied) back to the LM engine. Jacobians are built by finite differences,
//! either densely (every column re-measures the whole batch) or sparsely (a
//! column only re-measures the (marker, frame) entries its parameter moves).

use nalgebra::DVector;
use tracing::{debug, info};

use crate::error::{CamSolveError, CamSolveResult};
use crate::layout::SolveLayout;
use crate::linalg::SparseMatrix;
use crate::loss::RobustLoss;
use crate::measure::{ErrorMeasurer, ErrorStats, Measurement};
use crate::optimizer::finite_difference::{assemble, push_column};
use crate::optimizer::{
    AutoDiffType, IterationState, LeastSquaresProblem, central_difference, forward_difference,
    numeric_jacobian,
};
use crate::parameter::{ParameterMapping, write_parameter, write_parameters};
use crate::scene::Scene;
use crate::solve::{IterationRecord, SolveMonitor};
use crate::topology::LensTopology;

/// How Jacobian columns are evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacobianSettings {
    /// Re-measure every residual for every column.
    pub dense: bool,
    pub auto_diff_type: AutoDiffType,
    /// Finite-difference step in internal parameter units.
    pub delta: f64,
}

pub struct ReprojectionProblem<'a> {
    scene: &'a mut Scene,
    topology: LensTopology,
    layout: &'a SolveLayout,
    measurer: ErrorMeasurer,
    mapping: ParameterMapping,
    loss: Option<&'a RobustLoss>,
    jacobian: JacobianSettings,
    monitor: &'a mut dyn SolveMonitor,
    log_iterations: bool,
    /// Raw measurement at the last parameters passed to `residuals`.
    baseline: Option<(DVector<f64>, Measurement)>,
    candidate_stats: ErrorStats,
    accepted_stats: ErrorStats,
    iteration_log: Vec<IterationRecord>,
}

impl<'a> ReprojectionProblem<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scene: &'a mut Scene,
        topology: LensTopology,
        layout: &'a SolveLayout,
        measurer: ErrorMeasurer,
        mapping: ParameterMapping,
        loss: Option<&'a RobustLoss>,
        jacobian: JacobianSettings,
        monitor: &'a mut dyn SolveMonitor,
        log_iterations: bool,
    ) -> Self {
        Self {
            scene,
            topology,
            layout,
            measurer,
            mapping,
            loss: loss.filter(|loss| !loss.is_trivial()),
            jacobian,
            monitor,
            log_iterations,
            baseline: None,
            candidate_stats: ErrorStats::default(),
            accepted_stats: ErrorStats::default(),
            iteration_log: Vec::new(),
        }
    }

    /// Write `params` and measure the full batch, without polling the monitor.
    ///
    /// The result becomes the accepted state reported by iteration records.
    pub fn measure_at(&mut self, params: &DVector<f64>) -> CamSolveResult<Measurement> {
        write_parameters(self.scene, &mut self.topology, self.layout, self.mapping, params)?;
        let mut measurement = Measurement::zeros(self.layout);
        self.measurer
            .measure(self.scene, &self.topology, self.layout, None, &mut measurement)?;
        self.accepted_stats = measurement.stats;
        self.candidate_stats = measurement.stats;
        self.baseline = Some((params.clone(), measurement.clone()));
        Ok(measurement)
    }

    pub fn take_iteration_log(&mut self) -> Vec<IterationRecord> {
        std::mem::take(&mut self.iteration_log)
    }

    fn check_interrupted(&self) -> CamSolveResult<()> {
        if self.monitor.is_interrupted() {
            Err(CamSolveError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn optimizer_residuals(&self, errors: &[f64]) -> Vec<f64> {
        let mut residuals = errors.to_vec();
        if let Some(loss) = self.loss {
            loss.apply(&mut residuals);
        }
        residuals
    }

    fn dense_jacobian(
        &mut self,
        params: &DVector<f64>,
        residuals: &DVector<f64>,
    ) -> CamSolveResult<SparseMatrix> {
        let scene = &mut *self.scene;
        let topology = &mut self.topology;
        let measurer = &mut self.measurer;
        let monitor = &*self.monitor;
        let layout = self.layout;
        let mapping = self.mapping;
        let loss = self.loss;
        let delta = self.jacobian.delta;

        let jacobian = numeric_jacobian(
            |p: &DVector<f64>| {
                if monitor.is_interrupted() {
                    return Err(CamSolveError::Interrupted);
                }
                write_parameters(scene, topology, layout, mapping, p)?;
                let mut measurement = Measurement::zeros(layout);
                measurer.measure(scene, topology, layout, None, &mut measurement)?;
                let mut errors = measurement.errors;
                if let Some(loss) = loss {
                    loss.apply(&mut errors);
                }
                Ok(DVector::from_vec(errors))
            },
            |col, internal| {
                let attr = &layout.attributes[layout.params[col].attr_index];
                let (delta_a, _) = mapping.difference_steps(attr, internal, delta);
                (delta_a, delta_a)
            },
            params,
            residuals,
        );
        write_parameters(self.scene, &mut self.topology, self.layout, self.mapping, params)?;
        jacobian
    }

    /// Residuals with one parameter moved, re-measuring the masked entries only.
    fn perturbed_residuals(
        &mut self,
        param: usize,
        internal: f64,
        mask: &[bool],
        baseline: &Measurement,
        work: &mut Measurement,
    ) -> CamSolveResult<Vec<f64>> {
        work.errors.copy_from_slice(&baseline.errors);
        write_parameter(
            self.scene,
            &mut self.topology,
            self.layout,
            self.mapping,
            param,
            internal,
        )?;
        self.measurer
            .measure(self.scene, &self.topology, self.layout, Some(mask), work)?;
        Ok(self.optimizer_residuals(&work.errors))
    }

    fn sparse_jacobian(
        &mut self,
        params: &DVector<f64>,
        residuals: &DVector<f64>,
    ) -> CamSolveResult<SparseMatrix> {
        let baseline = match self.baseline.take() {
            Some((at, measurement)) if at == *params => measurement,
            _ => {
                write_parameters(self.scene, &mut self.topology, self.layout, self.mapping, params)?;
                let mut measurement = Measurement::zeros(self.layout);
                self.measurer
                    .measure(self.scene, &self.topology, self.layout, None, &mut measurement)?;
                measurement
            }
        };

        let layout = self.layout;
        let num_rows = residuals.len();
        let central = self.jacobian.auto_diff_type == AutoDiffType::Central;
        let mut mask = vec![false; layout.marker_frames.len()];
        let mut work = baseline.clone();
        let mut triplets = Vec::new();

        for (col, slot) in layout.params.iter().enumerate() {
            self.check_interrupted()?;
            let attr = &layout.attributes[slot.attr_index];
            let internal = params[col];
            let (delta_a, delta_b) =
                self.mapping
                    .difference_steps(attr, internal, self.jacobian.delta);
            let entries = &layout.param_entries[col];
            for &entry in entries {
                mask[entry] = true;
            }

            let value_a =
                self.perturbed_residuals(col, internal + delta_a, &mask, &baseline, &mut work)?;
            if central && delta_a != delta_b {
                let value_b =
                    self.perturbed_residuals(col, internal + delta_b, &mask, &baseline, &mut work)?;
                push_column(
                    &mut triplets,
                    col,
                    (0..num_rows).map(|row| {
                        (row, central_difference(value_a[row], value_b[row], delta_a, delta_b))
                    }),
                );
            } else {
                push_column(
                    &mut triplets,
                    col,
                    (0..num_rows)
                        .map(|row| (row, forward_difference(value_a[row], residuals[row], delta_a))),
                );
            }

            write_parameter(
                self.scene,
                &mut self.topology,
                self.layout,
                self.mapping,
                col,
                internal,
            )?;
            for &entry in entries {
                mask[entry] = false;
            }
        }

        debug!(
            "sparse jacobian: {} x {}, {} non-zeros",
            num_rows,
            layout.num_params(),
            triplets.len()
        );
        self.baseline = Some((params.clone(), baseline));
        assemble(num_rows, layout.num_params(), &triplets)
    }
}

impl LeastSquaresProblem for ReprojectionProblem<'_> {
    fn num_parameters(&self) -> usize {
        self.layout.num_params()
    }

    fn num_residuals(&self) -> usize {
        self.layout.num_errors()
    }

    fn residuals(&mut self, params: &DVector<f64>) -> CamSolveResult<DVector<f64>> {
        self.check_interrupted()?;
        write_parameters(self.scene, &mut self.topology, self.layout, self.mapping, params)?;
        let mut measurement = Measurement::zeros(self.layout);
        self.measurer
            .measure(self.scene, &self.topology, self.layout, None, &mut measurement)?;
        self.candidate_stats = measurement.stats;
        let residuals = self.optimizer_residuals(&measurement.errors);
        self.baseline = Some((params.clone(), measurement));
        Ok(DVector::from_vec(residuals))
    }

    fn jacobian(
        &mut self,
        params: &DVector<f64>,
        residuals: &DVector<f64>,
    ) -> CamSolveResult<SparseMatrix> {
        self.check_interrupted()?;
        if self.jacobian.dense || self.jacobian.auto_diff_type == AutoDiffType::Off {
            self.dense_jacobian(params, residuals)
        } else {
            self.sparse_jacobian(params, residuals)
        }
    }

    fn on_iteration(&mut self, state: &IterationState) -> CamSolveResult<()> {
        if state.accepted {
            self.accepted_stats = self.candidate_stats;
        }
        let record = IterationRecord {
            iteration: state.iteration,
            cost: state.cost,
            error_avg: self.accepted_stats.avg,
            error_min: self.accepted_stats.min,
            error_max: self.accepted_stats.max,
            damping: state.damping,
            step_norm: state.step_norm,
            accepted: state.accepted,
        };
        info!("iteration {:3} {}", record.iteration, self.accepted_stats);
        self.monitor.on_iteration(&record);
        if self.log_iterations {
            self.iteration_log.push(record);
        }
        self.check_interrupted()
    }
}
