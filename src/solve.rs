//! Solve options, requests, results and the solve pipeline.
//!
//! [`solve`] runs the whole camera solve for one request:
//!
//! 1. resolve the options against the selected backend's capabilities and
//!    defaults, and validate the request
//! 2. compute the marker/attribute relation and drop unused solve objects
//! 3. split the frames into batches (all at once, or one frame at a time)
//! 4. per batch: build the layout, the scene evaluator and the lens topology,
//!    measure the initial error, run the backend, and keep or reject the
//!    solved values
//! 5. merge the batch outcomes into one [`SolveResult`]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::attribute::{Attribute, Frame, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::layout::{RegularizationTerm, SolveLayout};
use crate::linalg::LinearSolverType;
use crate::loss::{RobustLoss, RobustLossType};
use crate::measure::{ErrorMeasurer, ErrorStats, Measurement};
use crate::optimizer::{
    AutoDiffType, LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus,
    SolverCapabilities, SolverType,
};
use crate::parameter::{ParameterMapping, read_parameters};
use crate::problem::{JacobianSettings, ReprojectionProblem};
use crate::relationships::{MarkerAttrMatrix, UsageSplit, compute_marker_affects, select};
use crate::scene::{MarkerId, Scene, SceneGraphMode, create_evaluator};
use crate::topology::LensTopology;

/// How the frames of a request are grouped into solves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSolveMode {
    #[default]
    AllFramesAtOnce,
    /// One solve per frame, in frame order.
    PerFrame,
}

impl fmt::Display for FrameSolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSolveMode::AllFramesAtOnce => write!(f, "all_frames_at_once"),
            FrameSolveMode::PerFrame => write!(f, "per_frame"),
        }
    }
}

impl FromStr for FrameSolveMode {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_frames_at_once" | "all" => Ok(FrameSolveMode::AllFramesAtOnce),
            "per_frame" => Ok(FrameSolveMode::PerFrame),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown frame solve mode: {other}"
            ))),
        }
    }
}

/// Statistics-only requests. When any flag is set no backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintStats {
    /// Parameter and residual counts.
    pub inputs: bool,
    /// Marker/attribute relation.
    pub affects: bool,
    pub used_solve_objects: bool,
    /// Error of the current scene state.
    pub deviation: bool,
}

impl PrintStats {
    pub fn any(&self) -> bool {
        self.inputs || self.affects || self.used_solve_objects || self.deviation
    }
}

/// Options of one solve.
///
/// `None` numeric fields fall back to the defaults of the selected backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub solver_type: SolverType,
    pub iterations: Option<usize>,
    pub tau: Option<f64>,
    pub epsilon1: Option<f64>,
    pub epsilon2: Option<f64>,
    pub epsilon3: Option<f64>,
    pub delta: Option<f64>,
    pub auto_diff_type: Option<AutoDiffType>,
    pub auto_param_scale: Option<bool>,
    pub robust_loss_type: RobustLossType,
    pub robust_loss_scale: f64,
    pub linear_solver_type: LinearSolverType,
    pub scene_graph_mode: SceneGraphMode,
    pub time_eval_mode: TimeEvalMode,
    pub frame_solve_mode: FrameSolveMode,
    /// Keep the starting values when the solve made the average error worse.
    pub accept_only_better: bool,
    /// Converts film-back units into pixels.
    pub image_width: f64,
    pub remove_unused_markers: bool,
    pub remove_unused_attributes: bool,
    pub use_marker_position_cache: bool,
    pub force_trigger_eval: bool,
    /// Keep per-iteration statistics on the result.
    pub log_iterations: bool,
    pub print_stats: PrintStats,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            solver_type: SolverType::default(),
            iterations: None,
            tau: None,
            epsilon1: None,
            epsilon2: None,
            epsilon3: None,
            delta: None,
            auto_diff_type: None,
            auto_param_scale: None,
            robust_loss_type: RobustLossType::default(),
            robust_loss_scale: 1.0,
            linear_solver_type: LinearSolverType::default(),
            scene_graph_mode: SceneGraphMode::default(),
            time_eval_mode: TimeEvalMode::default(),
            frame_solve_mode: FrameSolveMode::default(),
            accept_only_better: true,
            image_width: 2048.0,
            remove_unused_markers: true,
            remove_unused_attributes: true,
            use_marker_position_cache: true,
            force_trigger_eval: false,
            log_iterations: false,
            print_stats: PrintStats::default(),
        }
    }
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_solver_type(mut self, solver_type: SolverType) -> Self {
        self.solver_type = solver_type;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = Some(tau);
        self
    }

    pub fn with_epsilons(mut self, epsilon1: f64, epsilon2: f64, epsilon3: f64) -> Self {
        self.epsilon1 = Some(epsilon1);
        self.epsilon2 = Some(epsilon2);
        self.epsilon3 = Some(epsilon3);
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_auto_diff_type(mut self, auto_diff_type: AutoDiffType) -> Self {
        self.auto_diff_type = Some(auto_diff_type);
        self
    }

    pub fn with_auto_param_scale(mut self, auto_param_scale: bool) -> Self {
        self.auto_param_scale = Some(auto_param_scale);
        self
    }

    pub fn with_robust_loss(mut self, loss_type: RobustLossType, scale: f64) -> Self {
        self.robust_loss_type = loss_type;
        self.robust_loss_scale = scale;
        self
    }

    pub fn with_linear_solver(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_scene_graph_mode(mut self, mode: SceneGraphMode) -> Self {
        self.scene_graph_mode = mode;
        self
    }

    pub fn with_time_eval_mode(mut self, mode: TimeEvalMode) -> Self {
        self.time_eval_mode = mode;
        self
    }

    pub fn with_frame_solve_mode(mut self, mode: FrameSolveMode) -> Self {
        self.frame_solve_mode = mode;
        self
    }

    pub fn with_accept_only_better(mut self, accept_only_better: bool) -> Self {
        self.accept_only_better = accept_only_better;
        self
    }

    pub fn with_image_width(mut self, image_width: f64) -> Self {
        self.image_width = image_width;
        self
    }

    pub fn with_remove_unused(mut self, markers: bool, attributes: bool) -> Self {
        self.remove_unused_markers = markers;
        self.remove_unused_attributes = attributes;
        self
    }

    pub fn with_marker_position_cache(mut self, enabled: bool) -> Self {
        self.use_marker_position_cache = enabled;
        self
    }

    pub fn with_force_trigger_eval(mut self, enabled: bool) -> Self {
        self.force_trigger_eval = enabled;
        self
    }

    pub fn with_log_iterations(mut self, enabled: bool) -> Self {
        self.log_iterations = enabled;
        self
    }

    pub fn with_print_stats(mut self, print_stats: PrintStats) -> Self {
        self.print_stats = print_stats;
        self
    }

    /// Fill unset fields from the backend defaults and check every request
    /// against the backend capabilities.
    pub fn resolve(&self) -> CamSolveResult<ResolvedOptions> {
        let solver_type = self.solver_type;
        let capabilities = solver_type.capabilities();
        let defaults = solver_type.defaults();

        let auto_diff_type = self.auto_diff_type.unwrap_or(defaults.auto_diff_type);
        if !solver_type.supports_auto_diff(auto_diff_type) {
            return Err(CamSolveError::Configuration(format!(
                "Solver {solver_type} does not support {auto_diff_type} differences"
            )));
        }

        let iterations = self.iterations.unwrap_or(defaults.iterations);
        let tau = self.tau.unwrap_or(defaults.tau);
        let epsilon1 = self.epsilon1.unwrap_or(defaults.epsilon1);
        let epsilon2 = self.epsilon2.unwrap_or(defaults.epsilon2);
        let epsilon3 = self.epsilon3.unwrap_or(defaults.epsilon3);
        let delta = self.delta.unwrap_or(defaults.delta);
        for (name, value) in [
            ("tau", tau),
            ("epsilon1", epsilon1),
            ("epsilon2", epsilon2),
            ("epsilon3", epsilon3),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CamSolveError::Configuration(format!(
                    "{name} must be a non-negative finite number, got {value}"
                )));
            }
        }
        if !delta.is_finite() || delta <= 0.0 {
            return Err(CamSolveError::Configuration(format!(
                "delta must be a positive finite number, got {delta}"
            )));
        }
        if !self.image_width.is_finite() || self.image_width <= 0.0 {
            return Err(CamSolveError::Configuration(format!(
                "image width must be a positive finite number, got {}",
                self.image_width
            )));
        }

        let robust_loss = if self.robust_loss_type == RobustLossType::Trivial {
            None
        } else if capabilities.supports_robust_loss {
            Some(RobustLoss::new(self.robust_loss_type, self.robust_loss_scale)?)
        } else {
            warn!(
                "Solver {} does not support robust loss functions, ignoring {}",
                solver_type, self.robust_loss_type
            );
            None
        };

        Ok(ResolvedOptions {
            solver_type,
            capabilities,
            iterations,
            tau,
            epsilon1,
            epsilon2,
            epsilon3,
            delta,
            auto_diff_type,
            auto_param_scale: self.auto_param_scale.unwrap_or(defaults.auto_param_scale),
            robust_loss,
            bounded: capabilities.supports_parameter_bounds,
        })
    }
}

/// Options with backend defaults applied, validated against the backend.
#[derive(Debug)]
pub struct ResolvedOptions {
    pub solver_type: SolverType,
    pub capabilities: SolverCapabilities,
    pub iterations: usize,
    pub tau: f64,
    pub epsilon1: f64,
    pub epsilon2: f64,
    pub epsilon3: f64,
    pub delta: f64,
    pub auto_diff_type: AutoDiffType,
    pub auto_param_scale: bool,
    /// `None` when disabled or unsupported.
    pub robust_loss: Option<RobustLoss>,
    /// Solve in the bounded internal parameter space.
    pub bounded: bool,
}

impl ResolvedOptions {
    fn lm_config(&self, linear_solver_type: LinearSolverType) -> LevenbergMarquardtConfig {
        LevenbergMarquardtConfig::new()
            .with_max_iterations(self.iterations)
            .with_tau(self.tau)
            .with_tolerances(self.epsilon1, self.epsilon2, self.epsilon3)
            .with_damping_strategy(self.solver_type.damping_strategy())
            .with_auto_scale(self.auto_param_scale)
            .with_linear_solver(linear_solver_type)
    }

    fn jacobian_settings(&self) -> JacobianSettings {
        JacobianSettings {
            dense: self.solver_type.dense_jacobian(),
            auto_diff_type: self.auto_diff_type,
            delta: self.delta,
        }
    }
}

/// What to solve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub markers: Vec<MarkerId>,
    pub attributes: Vec<Attribute>,
    pub frames: Vec<Frame>,
    /// Terms index into `attributes`.
    pub stiffness: Vec<RegularizationTerm>,
    pub smoothness: Vec<RegularizationTerm>,
}

impl SolveRequest {
    pub fn new(markers: Vec<MarkerId>, attributes: Vec<Attribute>, frames: Vec<Frame>) -> Self {
        Self {
            markers,
            attributes,
            frames,
            stiffness: Vec::new(),
            smoothness: Vec::new(),
        }
    }

    pub fn with_stiffness(mut self, term: RegularizationTerm) -> Self {
        self.stiffness.push(term);
        self
    }

    pub fn with_smoothness(mut self, term: RegularizationTerm) -> Self {
        self.smoothness.push(term);
        self
    }
}

/// Statistics of one LM iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub cost: f64,
    pub error_avg: f64,
    pub error_min: f64,
    pub error_max: f64,
    pub damping: f64,
    pub step_norm: f64,
    pub accepted: bool,
}

/// Progress and cancellation hook, polled between evaluations.
pub trait SolveMonitor {
    fn is_interrupted(&self) -> bool;

    fn on_iteration(&mut self, _record: &IterationRecord) {}
}

/// Shared flag another thread can set to stop a running solve.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl SolveMonitor for CancellationFlag {
    fn is_interrupted(&self) -> bool {
        self.is_cancelled()
    }
}

/// Pixel distance of one marker at one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerError {
    pub marker: String,
    pub frame: Frame,
    pub distance: f64,
}

/// Average pixel distance over the markers measured at a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub frame: Frame,
    pub error_avg: f64,
}

/// Attributes that move a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerAffects {
    pub marker: String,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SolveResult {
    pub success: bool,
    pub status: Option<OptimizationStatus>,
    pub reason: String,
    pub iterations: usize,
    pub function_evals: usize,
    pub jacobian_evals: usize,
    pub error_initial_avg: f64,
    pub error_avg: f64,
    pub error_min: f64,
    pub error_max: f64,
    /// Final optimizer cost, `0.5 * ||e||^2` summed over batches.
    pub error_final: f64,
    pub user_interrupted: bool,
    /// The solved values made the error worse and were reverted.
    pub rejected: bool,
    pub marker_errors: Vec<MarkerError>,
    pub frame_errors: Vec<FrameError>,
    /// User-facing residuals: absolute pixel error per axis, then regularization.
    pub error_list: Vec<f64>,
    pub num_parameters: usize,
    pub num_errors: usize,
    pub num_marker_errors: usize,
    pub num_stiffness_errors: usize,
    pub num_smoothness_errors: usize,
    pub used_markers: Vec<String>,
    pub unused_markers: Vec<String>,
    pub used_attributes: Vec<String>,
    pub unused_attributes: Vec<String>,
    pub affects: Vec<MarkerAffects>,
    pub iteration_log: Vec<IterationRecord>,
}

impl fmt::Display for SolveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Solve Result ===")?;
        writeln!(f, "Success:              {}", self.success)?;
        if !self.reason.is_empty() {
            writeln!(f, "Reason:               {}", self.reason)?;
        }
        writeln!(f, "Iterations:           {}", self.iterations)?;
        writeln!(
            f,
            "Evaluations:          {} function, {} jacobian",
            self.function_evals, self.jacobian_evals
        )?;
        writeln!(
            f,
            "Problem size:         {} parameters, {} errors ({} marker, {} stiffness, {} smoothness)",
            self.num_parameters,
            self.num_errors,
            self.num_marker_errors,
            self.num_stiffness_errors,
            self.num_smoothness_errors
        )?;
        writeln!(f, "Initial error avg:    {:.6}", self.error_initial_avg)?;
        writeln!(
            f,
            "Final error:          avg {:.6} min {:.6} max {:.6}",
            self.error_avg, self.error_min, self.error_max
        )?;
        if self.user_interrupted {
            writeln!(f, "Interrupted by user")?;
        }
        if self.rejected {
            writeln!(f, "Solved values rejected, initial values restored")?;
        }
        Ok(())
    }
}

/// Outcome of one batch before merging.
#[derive(Debug, Default)]
struct BatchOutcome {
    status: Option<OptimizationStatus>,
    iterations: usize,
    function_evals: usize,
    jacobian_evals: usize,
    final_cost: f64,
    user_interrupted: bool,
    rejected: bool,
    initial_distances: Vec<f64>,
    marker_errors: Vec<MarkerError>,
    error_list: Vec<f64>,
    num_parameters: usize,
    num_marker_errors: usize,
    num_stiffness_errors: usize,
    num_smoothness_errors: usize,
    iteration_log: Vec<IterationRecord>,
}

/// Solve objects left after the used/unused split.
struct SolveObjects {
    markers: Vec<MarkerId>,
    attributes: Vec<Attribute>,
    stiffness: Vec<RegularizationTerm>,
    smoothness: Vec<RegularizationTerm>,
    marker_to_attr: MarkerAttrMatrix,
}

/// Run a camera solve over `request`, writing the solved values into `scene`.
pub fn solve(
    scene: &mut Scene,
    request: &SolveRequest,
    options: &SolverOptions,
    monitor: &mut dyn SolveMonitor,
) -> CamSolveResult<SolveResult> {
    let start = Instant::now();
    let resolved = options.resolve()?;
    validate_request(scene, request)?;
    info!(
        "solve: {} markers, {} attributes, {} frames, solver {}",
        request.markers.len(),
        request.attributes.len(),
        request.frames.len(),
        resolved.solver_type
    );

    let mode = options.time_eval_mode;
    let affects = compute_marker_affects(
        scene,
        &request.markers,
        &request.attributes,
        request.frames[0],
        mode,
    )?;
    let split = UsageSplit::from_affects(&affects, request.attributes.len());

    let mut result = SolveResult {
        used_markers: marker_names(scene, request, &split.used_markers)?,
        unused_markers: marker_names(scene, request, &split.unused_markers)?,
        used_attributes: attribute_names(request, &split.used_attributes),
        unused_attributes: attribute_names(request, &split.unused_attributes),
        affects: affects_table(scene, request, &affects)?,
        ..Default::default()
    };

    if split.used_markers.is_empty() {
        return Err(CamSolveError::Configuration(
            "No marker is affected by any solve attribute".to_string(),
        ));
    }
    if split.used_attributes.is_empty() {
        return Err(CamSolveError::Configuration(
            "No solve attribute affects any marker".to_string(),
        ));
    }

    if options.remove_unused_markers {
        for name in &result.unused_markers {
            warn!("Marker {} is not affected by any attribute, removing it", name);
        }
    }
    if options.remove_unused_attributes {
        for name in &result.unused_attributes {
            warn!("Attribute {} does not affect any marker, removing it", name);
        }
    }
    let objects = select_solve_objects(request, &split, &affects, options);

    if options.print_stats.any() {
        print_stats(scene, &objects, &request.frames, options, &mut result)?;
        return Ok(result);
    }

    let batches: Vec<Vec<Frame>> = match options.frame_solve_mode {
        FrameSolveMode::AllFramesAtOnce => vec![request.frames.clone()],
        FrameSolveMode::PerFrame => request.frames.iter().map(|&frame| vec![frame]).collect(),
    };

    let mut outcomes = Vec::with_capacity(batches.len());
    for frames in batches {
        debug!("solving frames {:?}", frames);
        let outcome = solve_batch(scene, &objects, frames, &resolved, options, monitor)?;
        let interrupted = outcome.user_interrupted;
        outcomes.push(outcome);
        if interrupted {
            break;
        }
    }
    merge_outcomes(&mut result, outcomes);

    info!(
        "solve finished in {:?}: {} ({} iterations)",
        start.elapsed(),
        if result.success { "success" } else { "failure" },
        result.iterations
    );
    Ok(result)
}

fn validate_request(scene: &Scene, request: &SolveRequest) -> CamSolveResult<()> {
    if request.frames.is_empty() {
        return Err(CamSolveError::Configuration(
            "A solve needs at least one frame".to_string(),
        ));
    }
    if request.markers.is_empty() {
        return Err(CamSolveError::Configuration(
            "A solve needs at least one marker".to_string(),
        ));
    }
    if request.attributes.is_empty() {
        return Err(CamSolveError::Configuration(
            "A solve needs at least one attribute".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for &marker in &request.markers {
        let name = &scene.marker(marker)?.name;
        if !names.insert(name.as_str()) {
            return Err(CamSolveError::Configuration(format!(
                "Duplicate marker name: {name}"
            )));
        }
    }
    for attr in &request.attributes {
        attr.validate()?;
    }
    Ok(())
}

fn marker_names(
    scene: &Scene,
    request: &SolveRequest,
    indices: &[usize],
) -> CamSolveResult<Vec<String>> {
    indices
        .iter()
        .map(|&i| Ok(scene.marker(request.markers[i])?.name.clone()))
        .collect()
}

fn attribute_names(request: &SolveRequest, indices: &[usize]) -> Vec<String> {
    indices
        .iter()
        .map(|&i| request.attributes[i].long_name())
        .collect()
}

fn affects_table(
    scene: &Scene,
    request: &SolveRequest,
    affects: &MarkerAttrMatrix,
) -> CamSolveResult<Vec<MarkerAffects>> {
    request
        .markers
        .iter()
        .zip(affects)
        .map(|(&marker, row)| {
            Ok(MarkerAffects {
                marker: scene.marker(marker)?.name.clone(),
                attributes: row
                    .iter()
                    .zip(&request.attributes)
                    .filter(|(related, _)| **related)
                    .map(|(_, attr)| attr.long_name())
                    .collect(),
            })
        })
        .collect()
}

/// Apply the used/unused split and re-index the regularization terms.
fn select_solve_objects(
    request: &SolveRequest,
    split: &UsageSplit,
    affects: &MarkerAttrMatrix,
    options: &SolverOptions,
) -> SolveObjects {
    let marker_indices: Vec<usize> = if options.remove_unused_markers {
        split.used_markers.clone()
    } else {
        (0..request.markers.len()).collect()
    };
    let attr_indices: Vec<usize> = if options.remove_unused_attributes {
        split.used_attributes.clone()
    } else {
        (0..request.attributes.len()).collect()
    };

    let remap = |terms: &[RegularizationTerm], kind: &str| -> Vec<RegularizationTerm> {
        terms
            .iter()
            .filter_map(|term| {
                let position = attr_indices.iter().position(|&i| i == term.attribute);
                if position.is_none() {
                    warn!(
                        "Skipping {} term for attribute index {}, it is not part of the solve",
                        kind, term.attribute
                    );
                }
                position.map(|attribute| RegularizationTerm {
                    attribute,
                    ..*term
                })
            })
            .collect()
    };

    SolveObjects {
        markers: marker_indices.iter().map(|&i| request.markers[i]).collect(),
        attributes: attr_indices
            .iter()
            .map(|&i| request.attributes[i].clone())
            .collect(),
        stiffness: remap(&request.stiffness, "stiffness"),
        smoothness: remap(&request.smoothness, "smoothness"),
        marker_to_attr: select(affects, &marker_indices, &attr_indices),
    }
}

fn build_layout(
    scene: &Scene,
    objects: &SolveObjects,
    frames: Vec<Frame>,
    mode: TimeEvalMode,
) -> CamSolveResult<SolveLayout> {
    let layout = SolveLayout::build(
        scene,
        objects.markers.clone(),
        objects.attributes.clone(),
        frames,
        &objects.stiffness,
        &objects.smoothness,
        objects.marker_to_attr.clone(),
        mode,
    )?;
    if layout.num_params() > layout.num_errors() {
        return Err(CamSolveError::Configuration(format!(
            "Cannot solve {} parameters with only {} errors",
            layout.num_params(),
            layout.num_errors()
        )));
    }
    Ok(layout)
}

fn build_measurer(
    scene: &Scene,
    layout: &SolveLayout,
    options: &SolverOptions,
) -> CamSolveResult<ErrorMeasurer> {
    let evaluator = create_evaluator(
        options.scene_graph_mode,
        scene,
        &layout.markers,
        &layout.frames,
        options.time_eval_mode,
        options.force_trigger_eval,
    )?;
    Ok(ErrorMeasurer::new(
        evaluator,
        options.image_width,
        options.time_eval_mode,
        options.use_marker_position_cache,
    ))
}

fn print_stats(
    scene: &mut Scene,
    objects: &SolveObjects,
    frames: &[Frame],
    options: &SolverOptions,
    result: &mut SolveResult,
) -> CamSolveResult<()> {
    let stats = options.print_stats;
    result.success = true;
    result.reason = "Statistics only".to_string();

    if stats.used_solve_objects {
        info!(
            "used markers: {:?}, unused markers: {:?}",
            result.used_markers, result.unused_markers
        );
        info!(
            "used attributes: {:?}, unused attributes: {:?}",
            result.used_attributes, result.unused_attributes
        );
    }
    if stats.affects {
        for row in &result.affects {
            info!("marker {} affected by {:?}", row.marker, row.attributes);
        }
    }
    if !stats.inputs && !stats.deviation {
        return Ok(());
    }

    let mode = options.time_eval_mode;
    let layout = build_layout(scene, objects, frames.to_vec(), mode)?;
    set_counts(result, &layout);
    if stats.inputs {
        info!(
            "inputs: {} parameters, {} errors ({} marker, {} stiffness, {} smoothness)",
            result.num_parameters,
            result.num_errors,
            result.num_marker_errors,
            result.num_stiffness_errors,
            result.num_smoothness_errors
        );
    }
    if stats.deviation {
        let mut measurer = build_measurer(scene, &layout, options)?;
        let topology = LensTopology::build(
            scene,
            &layout.markers,
            &layout.attributes,
            &layout.frames,
            mode,
        )?;
        let mut measurement = Measurement::zeros(&layout);
        measurer.measure(scene, &topology, &layout, None, &mut measurement)?;
        info!("deviation: {}", measurement.stats);
        result.error_initial_avg = measurement.stats.avg;
        result.error_avg = measurement.stats.avg;
        result.error_min = measurement.stats.min;
        result.error_max = measurement.stats.max;
        result.marker_errors = marker_errors(scene, &layout, &measurement)?;
        result.frame_errors = frame_errors(&result.marker_errors);
        result.error_list = measurement.error_list;
    }
    Ok(())
}

fn set_counts(result: &mut SolveResult, layout: &SolveLayout) {
    result.num_parameters = layout.num_params();
    result.num_errors = layout.num_errors();
    result.num_marker_errors = layout.num_marker_errors();
    result.num_stiffness_errors = layout.stiffness.len();
    result.num_smoothness_errors = layout.smoothness.len();
}

fn marker_errors(
    scene: &Scene,
    layout: &SolveLayout,
    measurement: &Measurement,
) -> CamSolveResult<Vec<MarkerError>> {
    layout
        .marker_frames
        .iter()
        .zip(&measurement.distances)
        .map(|(entry, &distance)| {
            Ok(MarkerError {
                marker: scene.marker(layout.markers[entry.marker_index])?.name.clone(),
                frame: layout.frames[entry.frame_index],
                distance,
            })
        })
        .collect()
}

fn frame_errors(marker_errors: &[MarkerError]) -> Vec<FrameError> {
    let mut sums: BTreeMap<Frame, (f64, usize)> = BTreeMap::new();
    for error in marker_errors {
        let entry = sums.entry(error.frame).or_insert((0.0, 0));
        entry.0 += error.distance;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(frame, (sum, count))| FrameError {
            frame,
            error_avg: sum / count as f64,
        })
        .collect()
}

fn solve_batch(
    scene: &mut Scene,
    objects: &SolveObjects,
    frames: Vec<Frame>,
    resolved: &ResolvedOptions,
    options: &SolverOptions,
    monitor: &mut dyn SolveMonitor,
) -> CamSolveResult<BatchOutcome> {
    let mode = options.time_eval_mode;
    let layout = build_layout(scene, objects, frames, mode)?;
    let measurer = build_measurer(scene, &layout, options)?;
    let topology = LensTopology::build(
        scene,
        &layout.markers,
        &layout.attributes,
        &layout.frames,
        mode,
    )?;
    let mapping = ParameterMapping::new(resolved.bounded);
    let initial_params = read_parameters(scene, &layout, mapping, mode)?;

    let mut problem = ReprojectionProblem::new(
        scene,
        topology,
        &layout,
        measurer,
        mapping,
        resolved.robust_loss.as_ref(),
        resolved.jacobian_settings(),
        monitor,
        options.log_iterations,
    );

    let initial = problem.measure_at(&initial_params)?;
    info!("initial {}", initial.stats);

    let mut lm = LevenbergMarquardt::with_config(resolved.lm_config(options.linear_solver_type));
    let outcome = lm.minimize(&mut problem, initial_params.clone())?;
    debug!("{}", outcome.summary);

    let mut measurement = problem.measure_at(&outcome.parameters)?;
    let mut rejected = false;
    if options.accept_only_better && measurement.stats.avg > initial.stats.avg {
        warn!(
            "Solved error avg {:.6} is worse than initial {:.6}, restoring initial values",
            measurement.stats.avg, initial.stats.avg
        );
        measurement = problem.measure_at(&initial_params)?;
        rejected = true;
    }
    info!("final {}", measurement.stats);
    let iteration_log = problem.take_iteration_log();
    drop(problem);

    let status = outcome.status;
    Ok(BatchOutcome {
        user_interrupted: status == OptimizationStatus::UserTerminated,
        status: Some(status),
        iterations: outcome.summary.iterations,
        function_evals: outcome.summary.function_evaluations,
        jacobian_evals: outcome.summary.jacobian_evaluations,
        final_cost: outcome.summary.final_cost,
        rejected,
        initial_distances: initial.distances,
        marker_errors: marker_errors(scene, &layout, &measurement)?,
        error_list: measurement.error_list,
        num_parameters: layout.num_params(),
        num_marker_errors: layout.num_marker_errors(),
        num_stiffness_errors: layout.stiffness.len(),
        num_smoothness_errors: layout.smoothness.len(),
        iteration_log,
    })
}

fn merge_outcomes(result: &mut SolveResult, outcomes: Vec<BatchOutcome>) {
    let mut initial_distances = Vec::new();
    result.success = !outcomes.is_empty();
    for outcome in outcomes {
        let batch_success = outcome.status.as_ref().is_some_and(OptimizationStatus::is_success)
            && !outcome.rejected;
        // Report the first failing batch, or the last one.
        if result.success {
            result.status = outcome.status.clone();
        }
        result.success &= batch_success;
        result.iterations += outcome.iterations;
        result.function_evals += outcome.function_evals;
        result.jacobian_evals += outcome.jacobian_evals;
        result.error_final += outcome.final_cost;
        result.user_interrupted |= outcome.user_interrupted;
        result.rejected |= outcome.rejected;
        result.num_parameters += outcome.num_parameters;
        result.num_marker_errors += outcome.num_marker_errors;
        result.num_stiffness_errors += outcome.num_stiffness_errors;
        result.num_smoothness_errors += outcome.num_smoothness_errors;
        initial_distances.extend(outcome.initial_distances);
        result.marker_errors.extend(outcome.marker_errors);
        result.error_list.extend(outcome.error_list);
        result.iteration_log.extend(outcome.iteration_log);
    }
    result.num_errors =
        result.num_marker_errors + result.num_stiffness_errors + result.num_smoothness_errors;

    let initial = ErrorStats::from_distances(initial_distances);
    let final_stats = ErrorStats::from_distances(result.marker_errors.iter().map(|e| e.distance));
    result.error_initial_avg = initial.avg;
    result.error_avg = final_stats.avg;
    result.error_min = final_stats.min;
    result.error_max = final_stats.max;
    result.frame_errors = frame_errors(&result.marker_errors);

    result.reason = if result.rejected {
        "Solved values were worse than the initial values and were rejected".to_string()
    } else {
        result
            .status
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    };
}
