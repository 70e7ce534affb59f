//! End-to-end solve tests on synthetic scenes
//!
//! Each test builds a scene with known ground truth, perturbs the solve
//! attributes and checks that `camsolve::solve` recovers the truth (or
//! reports the expected status) for every backend and solve mode.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use camsolve::layout::RegularizationTerm;
use camsolve::linalg::LinearSolverType;
use camsolve::scene::CameraDesc;
use camsolve::solve::IterationRecord;
use camsolve::{
    AttributeStore, AutoDiffType, CamSolveError, CancellationFlag, FrameSolveMode,
    OptimizationStatus, PrintStats, RobustLossType, SceneGraphMode, SolveMonitor, SolveRequest,
    SolverOptions, SolverType, solve,
};
use tracing::info;

mod scene_test_utils;
use scene_test_utils::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Stops the solve after the first completed iteration.
#[derive(Default)]
struct StopAfterFirstIteration {
    interrupted: bool,
    records: Vec<IterationRecord>,
}

impl SolveMonitor for StopAfterFirstIteration {
    fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    fn on_iteration(&mut self, record: &IterationRecord) {
        self.records.push(*record);
        self.interrupted = true;
    }
}

// ============================================================================
// 1. Single marker, every backend
// ============================================================================

#[test]
fn test_offset_marker_solved_by_every_backend() -> TestResult {
    for solver_type in SolverType::ALL {
        for mode in [SceneGraphMode::Dag, SceneGraphMode::Flat] {
            let mut synthetic = build_offset_marker_scene(0.2, -0.1)?;
            let scene = &mut synthetic.scene;
            let tx = scene.attribute("bundle1", "translateX")?;
            let ty = scene.attribute("bundle1", "translateY")?;
            let request =
                SolveRequest::new(synthetic.markers.clone(), vec![tx.clone(), ty.clone()], vec![1]);
            let options = SolverOptions::new()
                .with_solver_type(solver_type)
                .with_scene_graph_mode(mode);

            let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
            info!("{solver_type} / {mode}:\n{result}");

            assert!(result.success, "{solver_type} / {mode}: {}", result.reason);
            assert!(!result.rejected);
            assert!(result.error_initial_avg > 10.0);
            assert!(result.error_avg < 1e-4, "{solver_type}: {}", result.error_avg);
            assert_eq!(result.num_parameters, 2);
            assert_eq!(result.num_errors, 2);
            assert!((tx.value(&*scene, 1, MODE)? - 0.5).abs() < 1e-5);
            assert!((ty.value(&*scene, 1, MODE)? - 0.1).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn test_central_differences_and_dense_qr() -> TestResult {
    let mut synthetic = build_offset_marker_scene(-0.15, 0.25)?;
    let scene = &mut synthetic.scene;
    let attrs = vec![
        scene.attribute("bundle1", "translateX")?,
        scene.attribute("bundle1", "translateY")?,
    ];
    let request = SolveRequest::new(synthetic.markers.clone(), attrs, vec![1]);
    let options = SolverOptions::new()
        .with_solver_type(SolverType::Levmar)
        .with_auto_diff_type(AutoDiffType::Central)
        .with_linear_solver(LinearSolverType::SparseQR)
        .with_log_iterations(true);

    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
    assert!(result.success);
    assert!(result.error_avg < 1e-3);
    assert_eq!(result.iteration_log.len(), result.iterations);
    let first = result.iteration_log.first().expect("at least one iteration");
    assert_eq!(first.iteration, 1);
    Ok(())
}

// ============================================================================
// 2. Accept-only-better
// ============================================================================

#[test]
fn test_worse_solution_is_rejected_and_restored() -> TestResult {
    // The marker sits exactly on its projection, so any move away is worse.
    let mut synthetic = build_offset_marker_scene(0.0, 0.0)?;
    let scene = &mut synthetic.scene;
    let tx = scene.attribute("bundle1", "translateX")?;
    let initial_x = tx.value(&*scene, 1, MODE)?;

    // A stiffness term pulling translateX half a unit away.
    let weight = scene.add_value("stiffness1", "weight", 1.0)?;
    let variance = scene.add_value("stiffness1", "variance", 0.1)?;
    let target = scene.add_value("stiffness1", "target", initial_x + 0.5)?;
    let request = SolveRequest::new(synthetic.markers.clone(), vec![tx.clone()], vec![1])
        .with_stiffness(RegularizationTerm {
            attribute: 0,
            weight,
            variance,
            target,
        });

    let options = SolverOptions::new().with_solver_type(SolverType::Levmar);
    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
    assert!(result.rejected);
    assert!(!result.success);
    assert_eq!(result.num_stiffness_errors, 1);
    assert!(result.error_avg < 1e-9);
    assert!((tx.value(&*scene, 1, MODE)? - initial_x).abs() < 1e-12);

    // Without the check the regularized solution is kept.
    let options = options.with_accept_only_better(false);
    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
    assert!(!result.rejected);
    assert!(result.success);
    assert!(result.error_avg > 1.0);
    assert!(tx.value(&*scene, 1, MODE)? > initial_x + 0.1);
    Ok(())
}

// ============================================================================
// 3. Per-frame solving of an animated camera
// ============================================================================

#[test]
fn test_per_frame_solve_recovers_animated_camera() -> TestResult {
    let frames = [1, 2, 3];
    let truth = [(0.0, 0.0), (0.2, -0.1), (0.35, 0.05)];
    let mut synthetic = build_static_scene(6, &[])?;
    let scene = &mut synthetic.scene;
    let tx = scene.attribute("camera1", "translateX")?;
    let ty = scene.attribute("camera1", "translateY")?;

    // 1. Ground truth keys and observations
    for (&frame, &(x, y)) in frames.iter().zip(&truth) {
        scene.set_key(tx.plug, frame, x)?;
        scene.set_key(ty.plug, frame, y)?;
    }
    for (&marker, &bundle) in synthetic.markers.iter().zip(&synthetic.bundles) {
        for &frame in &frames {
            observe(scene, marker, synthetic.camera, bundle, frame, None)?;
        }
    }

    // 2. Perturb the camera keys
    for (i, &frame) in frames.iter().enumerate() {
        scene.set_key(tx.plug, frame, truth[i].0 + 0.1 + noise(i, 0.05))?;
        scene.set_key(ty.plug, frame, truth[i].1 - 0.1 + noise(i + 7, 0.05))?;
    }

    // 3. Solve one frame at a time
    let request = SolveRequest::new(
        synthetic.markers.clone(),
        vec![tx.clone(), ty.clone()],
        frames.to_vec(),
    );
    let options = SolverOptions::new().with_frame_solve_mode(FrameSolveMode::PerFrame);
    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;

    // 4. Verify
    assert!(result.success, "{}", result.reason);
    assert_eq!(result.num_parameters, 6);
    assert_eq!(result.num_marker_errors, 36);
    assert_eq!(result.frame_errors.len(), 3);
    assert_eq!(result.marker_errors.len(), 18);
    assert!(result.error_avg < 1e-3);
    for (&frame, &(x, y)) in frames.iter().zip(&truth) {
        assert!((scene.value(tx.plug, frame, MODE)? - x).abs() < 1e-5);
        assert!((scene.value(ty.plug, frame, MODE)? - y).abs() < 1e-5);
    }
    Ok(())
}

// ============================================================================
// 4. Cancellation
// ============================================================================

#[test]
fn test_monitor_interrupts_after_first_iteration() -> TestResult {
    let mut synthetic = build_offset_marker_scene(0.4, 0.3)?;
    let scene = &mut synthetic.scene;
    let attrs = vec![
        scene.attribute("bundle1", "translateX")?,
        scene.attribute("bundle1", "translateY")?,
    ];
    let request = SolveRequest::new(synthetic.markers.clone(), attrs, vec![1]);
    let options = SolverOptions::new()
        .with_solver_type(SolverType::Levmar)
        .with_accept_only_better(false);

    let mut monitor = StopAfterFirstIteration::default();
    let result = solve(scene, &request, &options, &mut monitor)?;
    assert!(result.user_interrupted);
    assert!(result.success);
    assert_eq!(result.status, Some(OptimizationStatus::UserTerminated));
    assert_eq!(result.iterations, 1);
    assert_eq!(monitor.records.len(), 1);
    assert!(result.error_avg <= result.error_initial_avg);
    Ok(())
}

#[test]
fn test_cancelled_flag_stops_before_first_iteration() -> TestResult {
    let mut synthetic = build_offset_marker_scene(0.4, 0.3)?;
    let scene = &mut synthetic.scene;
    let tx = scene.attribute("bundle1", "translateX")?;
    let request = SolveRequest::new(synthetic.markers.clone(), vec![tx.clone()], vec![1]);

    let flag = CancellationFlag::new();
    flag.cancel();
    let mut monitor = flag.clone();
    let result = solve(scene, &request, &SolverOptions::new(), &mut monitor)?;
    assert!(result.user_interrupted);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.status, Some(OptimizationStatus::UserTerminated));
    assert!((tx.value(&*scene, 1, MODE)? - 0.3).abs() < 1e-12);
    assert!((result.error_avg - result.error_initial_avg).abs() < 1e-12);

    flag.reset();
    let result = solve(scene, &request, &SolverOptions::new(), &mut monitor)?;
    assert!(!result.user_interrupted);
    Ok(())
}

// ============================================================================
// 5. Robust loss
// ============================================================================

fn solve_camera_with_outlier(loss: RobustLossType) -> Result<f64, Box<dyn std::error::Error>> {
    let mut synthetic = build_static_scene(8, &[1])?;
    let scene = &mut synthetic.scene;

    // One observation 0.05 film-back units (about 100 pixels) off.
    let outlier = synthetic.markers[3];
    let position = scene.marker_position(outlier, 1, MODE)?;
    scene.set_marker_position(outlier, 1, position.x + 0.05, position.y)?;

    let tx = scene.attribute("camera1", "translateX")?;
    let ty = scene.attribute("camera1", "translateY")?;
    tx.set_value(scene, None, 0.1)?;
    ty.set_value(scene, None, -0.05)?;

    let request = SolveRequest::new(
        synthetic.markers.clone(),
        vec![tx.clone(), ty.clone()],
        vec![1],
    );
    let options = SolverOptions::new()
        .with_solver_type(SolverType::Levmar)
        .with_robust_loss(loss, 5.0)
        .with_accept_only_better(false);
    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
    assert!(result.success, "{loss}: {}", result.reason);

    let x = tx.value(&*scene, 1, MODE)?;
    let y = ty.value(&*scene, 1, MODE)?;
    Ok(x.hypot(y))
}

#[test]
fn test_cauchy_loss_resists_outlier() -> TestResult {
    let trivial = solve_camera_with_outlier(RobustLossType::Trivial)?;
    let cauchy = solve_camera_with_outlier(RobustLossType::Cauchy)?;
    info!("camera error: trivial {trivial:.6}, cauchy {cauchy:.6}");
    assert!(trivial > 1e-3);
    assert!(cauchy < trivial * 0.5);
    Ok(())
}

// ============================================================================
// 6. Statistics-only requests
// ============================================================================

#[test]
fn test_print_stats_does_not_solve() -> TestResult {
    let mut synthetic = build_offset_marker_scene(0.2, 0.2)?;
    let scene = &mut synthetic.scene;
    let tx = scene.attribute("bundle1", "translateX")?;
    let ty = scene.attribute("bundle1", "translateY")?;
    let request = SolveRequest::new(synthetic.markers.clone(), vec![tx.clone(), ty], vec![1]);
    let options = SolverOptions::new().with_print_stats(PrintStats {
        inputs: true,
        affects: true,
        deviation: true,
        ..Default::default()
    });

    let result = solve(scene, &request, &options, &mut CancellationFlag::new())?;
    assert!(result.success);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.num_parameters, 2);
    assert_eq!(result.num_errors, 2);
    assert!(result.error_avg > 10.0);
    assert_eq!(result.marker_errors.len(), 1);
    assert_eq!(result.affects.len(), 1);
    assert_eq!(
        result.affects[0].attributes,
        vec!["bundle1.translateX".to_string(), "bundle1.translateY".to_string()]
    );
    assert_eq!(tx.value(&*scene, 1, MODE)?, 0.3);
    Ok(())
}

// ============================================================================
// 7. Used / unused solve objects and request validation
// ============================================================================

#[test]
fn test_unused_marker_is_reported_and_removed() -> TestResult {
    let mut synthetic = build_static_scene(3, &[1])?;
    let scene = &mut synthetic.scene;
    let tx = scene.attribute("bundle0", "translateX")?;
    let ty = scene.attribute("bundle0", "translateY")?;
    let request = SolveRequest::new(synthetic.markers.clone(), vec![tx, ty], vec![1]);

    let result = solve(scene, &request, &SolverOptions::new(), &mut CancellationFlag::new())?;
    assert!(result.success);
    assert_eq!(result.used_markers, vec!["marker0".to_string()]);
    assert_eq!(
        result.unused_markers,
        vec!["marker1".to_string(), "marker2".to_string()]
    );
    assert_eq!(result.num_marker_errors, 2);
    Ok(())
}

#[test]
fn test_invalid_requests_are_configuration_errors() -> TestResult {
    let mut synthetic = build_static_scene(1, &[1])?;
    let scene = &mut synthetic.scene;
    let marker = synthetic.markers[0];
    let tx = scene.attribute("bundle0", "translateX")?;
    let options = SolverOptions::new();
    let mut flag = CancellationFlag::new();

    let no_frames = SolveRequest::new(vec![marker], vec![tx.clone()], vec![]);
    let duplicate = SolveRequest::new(vec![marker, marker], vec![tx.clone()], vec![1]);
    let free = scene.add_value("settings", "gain", 1.0)?;
    let unrelated = SolveRequest::new(
        vec![marker],
        vec![scene.attribute("settings", "gain")?],
        vec![1],
    );
    let too_many = SolveRequest::new(
        vec![marker],
        vec![
            tx.clone(),
            scene.attribute("bundle0", "translateY")?,
            scene.attribute("bundle0", "translateZ")?,
        ],
        vec![1],
    );
    assert!(scene.plug_owner(free).is_some());

    for request in [no_frames, duplicate, unrelated, too_many] {
        let result = solve(scene, &request, &options, &mut flag);
        assert!(
            matches!(result, Err(CamSolveError::Configuration(_))),
            "{result:?}"
        );
    }
    Ok(())
}

#[test]
fn test_result_serializes_to_json() -> TestResult {
    let mut synthetic = build_scene_with_camera(2, &[1], CameraDesc::default(), None)?;
    let scene = &mut synthetic.scene;
    let tz = scene.attribute("bundle1", "translateZ")?;
    tz.set_value(scene, None, -9.0)?;
    let request = SolveRequest::new(synthetic.markers.clone(), vec![tz], vec![1]);
    let result = solve(scene, &request, &SolverOptions::new(), &mut CancellationFlag::new())?;

    let json = serde_json::to_value(&result)?;
    assert_eq!(json["success"], serde_json::json!(result.success));
    assert!(json["marker_errors"].is_array());
    Ok(())
}
