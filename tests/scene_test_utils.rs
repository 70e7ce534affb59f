//! Shared utilities for camsolve integration tests
//!
//! Builds deterministic synthetic scenes: a camera at the origin looking down
//! -Z, bundles spread in front of it, and markers keyed at the noiseless
//! projection of their bundle (optionally through a lens model).

#![allow(dead_code)]

use camsolve::lens::LensModel;
use camsolve::scene::{BundleId, CameraDesc, CameraId, MarkerId};
use camsolve::{CamSolveResult, Frame, Scene, TimeEvalMode};
use nalgebra::{Vector2, Vector3};

pub const MODE: TimeEvalMode = TimeEvalMode::DgContext;

/// A scene with one camera and one marker per bundle.
pub struct SyntheticScene {
    pub scene: Scene,
    pub camera: CameraId,
    pub bundles: Vec<BundleId>,
    pub markers: Vec<MarkerId>,
    pub frames: Vec<Frame>,
}

/// Generate N bundle positions 6-12 units in front of a camera at the origin.
///
/// Positions are deterministic and spread over roughly +/- 2 units in X/Y.
pub fn generate_bundle_points(n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|i| {
            let angle = i as f64 * 2.4;
            let radius = 0.5 + 1.5 * ((i as f64 * 0.37) % 1.0);
            let depth = 6.0 + 6.0 * ((i as f64 * 0.61) % 1.0);
            Vector3::new(radius * angle.cos(), radius * angle.sin(), -depth)
        })
        .collect()
}

/// Deterministic pseudo-noise in [-amount, amount].
pub fn noise(index: usize, amount: f64) -> f64 {
    let u = ((index * 7919 + 104_729) % 10_000) as f64 / 10_000.0;
    (2.0 * u - 1.0) * amount
}

/// Marker position a noiseless observation of `bundle` would have.
pub fn projected_marker_position(
    scene: &Scene,
    camera: CameraId,
    bundle: BundleId,
    frame: Frame,
) -> CamSolveResult<Vector2<f64>> {
    let state = scene.camera_state(camera, frame, MODE)?;
    let point = scene.bundle_position(bundle, frame, MODE)?;
    let projected = state.project(&point).point;
    Ok(Vector2::new(
        projected.x,
        projected.y / state.marker_aspect_correction(),
    ))
}

/// Key `marker` at the projection of `bundle`, distorted by `lens` if given.
pub fn observe(
    scene: &mut Scene,
    marker: MarkerId,
    camera: CameraId,
    bundle: BundleId,
    frame: Frame,
    lens: Option<&LensModel>,
) -> CamSolveResult<()> {
    let state = scene.camera_state(camera, frame, MODE)?;
    let point = scene.bundle_position(bundle, frame, MODE)?;
    let projected = state.project(&point).point;
    let (x, y) = match lens {
        Some(model) => model.distort_point(projected.x, projected.y),
        None => (projected.x, projected.y),
    };
    scene.set_marker_position(marker, frame, x, y / state.marker_aspect_correction())
}

/// One static camera, `num_bundles` bundles and perfect observations on `frames`.
pub fn build_static_scene(num_bundles: usize, frames: &[Frame]) -> CamSolveResult<SyntheticScene> {
    build_scene_with_camera(num_bundles, frames, CameraDesc::default(), None)
}

pub fn build_scene_with_camera(
    num_bundles: usize,
    frames: &[Frame],
    desc: CameraDesc,
    lens: Option<&LensModel>,
) -> CamSolveResult<SyntheticScene> {
    let mut scene = Scene::new();
    let camera = scene.add_camera("camera1", desc)?;
    let mut bundles = Vec::with_capacity(num_bundles);
    let mut markers = Vec::with_capacity(num_bundles);
    for (i, point) in generate_bundle_points(num_bundles).into_iter().enumerate() {
        let bundle = scene.add_bundle(&format!("bundle{i}"), point)?;
        let marker = scene.add_marker(&format!("marker{i}"), camera, bundle)?;
        for &frame in frames {
            observe(&mut scene, marker, camera, bundle, frame, lens)?;
        }
        bundles.push(bundle);
        markers.push(marker);
    }
    Ok(SyntheticScene {
        scene,
        camera,
        bundles,
        markers,
        frames: frames.to_vec(),
    })
}

/// The single-marker scene: bundle (0.3, 0.2, -10) observed at the
/// projection of (0.3 + dx, 0.2 + dy, -10) on frame 1.
pub fn build_offset_marker_scene(dx: f64, dy: f64) -> CamSolveResult<SyntheticScene> {
    let mut scene = Scene::new();
    let camera = scene.add_camera("camera1", CameraDesc::default())?;
    let target = scene.add_bundle("target", Vector3::new(0.3 + dx, 0.2 + dy, -10.0))?;
    let bundle = scene.add_bundle("bundle1", Vector3::new(0.3, 0.2, -10.0))?;
    let marker = scene.add_marker("marker1", camera, bundle)?;
    let position = projected_marker_position(&scene, camera, target, 1)?;
    scene.set_marker_position(marker, 1, position.x, position.y)?;
    Ok(SyntheticScene {
        scene,
        camera,
        bundles: vec![bundle],
        markers: vec![marker],
        frames: vec![1],
    })
}
