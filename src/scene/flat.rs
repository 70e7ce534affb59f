//! Flattened scene evaluation.
//!
//! The camera/bundle/marker relationships of the solve are compiled once into
//! index tables. A full pass evaluates every camera once per frame and writes
//! every (marker, frame) sample into flat arrays laid out as
//! `marker * num_frames * 2 + frame * 2`. Partial passes rewrite only the
//! requested samples and evaluate only the cameras those samples see.

use nalgebra::Vector2;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, error, trace};

use crate::attribute::{Frame, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::layout::MarkerFrame;

use super::{
    BundleId, CameraId, CameraState, MarkerId, Projection, Scene, SceneEvaluator, SceneGraphMode,
};

#[derive(Debug, Clone, Copy)]
struct FlatMarker {
    marker: MarkerId,
    bundle: BundleId,
    /// Index into `FlatSceneEvaluator::cameras`.
    camera_index: usize,
}

#[derive(Debug, Clone)]
pub struct FlatSceneEvaluator {
    frames: Vec<Frame>,
    time_eval_mode: TimeEvalMode,
    cameras: Vec<CameraId>,
    markers: Vec<FlatMarker>,
    points: Vec<f64>,
    marker_positions: Vec<f64>,
    behind_camera: Vec<bool>,
    /// Set once a full pass has filled the arrays.
    evaluated: bool,
}

impl FlatSceneEvaluator {
    pub fn new(
        scene: &Scene,
        markers: &[MarkerId],
        frames: &[Frame],
        time_eval_mode: TimeEvalMode,
    ) -> CamSolveResult<Self> {
        let mut cameras = Vec::new();
        let mut camera_lookup: HashMap<CameraId, usize> = HashMap::new();
        let mut flat_markers = Vec::with_capacity(markers.len());
        for &marker in markers {
            let node = scene.marker(marker)?;
            let camera_index = *camera_lookup.entry(node.camera).or_insert_with(|| {
                cameras.push(node.camera);
                cameras.len() - 1
            });
            flat_markers.push(FlatMarker {
                marker,
                bundle: node.bundle,
                camera_index,
            });
        }
        debug!(
            "flat scene: {} markers, {} cameras, {} frames",
            flat_markers.len(),
            cameras.len(),
            frames.len()
        );
        Ok(Self {
            frames: frames.to_vec(),
            time_eval_mode,
            cameras,
            markers: flat_markers,
            points: Vec::new(),
            marker_positions: Vec::new(),
            behind_camera: Vec::new(),
            evaluated: false,
        })
    }

    fn sample_index(&self, marker_index: usize, frame_index: usize) -> CamSolveResult<usize> {
        let num_frames = self.frames.len();
        if marker_index >= self.markers.len() || frame_index >= num_frames {
            return Err(CamSolveError::SceneEvaluation(format!(
                "Marker/frame index ({marker_index}, {frame_index}) out of range"
            )));
        }
        let index = marker_index * num_frames * 2 + frame_index * 2;
        if index + 1 >= self.points.len() {
            return Err(CamSolveError::SceneEvaluation(
                "Flat scene queried before evaluation".to_string(),
            ));
        }
        Ok(index)
    }

    fn evaluate_all(&mut self, scene: &Scene) -> CamSolveResult<()> {
        let num_frames = self.frames.len();

        let mut camera_states: Vec<CameraState> = Vec::with_capacity(self.cameras.len() * num_frames);
        for &camera in &self.cameras {
            for &frame in &self.frames {
                camera_states.push(scene.camera_state(camera, frame, self.time_eval_mode)?);
            }
        }

        let num_samples = self.markers.len() * num_frames;
        let mut points = Vec::with_capacity(num_samples * 2);
        let mut marker_positions = Vec::with_capacity(num_samples * 2);
        let mut behind_camera = Vec::with_capacity(num_samples);
        for flat in &self.markers {
            for (frame_index, &frame) in self.frames.iter().enumerate() {
                let state = &camera_states[flat.camera_index * num_frames + frame_index];
                let bundle = scene.bundle_position(flat.bundle, frame, self.time_eval_mode)?;
                let projection = state.project(&bundle);
                points.push(projection.point.x);
                points.push(projection.point.y);
                behind_camera.push(projection.behind_camera);

                let observed = scene.marker_position(flat.marker, frame, self.time_eval_mode)?;
                marker_positions.push(observed.x);
                marker_positions.push(observed.y * state.marker_aspect_correction());
            }
        }

        if points.len() != marker_positions.len() || points.len() != behind_camera.len() * 2 {
            error!(
                "flat scene arrays are misaligned: {} points, {} markers",
                points.len(),
                marker_positions.len()
            );
            return Err(CamSolveError::SceneEvaluation(format!(
                "Flat scene produced {} point values for {} marker values",
                points.len(),
                marker_positions.len()
            )));
        }

        self.points = points;
        self.marker_positions = marker_positions;
        self.behind_camera = behind_camera;
        self.evaluated = true;
        Ok(())
    }

    /// Refresh the listed samples in place.
    fn evaluate_samples(&mut self, scene: &Scene, samples: &[MarkerFrame]) -> CamSolveResult<()> {
        let mode = self.time_eval_mode;
        let mut camera_states: HashMap<(usize, usize), CameraState> = HashMap::new();
        for sample in samples {
            let index = self.sample_index(sample.marker_index, sample.frame_index)?;
            let flat = self.markers[sample.marker_index];
            let frame = self.frames[sample.frame_index];
            let state = match camera_states.entry((flat.camera_index, sample.frame_index)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(scene.camera_state(self.cameras[flat.camera_index], frame, mode)?)
                }
            };
            let bundle = scene.bundle_position(flat.bundle, frame, mode)?;
            let projection = state.project(&bundle);
            self.points[index] = projection.point.x;
            self.points[index + 1] = projection.point.y;
            self.behind_camera[index / 2] = projection.behind_camera;

            let observed = scene.marker_position(flat.marker, frame, mode)?;
            self.marker_positions[index] = observed.x;
            self.marker_positions[index + 1] = observed.y * state.marker_aspect_correction();
        }
        trace!(
            "flat scene: refreshed {} samples with {} camera evaluations",
            samples.len(),
            camera_states.len()
        );
        Ok(())
    }
}

impl SceneEvaluator for FlatSceneEvaluator {
    fn mode(&self) -> SceneGraphMode {
        SceneGraphMode::Flat
    }

    fn evaluate(&mut self, scene: &Scene, samples: Option<&[MarkerFrame]>) -> CamSolveResult<()> {
        match samples {
            Some(samples) if self.evaluated => self.evaluate_samples(scene, samples),
            _ => self.evaluate_all(scene),
        }
    }

    fn marker_position(
        &self,
        _scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Vector2<f64>> {
        let index = self.sample_index(marker_index, frame_index)?;
        Ok(Vector2::new(
            self.marker_positions[index],
            self.marker_positions[index + 1],
        ))
    }

    fn project(
        &self,
        _scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Projection> {
        let index = self.sample_index(marker_index, frame_index)?;
        Ok(Projection {
            point: Vector2::new(self.points[index], self.points[index + 1]),
            behind_camera: self.behind_camera[index / 2],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::CameraDesc;
    use nalgebra::Vector3;

    const MODE: TimeEvalMode = TimeEvalMode::DgContext;

    fn two_marker_scene() -> (Scene, Vec<MarkerId>) {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let mut markers = Vec::new();
        for (i, x) in [-0.5, 0.5].into_iter().enumerate() {
            let bnd = scene.add_bundle(&format!("b{i}"), Vector3::new(x, 0.2, -10.0)).unwrap();
            let mkr = scene.add_marker(&format!("m{i}"), cam, bnd).unwrap();
            for frame in [1, 2] {
                scene.set_marker_position(mkr, frame, 0.01, -0.01).unwrap();
            }
            markers.push(mkr);
        }
        (scene, markers)
    }

    #[test]
    fn test_partial_pass_refreshes_only_requested_samples() {
        let (mut scene, markers) = two_marker_scene();
        let frames = [1, 2];
        let mut flat = FlatSceneEvaluator::new(&scene, &markers, &frames, MODE).unwrap();
        flat.evaluate(&scene, None).unwrap();
        let stale_other = flat.project(&scene, 1, 0).unwrap().point;
        let stale_frame = flat.project(&scene, 0, 1).unwrap().point;

        for name in ["b0", "b1"] {
            let tx = scene.attribute(name, "translateX").unwrap();
            tx.set_value(&mut scene, None, 2.0).unwrap();
        }
        let sample = MarkerFrame {
            marker_index: 0,
            frame_index: 0,
        };
        flat.evaluate(&scene, Some(&[sample])).unwrap();

        let mut fresh = FlatSceneEvaluator::new(&scene, &markers, &frames, MODE).unwrap();
        fresh.evaluate(&scene, None).unwrap();
        let refreshed = flat.project(&scene, 0, 0).unwrap().point;
        assert!((refreshed - fresh.project(&scene, 0, 0).unwrap().point).norm() < 1e-15);
        assert!((refreshed - stale_frame).norm() > 1e-3);
        assert_eq!(flat.project(&scene, 1, 0).unwrap().point, stale_other);
        assert_eq!(flat.project(&scene, 0, 1).unwrap().point, stale_frame);
        assert_eq!(
            flat.marker_position(&scene, 0, 0).unwrap(),
            fresh.marker_position(&scene, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_partial_pass_before_full_pass_evaluates_everything() {
        let (scene, markers) = two_marker_scene();
        let mut flat = FlatSceneEvaluator::new(&scene, &markers, &[1, 2], MODE).unwrap();
        let sample = MarkerFrame {
            marker_index: 1,
            frame_index: 1,
        };
        flat.evaluate(&scene, Some(&[sample])).unwrap();
        assert!(flat.project(&scene, 0, 0).is_ok());
        assert!(flat.project(&scene, 1, 1).is_ok());
    }
}
