//! Direct per-node scene queries.

use nalgebra::Vector2;
use tracing::trace;

use crate::attribute::{Frame, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::layout::MarkerFrame;

use super::{MarkerId, Projection, Scene, SceneEvaluator, SceneGraphMode};

/// Evaluates every (marker, frame) query on demand.
#[derive(Debug, Clone)]
pub struct DagEvaluator {
    markers: Vec<MarkerId>,
    frames: Vec<Frame>,
    time_eval_mode: TimeEvalMode,
    force_trigger_eval: bool,
}

impl DagEvaluator {
    pub fn new(
        scene: &Scene,
        markers: &[MarkerId],
        frames: &[Frame],
        time_eval_mode: TimeEvalMode,
        force_trigger_eval: bool,
    ) -> CamSolveResult<Self> {
        for marker in markers {
            scene.marker(*marker)?;
        }
        Ok(Self {
            markers: markers.to_vec(),
            frames: frames.to_vec(),
            time_eval_mode,
            force_trigger_eval,
        })
    }

    fn lookup(&self, marker_index: usize, frame_index: usize) -> CamSolveResult<(MarkerId, Frame)> {
        let marker = self.markers.get(marker_index).copied();
        let frame = self.frames.get(frame_index).copied();
        match (marker, frame) {
            (Some(marker), Some(frame)) => Ok((marker, frame)),
            _ => Err(CamSolveError::SceneEvaluation(format!(
                "Marker/frame index ({marker_index}, {frame_index}) out of range"
            ))),
        }
    }
}

impl SceneEvaluator for DagEvaluator {
    fn mode(&self) -> SceneGraphMode {
        SceneGraphMode::Dag
    }

    fn evaluate(&mut self, scene: &Scene, _samples: Option<&[MarkerFrame]>) -> CamSolveResult<()> {
        // Prime time-dependent values by pulling one camera before the pass.
        if self.force_trigger_eval
            && let (Some(marker), Some(frame)) = (self.markers.first(), self.frames.first())
        {
            let camera = scene.marker(*marker)?.camera;
            scene.camera_sample(camera, *frame, self.time_eval_mode)?;
            trace!("forced scene evaluation at frame {}", frame);
        }
        Ok(())
    }

    fn marker_position(
        &self,
        scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Vector2<f64>> {
        let (marker, frame) = self.lookup(marker_index, frame_index)?;
        let camera = scene.marker(marker)?.camera;
        let state = scene.camera_state(camera, frame, self.time_eval_mode)?;
        let mut position = scene.marker_position(marker, frame, self.time_eval_mode)?;
        position.y *= state.marker_aspect_correction();
        Ok(position)
    }

    fn project(
        &self,
        scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Projection> {
        let (marker, frame) = self.lookup(marker_index, frame_index)?;
        let marker = scene.marker(marker)?;
        let state = scene.camera_state(marker.camera, frame, self.time_eval_mode)?;
        let bundle = scene.bundle_position(marker.bundle, frame, self.time_eval_mode)?;
        Ok(state.project(&bundle))
    }
}
