//! Scene evaluation strategies used by the error measurement engine.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::attribute::{Frame, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::layout::MarkerFrame;

use super::{DagEvaluator, FlatSceneEvaluator, MarkerId, Projection, Scene};

/// Which evaluation strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneGraphMode {
    /// Query cameras, bundles and markers node by node.
    #[default]
    Dag,
    /// Evaluate every marker and frame into flat arrays once per pass.
    Flat,
}

impl fmt::Display for SceneGraphMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneGraphMode::Dag => write!(f, "dag"),
            SceneGraphMode::Flat => write!(f, "flat"),
        }
    }
}

impl FromStr for SceneGraphMode {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dag" | "maya_dag" => Ok(SceneGraphMode::Dag),
            "flat" | "flattened" | "mm_scene_graph" => Ok(SceneGraphMode::Flat),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown scene graph mode: {other}"
            ))),
        }
    }
}

/// Resolves markers to observed and projected positions.
///
/// Marker and frame arguments are indices into the marker and frame lists the
/// evaluator was created with. Positions are film-back unit coordinates with
/// the observed y already corrected for render / film back aspect.
pub trait SceneEvaluator {
    fn mode(&self) -> SceneGraphMode;

    /// Prepare one measurement pass. Called before any query of the pass.
    ///
    /// With `samples`, only those (marker, frame) pairs are queried in the
    /// pass and only they need to reflect the current scene.
    fn evaluate(&mut self, scene: &Scene, samples: Option<&[MarkerFrame]>) -> CamSolveResult<()>;

    fn marker_position(
        &self,
        scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Vector2<f64>>;

    fn project(
        &self,
        scene: &Scene,
        marker_index: usize,
        frame_index: usize,
    ) -> CamSolveResult<Projection>;
}

/// Build the evaluator selected by `mode`.
pub fn create_evaluator(
    mode: SceneGraphMode,
    scene: &Scene,
    markers: &[MarkerId],
    frames: &[Frame],
    time_eval_mode: TimeEvalMode,
    force_trigger_eval: bool,
) -> CamSolveResult<Box<dyn SceneEvaluator>> {
    Ok(match mode {
        SceneGraphMode::Dag => Box::new(DagEvaluator::new(
            scene,
            markers,
            frames,
            time_eval_mode,
            force_trigger_eval,
        )?),
        SceneGraphMode::Flat => Box::new(FlatSceneEvaluator::new(
            scene,
            markers,
            frames,
            time_eval_mode,
        )?),
    })
}
