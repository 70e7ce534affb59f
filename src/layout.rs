//! Residual and parameter layout of one solve batch.
//!
//! The residual vector is laid out as two entries (x, y) per measured
//! (marker, frame) pair, followed by one entry per active stiffness term and
//! one per active smoothness term. The layout is computed once per batch and
//! every measurement pass writes into the same slots.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attribute::{Attribute, AttributeStore, Frame, PlugId, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::relationships::MarkerAttrMatrix;
use crate::scene::{MarkerId, Scene};

/// Regularization of one solve attribute towards a target value.
///
/// `attribute` indexes the attribute list the term is declared against;
/// `weight`, `variance` and `target` are plugs read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegularizationTerm {
    pub attribute: usize,
    pub weight: PlugId,
    pub variance: PlugId,
    pub target: PlugId,
}

/// One (marker, frame) pair that produces residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerFrame {
    pub marker_index: usize,
    pub frame_index: usize,
}

/// A regularization term that contributes a residual, resolved to layout
/// attribute indices and the frame its values are read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveTerm {
    pub attr_index: usize,
    pub weight: PlugId,
    pub variance: PlugId,
    pub target: PlugId,
    pub frame: Frame,
}

/// One solver parameter: an attribute, per frame when animated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSlot {
    pub attr_index: usize,
    /// `None` for static attributes, which hold one value for every frame.
    pub frame_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SolveLayout {
    pub markers: Vec<MarkerId>,
    pub attributes: Vec<Attribute>,
    pub frames: Vec<Frame>,
    /// Residual slots `2 * i` and `2 * i + 1` belong to `marker_frames[i]`.
    pub marker_frames: Vec<MarkerFrame>,
    /// Marker weight per entry of `marker_frames`, normalized per frame.
    pub marker_weights: Vec<f64>,
    pub stiffness: Vec<ActiveTerm>,
    pub smoothness: Vec<ActiveTerm>,
    pub params: Vec<ParamSlot>,
    /// `marker_to_attr[marker][attribute]`
    pub marker_to_attr: MarkerAttrMatrix,
    /// Entries of `marker_frames` whose residuals depend on each parameter.
    pub param_entries: Vec<Vec<usize>>,
}

impl SolveLayout {
    /// Count residuals and parameters for a batch.
    ///
    /// `stiffness`/`smoothness` terms index into `attributes`; terms whose
    /// weight is not positive at the first frame contribute nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        scene: &Scene,
        markers: Vec<MarkerId>,
        attributes: Vec<Attribute>,
        frames: Vec<Frame>,
        stiffness: &[RegularizationTerm],
        smoothness: &[RegularizationTerm],
        marker_to_attr: MarkerAttrMatrix,
        mode: TimeEvalMode,
    ) -> CamSolveResult<Self> {
        let Some(&first_frame) = frames.first() else {
            return Err(CamSolveError::Configuration(
                "A solve needs at least one frame".to_string(),
            ));
        };
        if marker_to_attr.len() != markers.len()
            || marker_to_attr.iter().any(|row| row.len() != attributes.len())
        {
            return Err(CamSolveError::InvalidInput(format!(
                "Marker/attribute relation must be {}x{}",
                markers.len(),
                attributes.len()
            )));
        }

        let (marker_frames, marker_weights) = count_marker_errors(scene, &markers, &frames, mode)?;
        let stiffness = active_terms(scene, stiffness, attributes.len(), first_frame, mode, "stiffness")?;
        let smoothness = active_terms(scene, smoothness, attributes.len(), first_frame, mode, "smoothness")?;

        let mut params = Vec::new();
        for (attr_index, attr) in attributes.iter().enumerate() {
            attr.validate()?;
            if attr.is_animated(scene)? {
                params.extend((0..frames.len()).map(|k| ParamSlot {
                    attr_index,
                    frame_index: Some(k),
                }));
            } else {
                params.push(ParamSlot {
                    attr_index,
                    frame_index: None,
                });
            }
        }

        let param_entries = params
            .iter()
            .map(|slot| {
                marker_frames
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| {
                        marker_to_attr[entry.marker_index][slot.attr_index]
                            && slot.frame_index.is_none_or(|k| k == entry.frame_index)
                    })
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let layout = Self {
            markers,
            attributes,
            frames,
            marker_frames,
            marker_weights,
            stiffness,
            smoothness,
            params,
            marker_to_attr,
            param_entries,
        };
        debug!(
            "layout: {} marker errors, {} stiffness, {} smoothness, {} parameters",
            layout.num_marker_errors(),
            layout.stiffness.len(),
            layout.smoothness.len(),
            layout.num_params()
        );
        Ok(layout)
    }

    pub fn num_marker_errors(&self) -> usize {
        self.marker_frames.len() * 2
    }

    pub fn num_errors(&self) -> usize {
        self.num_marker_errors() + self.stiffness.len() + self.smoothness.len()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Frame a parameter is written at, `None` for every frame.
    pub fn param_frame(&self, param: usize) -> Option<Frame> {
        self.params
            .get(param)
            .and_then(|slot| slot.frame_index)
            .and_then(|k| self.frames.get(k).copied())
    }

    /// Whether the residuals of a (marker, frame) entry depend on a parameter.
    pub fn entry_affected_by(&self, entry: usize, param: usize) -> bool {
        self.param_entries
            .get(param)
            .is_some_and(|entries| entries.binary_search(&entry).is_ok())
    }
}

/// Enabled (marker, frame) pairs with positive weight, and their weights
/// normalized by the largest weight of the frame.
fn count_marker_errors(
    scene: &Scene,
    markers: &[MarkerId],
    frames: &[Frame],
    mode: TimeEvalMode,
) -> CamSolveResult<(Vec<MarkerFrame>, Vec<f64>)> {
    let mut frame_max = vec![0.0_f64; frames.len()];
    let mut entries = Vec::new();
    let mut weights = Vec::new();
    for (marker_index, &marker) in markers.iter().enumerate() {
        for (frame_index, &frame) in frames.iter().enumerate() {
            if !scene.marker_enabled(marker, frame, mode)? {
                continue;
            }
            let weight = scene.marker_weight(marker, frame, mode)?;
            if !(weight > 0.0) {
                continue;
            }
            frame_max[frame_index] = frame_max[frame_index].max(weight);
            entries.push(MarkerFrame {
                marker_index,
                frame_index,
            });
            weights.push(weight);
        }
    }
    for (entry, weight) in entries.iter().zip(weights.iter_mut()) {
        *weight /= frame_max[entry.frame_index];
    }
    Ok((entries, weights))
}

fn active_terms(
    scene: &Scene,
    terms: &[RegularizationTerm],
    num_attributes: usize,
    frame: Frame,
    mode: TimeEvalMode,
    kind: &str,
) -> CamSolveResult<Vec<ActiveTerm>> {
    let mut active = Vec::new();
    for term in terms {
        if term.attribute >= num_attributes {
            warn!(
                "Skipping {} term for attribute index {}, it is not part of the solve",
                kind, term.attribute
            );
            continue;
        }
        let weight = scene.value(term.weight, frame, mode)?;
        if weight > 0.0 {
            active.push(ActiveTerm {
                attr_index: term.attribute,
                weight: term.weight,
                variance: term.variance,
                target: term.target,
                frame,
            });
        }
    }
    Ok(active)
}
