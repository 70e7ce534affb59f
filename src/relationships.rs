//! Which attributes influence which markers.
//!
//! The marker/attribute relation drives three things: dropping markers and
//! attributes that take no part in the solve, sizing the problem, and the
//! sparsity of the finite-difference Jacobian (a column only re-measures the
//! markers its attribute can move).

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::attribute::{Attribute, Frame, TimeEvalMode};
use crate::error::CamSolveResult;
use crate::scene::{CameraId, LensNodeId, MarkerId, PlugOwner, Scene};
use crate::topology::resolve_camera_chain;

/// `affects[marker][attribute]`
pub type MarkerAttrMatrix = Vec<Vec<bool>>;

/// Compute the marker/attribute relation from scene connectivity.
///
/// Camera attributes move that camera's markers, bundle attributes the
/// markers tracking that bundle, lens attributes every marker whose camera
/// chain contains the lens node, and marker attributes only that marker.
/// Free values (regularization targets and the like) move no marker.
pub fn compute_marker_affects(
    scene: &Scene,
    markers: &[MarkerId],
    attributes: &[Attribute],
    frame: Frame,
    mode: TimeEvalMode,
) -> CamSolveResult<MarkerAttrMatrix> {
    let mut chains: HashMap<CameraId, Vec<LensNodeId>> = HashMap::new();
    let mut affects = Vec::with_capacity(markers.len());

    for &marker_id in markers {
        let marker = scene.marker(marker_id)?;
        if !chains.contains_key(&marker.camera) {
            let chain = resolve_camera_chain(scene, marker.camera, frame, mode)?;
            chains.insert(marker.camera, chain);
        }
        let chain = chains.get(&marker.camera).map(Vec::as_slice).unwrap_or(&[]);

        let mut row = Vec::with_capacity(attributes.len());
        for attr in attributes {
            let related = match scene.plug_owner(attr.plug) {
                Some(PlugOwner::Camera(camera)) => camera == marker.camera,
                Some(PlugOwner::Bundle(bundle)) => bundle == marker.bundle,
                Some(PlugOwner::Marker(owner)) => owner == marker_id,
                Some(PlugOwner::Lens(node)) => chain.contains(&node),
                Some(PlugOwner::Toggle(_)) | Some(PlugOwner::Free) => false,
                None => {
                    warn!("Attribute {} is not part of the scene", attr.long_name());
                    false
                }
            };
            row.push(related);
        }
        affects.push(row);
    }
    Ok(affects)
}

/// Markers and attributes that take part in the relation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSplit {
    pub used_markers: Vec<usize>,
    pub unused_markers: Vec<usize>,
    pub used_attributes: Vec<usize>,
    pub unused_attributes: Vec<usize>,
}

impl UsageSplit {
    pub fn from_affects(affects: &MarkerAttrMatrix, num_attributes: usize) -> Self {
        let mut split = UsageSplit::default();
        for (marker, row) in affects.iter().enumerate() {
            if row.iter().any(|&related| related) {
                split.used_markers.push(marker);
            } else {
                split.unused_markers.push(marker);
            }
        }
        for attr in 0..num_attributes {
            if affects.iter().any(|row| row.get(attr).copied().unwrap_or(false)) {
                split.used_attributes.push(attr);
            } else {
                split.unused_attributes.push(attr);
            }
        }
        debug!(
            "usage: {} used markers, {} unused markers, {} used attributes, {} unused attributes",
            split.used_markers.len(),
            split.unused_markers.len(),
            split.used_attributes.len(),
            split.unused_attributes.len()
        );
        split
    }
}

/// Restrict a relation to the given marker and attribute subsets.
pub fn select(
    affects: &MarkerAttrMatrix,
    markers: &[usize],
    attributes: &[usize],
) -> MarkerAttrMatrix {
    markers
        .iter()
        .map(|&m| {
            attributes
                .iter()
                .map(|&a| affects.get(m).and_then(|row| row.get(a)).copied().unwrap_or(false))
                .collect()
        })
        .collect()
}
