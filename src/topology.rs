//! Resolve which lens models feed which markers.
//!
//! Each camera's lens network is walked once per solve. Every distinct lens
//! node gets one model instance per solve frame in a [`LensModelTable`];
//! chains are wired frame by frame, so frame *k* of a node only ever reads
//! frame *k* of its upstream node. Cameras sharing a lens node share its
//! instances.

use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::attribute::{Attribute, AttributeStore, Frame, ObjectType, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::lens::{LensAttribute, LensModelTable};
use crate::scene::{CameraId, LensLink, LensNodeId, MarkerId, Scene};

/// Enabled lens nodes feeding `camera`, index 0 nearest the camera.
///
/// A disabled toggle anywhere in the network disables distortion for the
/// camera entirely; disabled lens nodes are skipped. Unresolvable links and
/// cycles are logged and make the camera lens-free.
pub fn resolve_camera_chain(
    scene: &Scene,
    camera: CameraId,
    frame: Frame,
    mode: TimeEvalMode,
) -> CamSolveResult<Vec<LensNodeId>> {
    let camera_node = scene.camera(camera)?;
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut link = camera_node.lens;

    while let Some(current) = link {
        if !visited.insert(current) {
            warn!("Lens network of camera {} contains a cycle", camera_node.name);
            return Ok(Vec::new());
        }
        match current {
            LensLink::Toggle(id) => {
                let Ok(toggle) = scene.toggle(id) else {
                    warn!("Camera {} references a missing lens toggle", camera_node.name);
                    return Ok(Vec::new());
                };
                if scene.value(toggle.enable, frame, mode)? <= 0.5 {
                    debug!(
                        "Lens toggle {} disabled, camera {} has no distortion",
                        toggle.name, camera_node.name
                    );
                    return Ok(Vec::new());
                }
                link = toggle.input;
            }
            LensLink::Lens(id) => {
                let Ok(node) = scene.lens_node(id) else {
                    warn!("Camera {} references a missing lens node", camera_node.name);
                    return Ok(Vec::new());
                };
                if scene.value(node.enable, frame, mode)? > 0.5 {
                    chain.push(id);
                }
                link = node.input;
            }
        }
    }
    Ok(chain)
}

/// Per-solve lens model instances and lookup tables.
#[derive(Debug, Clone)]
pub struct LensTopology {
    table: LensModelTable,
    num_frames: usize,
    /// Table offset of frame 0 for each lens node.
    node_offsets: HashMap<LensNodeId, usize>,
    camera_chains: HashMap<CameraId, Vec<LensNodeId>>,
    /// `marker_index * num_frames + frame_index`
    marker_frame_lens: Vec<Option<usize>>,
    /// Lens coefficient driven by each solve attribute.
    attr_lens: Vec<Option<(LensNodeId, LensAttribute)>>,
}

impl LensTopology {
    pub fn build(
        scene: &Scene,
        markers: &[MarkerId],
        attributes: &[Attribute],
        frames: &[Frame],
        mode: TimeEvalMode,
    ) -> CamSolveResult<Self> {
        let num_frames = frames.len();
        let Some(&first_frame) = frames.first() else {
            return Err(CamSolveError::Configuration(
                "Lens topology needs at least one frame".to_string(),
            ));
        };

        // Camera chains.
        let mut camera_chains: HashMap<CameraId, Vec<LensNodeId>> = HashMap::new();
        for &marker in markers {
            let camera = scene.marker(marker)?.camera;
            if camera_chains.contains_key(&camera) {
                continue;
            }
            let chain = resolve_camera_chain(scene, camera, first_frame, mode)?;
            camera_chains.insert(camera, chain);
        }

        // One model per lens node and frame.
        let mut table = LensModelTable::new();
        let mut node_offsets = HashMap::new();
        let mut ordered_nodes: Vec<LensNodeId> = camera_chains.values().flatten().copied().collect();
        ordered_nodes.sort();
        ordered_nodes.dedup();
        for node_id in ordered_nodes {
            let node = scene.lens_node(node_id)?;
            let template = node.template.clone();
            let offset = table.len();
            for &frame in frames {
                let index = table.push(template.clone());
                let Some(model) = table.model_mut(index) else {
                    continue;
                };
                for &(kind, plug) in &node.coefficients {
                    let value = scene.value(plug, frame, mode)?;
                    if !model.set_attribute(kind, value) {
                        error!(
                            "Lens node {} has no coefficient {}, keeping default",
                            node.name, kind
                        );
                    }
                }
            }
            node_offsets.insert(node_id, offset);
        }

        // Wire chains frame by frame, from the most upstream node down.
        let offset_of = |id: &LensNodeId| -> CamSolveResult<usize> {
            node_offsets.get(id).copied().ok_or_else(|| {
                CamSolveError::Topology(format!("Lens node {} has no model instances", id.0))
            })
        };
        for chain in camera_chains.values() {
            for i in (0..chain.len()).rev() {
                let offset = offset_of(&chain[i])?;
                let upstream = chain.get(i + 1).map(offset_of).transpose()?;
                for frame_index in 0..num_frames {
                    table.set_input(offset + frame_index, upstream.map(|u| u + frame_index))?;
                }
            }
        }

        let mut marker_frame_lens = Vec::with_capacity(markers.len() * num_frames);
        for &marker in markers {
            let node = scene.marker(marker)?;
            let chain = camera_chains.get(&node.camera).ok_or_else(|| {
                CamSolveError::Topology(format!(
                    "Camera of marker {} was not found in the camera index",
                    node.name
                ))
            })?;
            let nearest = chain.first().map(offset_of).transpose()?;
            marker_frame_lens.extend((0..num_frames).map(|k| nearest.map(|offset| offset + k)));
        }

        let mut attr_lens = Vec::with_capacity(attributes.len());
        for attr in attributes {
            if attr.object_type != ObjectType::Lens {
                attr_lens.push(None);
                continue;
            }
            let Some(node_id) = scene.find_lens_node(&attr.node_name) else {
                warn!("Lens node for attribute {} not found, skipping", attr.long_name());
                attr_lens.push(None);
                continue;
            };
            let Some(kind) = attr.lens_attribute() else {
                error!("Unknown lens attribute kind: {}", attr.long_name());
                attr_lens.push(None);
                continue;
            };
            if !node_offsets.contains_key(&node_id) {
                warn!(
                    "Lens attribute {} does not feed any solved camera",
                    attr.long_name()
                );
                attr_lens.push(None);
                continue;
            }
            attr_lens.push(Some((node_id, kind)));
        }

        debug!(
            "lens topology: {} cameras, {} lens nodes, {} model instances",
            camera_chains.len(),
            node_offsets.len(),
            table.len()
        );

        Ok(Self {
            table,
            num_frames,
            node_offsets,
            camera_chains,
            marker_frame_lens,
            attr_lens,
        })
    }

    pub fn table(&self) -> &LensModelTable {
        &self.table
    }

    pub fn camera_chain(&self, camera: CameraId) -> Option<&[LensNodeId]> {
        self.camera_chains.get(&camera).map(Vec::as_slice)
    }

    /// Table index of `node` at `frame_index`.
    pub fn model_index(&self, node: LensNodeId, frame_index: usize) -> Option<usize> {
        if frame_index >= self.num_frames {
            return None;
        }
        self.node_offsets.get(&node).map(|offset| offset + frame_index)
    }

    /// Most downstream model for a marker at a frame, `None` when undistorted.
    pub fn marker_lens(&self, marker_index: usize, frame_index: usize) -> Option<usize> {
        self.marker_frame_lens
            .get(marker_index * self.num_frames + frame_index)
            .copied()
            .flatten()
    }

    /// Lens node and coefficient driven by a solve attribute.
    pub fn attribute_lens(&self, attr_index: usize) -> Option<(LensNodeId, LensAttribute)> {
        self.attr_lens.get(attr_index).copied().flatten()
    }

    /// Apply a marker's lens chain to a projected point.
    ///
    /// Non-finite distortion falls back to the undistorted value per axis.
    pub fn distort(&self, marker_index: usize, frame_index: usize, x: f64, y: f64) -> (f64, f64) {
        let Some(index) = self.marker_lens(marker_index, frame_index) else {
            return (x, y);
        };
        let (dx, dy) = self.table.distort(index, x, y);
        if !dx.is_finite() || !dy.is_finite() {
            warn!(
                "Lens distortion is not finite at ({:.6}, {:.6}), using undistorted point",
                x, y
            );
        }
        (
            if dx.is_finite() { dx } else { x },
            if dy.is_finite() { dy } else { y },
        )
    }

    /// Write a solved lens coefficient into the model instances.
    ///
    /// `frame_index` of `None` updates every frame (static attribute).
    pub fn set_lens_attribute(&mut self, attr_index: usize, frame_index: Option<usize>, value: f64) {
        let Some((node, kind)) = self.attribute_lens(attr_index) else {
            return;
        };
        let Some(&offset) = self.node_offsets.get(&node) else {
            return;
        };
        let frames = match frame_index {
            Some(k) if k < self.num_frames => k..k + 1,
            Some(_) => return,
            None => 0..self.num_frames,
        };
        for k in frames {
            if let Some(model) = self.table.model_mut(offset + k) {
                model.set_attribute(kind, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::{LensModel, LensModelType};
    use crate::scene::CameraDesc;
    use nalgebra::Vector3;

    fn basic(k1: f64) -> LensModel {
        let mut model = LensModel::identity(LensModelType::Basic);
        model.set_attribute(LensAttribute::BasicK1, k1);
        model
    }

    #[test]
    fn test_chain_order_and_disabled_nodes() {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let near = scene.add_lens_node("near", basic(0.1)).unwrap();
        let middle = scene.add_lens_node("middle", basic(0.2)).unwrap();
        let far = scene.add_lens_node("far", basic(0.3)).unwrap();
        scene.connect_camera_lens(cam, LensLink::Lens(near)).unwrap();
        scene.connect_lens_input(LensLink::Lens(near), LensLink::Lens(middle)).unwrap();
        scene.connect_lens_input(LensLink::Lens(middle), LensLink::Lens(far)).unwrap();

        let chain = resolve_camera_chain(&scene, cam, 1, TimeEvalMode::DgContext).unwrap();
        assert_eq!(chain, vec![near, middle, far]);

        scene.set_lens_enabled(middle, false).unwrap();
        let chain = resolve_camera_chain(&scene, cam, 1, TimeEvalMode::DgContext).unwrap();
        assert_eq!(chain, vec![near, far]);
    }

    #[test]
    fn test_disabled_toggle_empties_chain() {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let lens_a = scene.add_lens_node("a", basic(0.1)).unwrap();
        let lens_b = scene.add_lens_node("b", basic(0.1)).unwrap();
        let toggle = scene.add_lens_toggle("toggle", false).unwrap();
        scene.connect_camera_lens(cam, LensLink::Lens(lens_a)).unwrap();
        scene.connect_lens_input(LensLink::Lens(lens_a), LensLink::Toggle(toggle)).unwrap();
        scene.connect_lens_input(LensLink::Toggle(toggle), LensLink::Lens(lens_b)).unwrap();

        let chain = resolve_camera_chain(&scene, cam, 1, TimeEvalMode::DgContext).unwrap();
        assert!(chain.is_empty());

        scene.set_toggle_enabled(toggle, true).unwrap();
        let chain = resolve_camera_chain(&scene, cam, 1, TimeEvalMode::DgContext).unwrap();
        assert_eq!(chain, vec![lens_a, lens_b]);
    }

    #[test]
    fn test_cycle_is_lens_free() {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let a = scene.add_lens_node("a", basic(0.1)).unwrap();
        let b = scene.add_lens_node("b", basic(0.1)).unwrap();
        scene.connect_camera_lens(cam, LensLink::Lens(a)).unwrap();
        scene.connect_lens_input(LensLink::Lens(a), LensLink::Lens(b)).unwrap();
        scene.connect_lens_input(LensLink::Lens(b), LensLink::Lens(a)).unwrap();
        let chain = resolve_camera_chain(&scene, cam, 1, TimeEvalMode::DgContext).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_frames_are_wired_to_same_frame_upstream() {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let bnd = scene.add_bundle("bnd", Vector3::new(0.0, 0.0, -5.0)).unwrap();
        let mkr = scene.add_marker("mkr", cam, bnd).unwrap();
        let near = scene.add_lens_node("near", basic(0.0)).unwrap();
        let far = scene.add_lens_node("far", basic(0.0)).unwrap();
        scene.connect_camera_lens(cam, LensLink::Lens(near)).unwrap();
        scene.connect_lens_input(LensLink::Lens(near), LensLink::Lens(far)).unwrap();
        let k1 = scene.plug("far", "k1").unwrap();
        scene.set_key(k1, 1, 0.1).unwrap();
        scene.set_key(k1, 3, 0.3).unwrap();

        let frames = [1, 2, 3];
        let topology =
            LensTopology::build(&scene, &[mkr], &[], &frames, TimeEvalMode::DgContext).unwrap();
        for k in 0..frames.len() {
            let near_index = topology.model_index(near, k).unwrap();
            let far_index = topology.model_index(far, k).unwrap();
            assert_eq!(topology.marker_lens(0, k), Some(near_index));
            assert_eq!(topology.table().node(near_index).unwrap().input, Some(far_index));
            assert_eq!(topology.table().node(far_index).unwrap().input, None);
        }
        let far_frame2 = topology.model_index(far, 1).unwrap();
        let k1_value = topology
            .table()
            .model(far_frame2)
            .unwrap()
            .attribute(LensAttribute::BasicK1)
            .unwrap();
        assert!((k1_value - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_cameras_sharing_a_lens_share_its_models() {
        let mut scene = Scene::new();
        let cam_a = scene.add_camera("cam_a", CameraDesc::default()).unwrap();
        let cam_b = scene.add_camera("cam_b", CameraDesc::default()).unwrap();
        let cam_c = scene.add_camera("cam_c", CameraDesc::default()).unwrap();
        let bnd = scene.add_bundle("bnd", Vector3::new(0.0, 0.0, -5.0)).unwrap();
        let mkr_a = scene.add_marker("mkr_a", cam_a, bnd).unwrap();
        let mkr_b = scene.add_marker("mkr_b", cam_b, bnd).unwrap();
        let mkr_c = scene.add_marker("mkr_c", cam_c, bnd).unwrap();
        let shared = scene.add_lens_node("shared", basic(0.1)).unwrap();
        let own = scene.add_lens_node("own", basic(0.1)).unwrap();
        scene.connect_camera_lens(cam_a, LensLink::Lens(shared)).unwrap();
        scene.connect_camera_lens(cam_b, LensLink::Lens(shared)).unwrap();
        scene.connect_camera_lens(cam_c, LensLink::Lens(own)).unwrap();

        let frames = [1, 2, 3];
        let topology = LensTopology::build(
            &scene,
            &[mkr_a, mkr_b, mkr_c],
            &[],
            &frames,
            TimeEvalMode::DgContext,
        )
        .unwrap();
        for k in 0..frames.len() {
            let shared_index = topology.model_index(shared, k);
            assert!(shared_index.is_some());
            assert_eq!(topology.marker_lens(0, k), shared_index);
            assert_eq!(topology.marker_lens(1, k), topology.marker_lens(0, k));
            assert_eq!(topology.marker_lens(2, k), topology.model_index(own, k));
            assert_ne!(topology.marker_lens(2, k), topology.marker_lens(0, k));
        }
        // One instance per frame, not per camera.
        assert_ne!(topology.marker_lens(0, 0), topology.marker_lens(0, 1));
    }

    #[test]
    fn test_static_lens_attribute_updates_every_frame() {
        let mut scene = Scene::new();
        let cam = scene.add_camera("cam", CameraDesc::default()).unwrap();
        let bnd = scene.add_bundle("bnd", Vector3::new(0.0, 0.0, -5.0)).unwrap();
        let mkr = scene.add_marker("mkr", cam, bnd).unwrap();
        let lens = scene.add_lens_node("lens", basic(0.0)).unwrap();
        scene.connect_camera_lens(cam, LensLink::Lens(lens)).unwrap();
        let attrs = vec![
            scene.attribute("lens", "k1").unwrap(),
            scene.attribute("bnd", "translateX").unwrap(),
        ];

        let mut topology =
            LensTopology::build(&scene, &[mkr], &attrs, &[1, 2], TimeEvalMode::DgContext).unwrap();
        assert_eq!(topology.attribute_lens(0), Some((lens, LensAttribute::BasicK1)));
        assert_eq!(topology.attribute_lens(1), None);

        topology.set_lens_attribute(0, None, 0.25);
        for k in 0..2 {
            let index = topology.model_index(lens, k).unwrap();
            assert_eq!(
                topology.table().model(index).unwrap().attribute(LensAttribute::BasicK1),
                Some(0.25)
            );
        }
        topology.set_lens_attribute(0, Some(1), 0.5);
        let frame0 = topology.model_index(lens, 0).unwrap();
        assert_eq!(
            topology.table().model(frame0).unwrap().attribute(LensAttribute::BasicK1),
            Some(0.25)
        );
    }
}
