//! In-memory scene: cameras, bundles, markers, lens nodes and their plugs.
//!
//! The solver only talks to the scene through [`AttributeStore`] and the
//! [`SceneEvaluator`] strategies, so a host application can replace this
//! module. Every scalar lives in a plug, either static or keyed per frame.

use nalgebra::{Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::attribute::{Attribute, AttributeStore, Frame, ObjectType, PlugId, TimeEvalMode};
use crate::error::{CamSolveError, CamSolveResult};
use crate::lens::{LensAttribute, LensModel};

pub mod camera;
pub mod dag;
pub mod evaluator;
pub mod flat;

pub use camera::{CameraSample, CameraState, Projection};
pub use dag::DagEvaluator;
pub use evaluator::{SceneEvaluator, SceneGraphMode, create_evaluator};
pub use flat::FlatSceneEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LensNodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToggleId(pub usize);

/// A connection into the lens network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LensLink {
    Lens(LensNodeId),
    Toggle(ToggleId),
}

/// Node that owns a plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlugOwner {
    Camera(CameraId),
    Bundle(BundleId),
    Marker(MarkerId),
    Lens(LensNodeId),
    Toggle(ToggleId),
    Free,
}

impl PlugOwner {
    pub fn object_type(&self) -> ObjectType {
        match self {
            PlugOwner::Camera(_) => ObjectType::Camera,
            PlugOwner::Bundle(_) => ObjectType::Bundle,
            PlugOwner::Marker(_) => ObjectType::Marker,
            PlugOwner::Lens(_) => ObjectType::Lens,
            PlugOwner::Toggle(_) => ObjectType::Unknown,
            PlugOwner::Free => ObjectType::Attribute,
        }
    }
}

/// Time-varying scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Curve {
    Static(f64),
    /// Linear between keys, held outside the key range.
    Animated(BTreeMap<Frame, f64>),
}

impl Curve {
    pub fn sample(&self, frame: Frame) -> f64 {
        let keys = match self {
            Curve::Static(value) => return *value,
            Curve::Animated(keys) => keys,
        };
        if let Some(value) = keys.get(&frame) {
            return *value;
        }
        let before = keys.range(..frame).next_back();
        let after = keys.range(frame..).next();
        match (before, after) {
            (Some((f0, v0)), Some((f1, v1))) => {
                let t = f64::from(frame - f0) / f64::from(f1 - f0);
                v0 + (v1 - v0) * t
            }
            (Some((_, v)), None) | (None, Some((_, v))) => *v,
            (None, None) => 0.0,
        }
    }

    pub fn set(&mut self, frame: Option<Frame>, value: f64) {
        match (self, frame) {
            (Curve::Static(current), _) => *current = value,
            (Curve::Animated(keys), Some(frame)) => {
                keys.insert(frame, value);
            }
            (Curve::Animated(keys), None) => keys.values_mut().for_each(|v| *v = value),
        }
    }

    pub fn is_animated(&self) -> bool {
        matches!(self, Curve::Animated(_))
    }
}

#[derive(Debug, Clone)]
struct Plug {
    name: String,
    owner: PlugOwner,
    curve: Curve,
}

/// Static description used to create a camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraDesc {
    pub translate: Vector3<f64>,
    pub rotate: Vector3<f64>,
    pub focal_length_mm: f64,
    pub film_back_width_mm: f64,
    pub film_back_height_mm: f64,
    pub render_width: u32,
    pub render_height: u32,
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            translate: Vector3::zeros(),
            rotate: Vector3::zeros(),
            focal_length_mm: 35.0,
            film_back_width_mm: 36.0,
            film_back_height_mm: 24.0,
            render_width: 1920,
            render_height: 1280,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub name: String,
    pub translate: [PlugId; 3],
    pub rotate: [PlugId; 3],
    pub focal_length: PlugId,
    pub film_back_width: PlugId,
    pub film_back_height: PlugId,
    pub render_width: u32,
    pub render_height: u32,
    /// Most downstream lens connection.
    pub lens: Option<LensLink>,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub name: String,
    pub translate: [PlugId; 3],
}

#[derive(Debug, Clone)]
pub struct Marker {
    pub name: String,
    pub camera: CameraId,
    pub bundle: BundleId,
    pub position: [PlugId; 2],
    pub enable: PlugId,
    pub weight: PlugId,
}

#[derive(Debug, Clone)]
pub struct LensNode {
    pub name: String,
    /// Model kind and default coefficients; per-frame values come from `coefficients`.
    pub template: LensModel,
    pub coefficients: Vec<(LensAttribute, PlugId)>,
    pub enable: PlugId,
    pub input: Option<LensLink>,
}

#[derive(Debug, Clone)]
pub struct LensToggle {
    pub name: String,
    pub enable: PlugId,
    pub input: Option<LensLink>,
}

#[derive(Debug, Clone, Copy)]
enum NodeRef {
    Camera(CameraId),
    Bundle(BundleId),
    Marker(MarkerId),
    Lens(LensNodeId),
    Toggle(ToggleId),
    Free,
}

/// In-memory scene and attribute store.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    plugs: Vec<Plug>,
    plug_index: HashMap<String, PlugId>,
    nodes: HashMap<String, NodeRef>,
    cameras: Vec<Camera>,
    bundles: Vec<Bundle>,
    markers: Vec<Marker>,
    lens_nodes: Vec<LensNode>,
    toggles: Vec<LensToggle>,
    current_frame: Cell<Frame>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame.get()
    }

    pub fn set_current_frame(&self, frame: Frame) {
        self.current_frame.set(frame);
    }

    fn register_node(&mut self, name: &str, node: NodeRef) -> CamSolveResult<()> {
        if name.is_empty() {
            return Err(CamSolveError::Configuration(
                "Node names must not be empty".to_string(),
            ));
        }
        if self.nodes.contains_key(name) {
            return Err(CamSolveError::Configuration(format!(
                "Duplicate node name: {name}"
            )));
        }
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    fn add_plug(&mut self, node: &str, attr: &str, owner: PlugOwner, value: f64) -> PlugId {
        let id = PlugId(self.plugs.len());
        let name = format!("{node}.{attr}");
        self.plug_index.insert(name.clone(), id);
        self.plugs.push(Plug {
            name,
            owner,
            curve: Curve::Static(value),
        });
        id
    }

    fn plug_ref(&self, plug: PlugId) -> CamSolveResult<&Plug> {
        self.plugs.get(plug.0).ok_or_else(|| {
            CamSolveError::SceneEvaluation(format!("Unknown plug id {}", plug.0))
        })
    }

    fn plug_mut(&mut self, plug: PlugId) -> CamSolveResult<&mut Plug> {
        self.plugs.get_mut(plug.0).ok_or_else(|| {
            CamSolveError::SceneEvaluation(format!("Unknown plug id {}", plug.0))
        })
    }

    pub fn add_camera(&mut self, name: &str, desc: CameraDesc) -> CamSolveResult<CameraId> {
        let id = CameraId(self.cameras.len());
        self.register_node(name, NodeRef::Camera(id))?;
        let owner = PlugOwner::Camera(id);
        let translate = [
            self.add_plug(name, "translateX", owner, desc.translate.x),
            self.add_plug(name, "translateY", owner, desc.translate.y),
            self.add_plug(name, "translateZ", owner, desc.translate.z),
        ];
        let rotate = [
            self.add_plug(name, "rotateX", owner, desc.rotate.x),
            self.add_plug(name, "rotateY", owner, desc.rotate.y),
            self.add_plug(name, "rotateZ", owner, desc.rotate.z),
        ];
        let focal_length = self.add_plug(name, "focalLength", owner, desc.focal_length_mm);
        let film_back_width = self.add_plug(name, "filmBackWidth", owner, desc.film_back_width_mm);
        let film_back_height =
            self.add_plug(name, "filmBackHeight", owner, desc.film_back_height_mm);
        self.cameras.push(Camera {
            name: name.to_string(),
            translate,
            rotate,
            focal_length,
            film_back_width,
            film_back_height,
            render_width: desc.render_width,
            render_height: desc.render_height,
            lens: None,
        });
        Ok(id)
    }

    pub fn add_bundle(&mut self, name: &str, position: Vector3<f64>) -> CamSolveResult<BundleId> {
        let id = BundleId(self.bundles.len());
        self.register_node(name, NodeRef::Bundle(id))?;
        let owner = PlugOwner::Bundle(id);
        let translate = [
            self.add_plug(name, "translateX", owner, position.x),
            self.add_plug(name, "translateY", owner, position.y),
            self.add_plug(name, "translateZ", owner, position.z),
        ];
        self.bundles.push(Bundle {
            name: name.to_string(),
            translate,
        });
        Ok(id)
    }

    /// Add a marker observing `bundle` through `camera`. Names must be unique.
    pub fn add_marker(
        &mut self,
        name: &str,
        camera: CameraId,
        bundle: BundleId,
    ) -> CamSolveResult<MarkerId> {
        self.camera(camera)?;
        self.bundle(bundle)?;
        let id = MarkerId(self.markers.len());
        self.register_node(name, NodeRef::Marker(id))?;
        let owner = PlugOwner::Marker(id);
        let position = [
            self.add_plug(name, "translateX", owner, 0.0),
            self.add_plug(name, "translateY", owner, 0.0),
        ];
        let enable = self.add_plug(name, "enable", owner, 1.0);
        let weight = self.add_plug(name, "weight", owner, 1.0);
        self.markers.push(Marker {
            name: name.to_string(),
            camera,
            bundle,
            position,
            enable,
            weight,
        });
        Ok(id)
    }

    /// Key the observed position of a marker at `frame`.
    pub fn set_marker_position(
        &mut self,
        marker: MarkerId,
        frame: Frame,
        x: f64,
        y: f64,
    ) -> CamSolveResult<()> {
        let [px, py] = self.marker(marker)?.position;
        self.set_key(px, frame, x)?;
        self.set_key(py, frame, y)
    }

    pub fn set_marker_enabled(
        &mut self,
        marker: MarkerId,
        frame: Option<Frame>,
        enabled: bool,
    ) -> CamSolveResult<()> {
        let plug = self.marker(marker)?.enable;
        let value = if enabled { 1.0 } else { 0.0 };
        match frame {
            Some(frame) => self.set_key(plug, frame, value),
            None => self.set_value(plug, None, value),
        }
    }

    pub fn set_marker_weight(
        &mut self,
        marker: MarkerId,
        frame: Option<Frame>,
        weight: f64,
    ) -> CamSolveResult<()> {
        let plug = self.marker(marker)?.weight;
        match frame {
            Some(frame) => self.set_key(plug, frame, weight),
            None => self.set_value(plug, None, weight),
        }
    }

    /// Add a lens node; one plug is created per coefficient of `model`.
    pub fn add_lens_node(&mut self, name: &str, model: LensModel) -> CamSolveResult<LensNodeId> {
        let id = LensNodeId(self.lens_nodes.len());
        self.register_node(name, NodeRef::Lens(id))?;
        let owner = PlugOwner::Lens(id);
        let coefficients = model
            .attributes()
            .into_iter()
            .map(|kind| {
                let value = model.attribute(kind).unwrap_or(0.0);
                (kind, self.add_plug(name, kind.attr_name(), owner, value))
            })
            .collect();
        let enable = self.add_plug(name, "enable", owner, 1.0);
        self.lens_nodes.push(LensNode {
            name: name.to_string(),
            template: model,
            coefficients,
            enable,
            input: None,
        });
        Ok(id)
    }

    pub fn add_lens_toggle(&mut self, name: &str, enabled: bool) -> CamSolveResult<ToggleId> {
        let id = ToggleId(self.toggles.len());
        self.register_node(name, NodeRef::Toggle(id))?;
        let enable = self.add_plug(name, "enable", PlugOwner::Toggle(id), f64::from(u8::from(enabled)));
        self.toggles.push(LensToggle {
            name: name.to_string(),
            enable,
            input: None,
        });
        Ok(id)
    }

    /// Add a free scalar, e.g. a regularization weight or target.
    pub fn add_value(&mut self, node: &str, attr: &str, value: f64) -> CamSolveResult<PlugId> {
        if !self.nodes.contains_key(node) {
            self.register_node(node, NodeRef::Free)?;
        }
        if self.plug_index.contains_key(&format!("{node}.{attr}")) {
            return Err(CamSolveError::Configuration(format!(
                "Duplicate attribute: {node}.{attr}"
            )));
        }
        Ok(self.add_plug(node, attr, PlugOwner::Free, value))
    }

    pub fn connect_camera_lens(&mut self, camera: CameraId, link: LensLink) -> CamSolveResult<()> {
        self.check_link(link)?;
        self.camera_mut(camera)?.lens = Some(link);
        Ok(())
    }

    /// Connect `input` upstream of the lens node or toggle `node`.
    pub fn connect_lens_input(&mut self, node: LensLink, input: LensLink) -> CamSolveResult<()> {
        self.check_link(input)?;
        match node {
            LensLink::Lens(id) => self.lens_node_mut(id)?.input = Some(input),
            LensLink::Toggle(id) => self.toggle_mut(id)?.input = Some(input),
        }
        Ok(())
    }

    fn check_link(&self, link: LensLink) -> CamSolveResult<()> {
        match link {
            LensLink::Lens(id) => self.lens_node(id).map(|_| ()),
            LensLink::Toggle(id) => self.toggle(id).map(|_| ()),
        }
    }

    pub fn set_lens_enabled(&mut self, lens: LensNodeId, enabled: bool) -> CamSolveResult<()> {
        let plug = self.lens_node(lens)?.enable;
        self.set_value(plug, None, f64::from(u8::from(enabled)))
    }

    pub fn set_toggle_enabled(&mut self, toggle: ToggleId, enabled: bool) -> CamSolveResult<()> {
        let plug = self.toggle(toggle)?.enable;
        self.set_value(plug, None, f64::from(u8::from(enabled)))
    }

    /// Turn `plug` into an animated curve (if needed) and key it.
    pub fn set_key(&mut self, plug: PlugId, frame: Frame, value: f64) -> CamSolveResult<()> {
        let plug = self.plug_mut(plug)?;
        if let Curve::Static(current) = plug.curve {
            let mut keys = BTreeMap::new();
            keys.insert(frame, current);
            plug.curve = Curve::Animated(keys);
        }
        plug.curve.set(Some(frame), value);
        Ok(())
    }

    pub fn plug(&self, node: &str, attr: &str) -> Option<PlugId> {
        self.plug_index.get(&format!("{node}.{attr}")).copied()
    }

    pub fn plug_name(&self, plug: PlugId) -> Option<&str> {
        self.plugs.get(plug.0).map(|p| p.name.as_str())
    }

    pub fn plug_owner(&self, plug: PlugId) -> Option<PlugOwner> {
        self.plugs.get(plug.0).map(|p| p.owner)
    }

    /// Solvable attribute for `node.attr`, typed by its owning node.
    pub fn attribute(&self, node: &str, attr: &str) -> CamSolveResult<Attribute> {
        let plug = self.plug(node, attr).ok_or_else(|| {
            CamSolveError::Configuration(format!("Unknown attribute: {node}.{attr}"))
        })?;
        let object_type = self
            .plug_owner(plug)
            .map_or(ObjectType::Unknown, |owner| owner.object_type());
        Ok(Attribute::new(node, attr, plug, object_type))
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn lens_nodes(&self) -> &[LensNode] {
        &self.lens_nodes
    }

    pub fn camera(&self, id: CameraId) -> CamSolveResult<&Camera> {
        self.cameras
            .get(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown camera id {}", id.0)))
    }

    fn camera_mut(&mut self, id: CameraId) -> CamSolveResult<&mut Camera> {
        self.cameras
            .get_mut(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown camera id {}", id.0)))
    }

    pub fn bundle(&self, id: BundleId) -> CamSolveResult<&Bundle> {
        self.bundles
            .get(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown bundle id {}", id.0)))
    }

    pub fn marker(&self, id: MarkerId) -> CamSolveResult<&Marker> {
        self.markers
            .get(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown marker id {}", id.0)))
    }

    pub fn lens_node(&self, id: LensNodeId) -> CamSolveResult<&LensNode> {
        self.lens_nodes
            .get(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown lens node id {}", id.0)))
    }

    fn lens_node_mut(&mut self, id: LensNodeId) -> CamSolveResult<&mut LensNode> {
        self.lens_nodes
            .get_mut(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown lens node id {}", id.0)))
    }

    pub fn toggle(&self, id: ToggleId) -> CamSolveResult<&LensToggle> {
        self.toggles
            .get(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown lens toggle id {}", id.0)))
    }

    fn toggle_mut(&mut self, id: ToggleId) -> CamSolveResult<&mut LensToggle> {
        self.toggles
            .get_mut(id.0)
            .ok_or_else(|| CamSolveError::Topology(format!("Unknown lens toggle id {}", id.0)))
    }

    pub fn find_marker(&self, name: &str) -> Option<MarkerId> {
        match self.nodes.get(name) {
            Some(NodeRef::Marker(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn find_camera(&self, name: &str) -> Option<CameraId> {
        match self.nodes.get(name) {
            Some(NodeRef::Camera(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn find_bundle(&self, name: &str) -> Option<BundleId> {
        match self.nodes.get(name) {
            Some(NodeRef::Bundle(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn find_lens_node(&self, name: &str) -> Option<LensNodeId> {
        match self.nodes.get(name) {
            Some(NodeRef::Lens(id)) => Some(*id),
            _ => None,
        }
    }

    fn vector3(&self, plugs: &[PlugId; 3], frame: Frame, mode: TimeEvalMode) -> CamSolveResult<Vector3<f64>> {
        Ok(Vector3::new(
            self.value(plugs[0], frame, mode)?,
            self.value(plugs[1], frame, mode)?,
            self.value(plugs[2], frame, mode)?,
        ))
    }

    /// Camera values sampled at `frame`.
    pub fn camera_sample(
        &self,
        id: CameraId,
        frame: Frame,
        mode: TimeEvalMode,
    ) -> CamSolveResult<CameraSample> {
        let camera = self.camera(id)?;
        Ok(CameraSample {
            translate: self.vector3(&camera.translate, frame, mode)?,
            rotate: self.vector3(&camera.rotate, frame, mode)?,
            focal_length_mm: self.value(camera.focal_length, frame, mode)?,
            film_back_width_mm: self.value(camera.film_back_width, frame, mode)?,
            film_back_height_mm: self.value(camera.film_back_height, frame, mode)?,
            render_width: camera.render_width,
            render_height: camera.render_height,
        })
    }

    pub fn camera_state(
        &self,
        id: CameraId,
        frame: Frame,
        mode: TimeEvalMode,
    ) -> CamSolveResult<CameraState> {
        CameraState::new(&self.camera_sample(id, frame, mode)?)
    }

    pub fn bundle_position(
        &self,
        id: BundleId,
        frame: Frame,
        mode: TimeEvalMode,
    ) -> CamSolveResult<Point3<f64>> {
        let bundle = self.bundle(id)?;
        Ok(Point3::from(self.vector3(&bundle.translate, frame, mode)?))
    }

    /// Observed marker position as stored, before aspect correction.
    pub fn marker_position(
        &self,
        id: MarkerId,
        frame: Frame,
        mode: TimeEvalMode,
    ) -> CamSolveResult<Vector2<f64>> {
        let marker = self.marker(id)?;
        Ok(Vector2::new(
            self.value(marker.position[0], frame, mode)?,
            self.value(marker.position[1], frame, mode)?,
        ))
    }

    pub fn marker_enabled(&self, id: MarkerId, frame: Frame, mode: TimeEvalMode) -> CamSolveResult<bool> {
        let plug = self.marker(id)?.enable;
        Ok(self.value(plug, frame, mode)? > 0.5)
    }

    pub fn marker_weight(&self, id: MarkerId, frame: Frame, mode: TimeEvalMode) -> CamSolveResult<f64> {
        let plug = self.marker(id)?.weight;
        self.value(plug, frame, mode)
    }
}

impl AttributeStore for Scene {
    fn value(&self, plug: PlugId, frame: Frame, mode: TimeEvalMode) -> CamSolveResult<f64> {
        let plug = self.plug_ref(plug)?;
        let frame = match mode {
            TimeEvalMode::DgContext => frame,
            TimeEvalMode::SetTime => {
                self.current_frame.set(frame);
                self.current_frame.get()
            }
        };
        Ok(plug.curve.sample(frame))
    }

    fn set_value(&mut self, plug: PlugId, frame: Option<Frame>, value: f64) -> CamSolveResult<()> {
        let plug = self.plug_mut(plug)?;
        trace!("set {} at {:?} = {}", plug.name, frame, value);
        plug.curve.set(frame, value);
        Ok(())
    }

    fn is_animated(&self, plug: PlugId) -> CamSolveResult<bool> {
        Ok(self.plug_ref(plug)?.curve.is_animated())
    }
}
