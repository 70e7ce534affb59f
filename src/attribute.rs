//! Solvable attributes and the store that holds their values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CamSolveError, CamSolveResult};
use crate::lens::LensAttribute;

/// Animation frame number.
pub type Frame = i32;

/// Handle to one scalar value in an [`AttributeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlugId(pub usize);

/// Kind of scene object an attribute belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Camera,
    Bundle,
    Marker,
    Lens,
    /// A free scalar, e.g. a regularization target.
    Attribute,
    Unknown,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Camera => write!(f, "camera"),
            ObjectType::Bundle => write!(f, "bundle"),
            ObjectType::Marker => write!(f, "marker"),
            ObjectType::Lens => write!(f, "lens"),
            ObjectType::Attribute => write!(f, "attribute"),
            ObjectType::Unknown => write!(f, "unknown"),
        }
    }
}

/// How values are sampled in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeEvalMode {
    /// Evaluate at the requested frame without moving the scene's current time.
    #[default]
    DgContext,
    /// Move the scene's current time to the frame, then evaluate.
    SetTime,
}

impl FromStr for TimeEvalMode {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dg_context" | "dgcontext" => Ok(TimeEvalMode::DgContext),
            "set_time" | "settime" => Ok(TimeEvalMode::SetTime),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown time evaluation mode: {other}"
            ))),
        }
    }
}

/// Get/set access to scalar values over time.
pub trait AttributeStore {
    /// Value of `plug` at `frame`.
    fn value(&self, plug: PlugId, frame: Frame, mode: TimeEvalMode) -> CamSolveResult<f64>;

    /// Write a value at `frame`, or for every frame when `frame` is `None`.
    fn set_value(&mut self, plug: PlugId, frame: Option<Frame>, value: f64) -> CamSolveResult<()>;

    /// Whether the value varies per frame.
    fn is_animated(&self, plug: PlugId) -> CamSolveResult<bool>;
}

/// One scalar solvable quantity.
///
/// Values are mapped into solver space as `value * scale + offset` and are
/// clamped to `[minimum, maximum]` in attribute space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub node_name: String,
    pub attr_name: String,
    pub plug: PlugId,
    pub object_type: ObjectType,
    pub minimum: f64,
    pub maximum: f64,
    pub offset: f64,
    pub scale: f64,
}

impl Attribute {
    pub fn new(
        node_name: impl Into<String>,
        attr_name: impl Into<String>,
        plug: PlugId,
        object_type: ObjectType,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            attr_name: attr_name.into(),
            plug,
            object_type,
            minimum: -f64::MAX,
            maximum: f64::MAX,
            offset: 0.0,
            scale: 1.0,
        }
    }

    pub fn with_bounds(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = minimum;
        self
    }

    pub fn with_maximum(mut self, maximum: f64) -> Self {
        self.maximum = maximum;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// `node.attr`
    pub fn long_name(&self) -> String {
        format!("{}.{}", self.node_name, self.attr_name)
    }

    /// The lens coefficient this attribute drives, for lens attributes.
    pub fn lens_attribute(&self) -> Option<LensAttribute> {
        if self.object_type != ObjectType::Lens {
            return None;
        }
        LensAttribute::from_attr_name(&self.attr_name)
    }

    pub fn is_animated<S: AttributeStore + ?Sized>(&self, store: &S) -> CamSolveResult<bool> {
        store.is_animated(self.plug)
    }

    pub fn value<S: AttributeStore + ?Sized>(
        &self,
        store: &S,
        frame: Frame,
        mode: TimeEvalMode,
    ) -> CamSolveResult<f64> {
        store.value(self.plug, frame, mode)
    }

    /// Write a value clamped to the attribute bounds.
    pub fn set_value<S: AttributeStore + ?Sized>(
        &self,
        store: &mut S,
        frame: Option<Frame>,
        value: f64,
    ) -> CamSolveResult<()> {
        store.set_value(self.plug, frame, value.clamp(self.minimum, self.maximum))
    }

    /// Reject bounds and scales that cannot be mapped into solver space.
    pub fn validate(&self) -> CamSolveResult<()> {
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(CamSolveError::Configuration(format!(
                "Attribute {} has invalid scale {}",
                self.long_name(),
                self.scale
            )));
        }
        if !self.offset.is_finite() {
            return Err(CamSolveError::Configuration(format!(
                "Attribute {} has invalid offset {}",
                self.long_name(),
                self.offset
            )));
        }
        if self.minimum.is_nan() || self.maximum.is_nan() || self.minimum > self.maximum {
            return Err(CamSolveError::Configuration(format!(
                "Attribute {} has invalid bounds [{}, {}]",
                self.long_name(),
                self.minimum,
                self.maximum
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.long_name(), self.object_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_names() {
        let attr = Attribute::new("bundle1", "translateX", PlugId(3), ObjectType::Bundle)
            .with_bounds(-10.0, 10.0)
            .with_scale(2.0)
            .with_offset(1.0);
        assert_eq!(attr.long_name(), "bundle1.translateX");
        assert_eq!(attr.minimum, -10.0);
        assert_eq!(attr.scale, 2.0);
        assert!(attr.validate().is_ok());
        assert!(attr.lens_attribute().is_none());
    }

    #[test]
    fn test_lens_attribute_resolution() {
        let attr = Attribute::new("lens1", "k1", PlugId(0), ObjectType::Lens);
        assert_eq!(attr.lens_attribute(), Some(LensAttribute::BasicK1));
        let unknown = Attribute::new("lens1", "k9", PlugId(0), ObjectType::Lens);
        assert_eq!(unknown.lens_attribute(), None);
    }

    #[test]
    fn test_validate_rejects_zero_scale() {
        let attr = Attribute::new("cam", "rx", PlugId(0), ObjectType::Camera).with_scale(0.0);
        assert!(matches!(attr.validate(), Err(CamSolveError::Configuration(_))));
        let inverted = Attribute::new("cam", "rx", PlugId(0), ObjectType::Camera)
            .with_bounds(1.0, -1.0);
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_time_eval_mode_parse() {
        assert_eq!("set_time".parse::<TimeEvalMode>().unwrap(), TimeEvalMode::SetTime);
        assert!("later".parse::<TimeEvalMode>().is_err());
    }
}
