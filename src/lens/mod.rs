//! Lens distortion models.
//!
//! Every model is a closed variant of [`LensModel`] carrying its own
//! coefficients. Each variant provides a polynomial `undistort` (distorted to
//! undistorted image coordinates) and a `distort` that numerically inverts
//! it. Models are chained through [`LensModelTable`], an arena in which every
//! node stores the index of its upstream input model; applying a chain runs
//! the most upstream model first.
//!
//! Coordinates handed to a model are film-back unit coordinates: x and y in
//! `[-0.5, 0.5]` across the film back width and height respectively.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CamSolveError;

pub mod anamorphic;
pub mod basic;
pub mod classic;
pub mod radial;
pub mod table;

pub use anamorphic::AnamorphicDeg4RotateSqueezeXY;
pub use basic::BasicBrownian;
pub use classic::Classic3de;
pub use radial::RadialDecenteredDeg4Cylindric;
pub use table::{LensModelNode, LensModelTable};

/// Maximum Newton iterations used when inverting a polynomial model.
const MAX_INVERSION_ITERATIONS: usize = 20;
/// Inversion stops once the mapped point is this close to the target.
const INVERSION_TOLERANCE: f64 = 1e-12;
/// Step used for the numerical Jacobian of the inversion.
const INVERSION_JACOBIAN_STEP: f64 = 1e-7;

/// Kind tag of a lens model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LensModelType {
    Passthrough,
    Basic,
    Classic3de,
    RadialDecenteredDeg4Cylindric,
    AnamorphicDeg4RotateSqueezeXY,
}

impl fmt::Display for LensModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensModelType::Passthrough => write!(f, "Passthrough"),
            LensModelType::Basic => write!(f, "Basic"),
            LensModelType::Classic3de => write!(f, "3DE Classic"),
            LensModelType::RadialDecenteredDeg4Cylindric => {
                write!(f, "3DE Radial - Standard, Degree 4")
            }
            LensModelType::AnamorphicDeg4RotateSqueezeXY => {
                write!(f, "3DE Anamorphic - Standard, Degree 4, Rotate Squeeze XY")
            }
        }
    }
}

/// A single solvable lens coefficient.
///
/// The textual names are the attribute names used on lens nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LensAttribute {
    BasicK1,
    BasicK2,

    ClassicDistortion,
    ClassicAnamorphicSqueeze,
    ClassicCurvatureX,
    ClassicCurvatureY,
    ClassicQuarticDistortion,

    RadialDegree2Distortion,
    RadialDegree2U,
    RadialDegree2V,
    RadialDegree4Distortion,
    RadialDegree4U,
    RadialDegree4V,
    RadialCylindricDirection,
    RadialCylindricBending,

    AnamorphicDegree2Cx02,
    AnamorphicDegree2Cy02,
    AnamorphicDegree2Cx22,
    AnamorphicDegree2Cy22,
    AnamorphicDegree4Cx04,
    AnamorphicDegree4Cy04,
    AnamorphicDegree4Cx24,
    AnamorphicDegree4Cy24,
    AnamorphicDegree4Cx44,
    AnamorphicDegree4Cy44,
    AnamorphicLensRotation,
    AnamorphicSqueezeX,
    AnamorphicSqueezeY,
}

impl LensAttribute {
    pub const ALL: [LensAttribute; 28] = [
        LensAttribute::BasicK1,
        LensAttribute::BasicK2,
        LensAttribute::ClassicDistortion,
        LensAttribute::ClassicAnamorphicSqueeze,
        LensAttribute::ClassicCurvatureX,
        LensAttribute::ClassicCurvatureY,
        LensAttribute::ClassicQuarticDistortion,
        LensAttribute::RadialDegree2Distortion,
        LensAttribute::RadialDegree2U,
        LensAttribute::RadialDegree2V,
        LensAttribute::RadialDegree4Distortion,
        LensAttribute::RadialDegree4U,
        LensAttribute::RadialDegree4V,
        LensAttribute::RadialCylindricDirection,
        LensAttribute::RadialCylindricBending,
        LensAttribute::AnamorphicDegree2Cx02,
        LensAttribute::AnamorphicDegree2Cy02,
        LensAttribute::AnamorphicDegree2Cx22,
        LensAttribute::AnamorphicDegree2Cy22,
        LensAttribute::AnamorphicDegree4Cx04,
        LensAttribute::AnamorphicDegree4Cy04,
        LensAttribute::AnamorphicDegree4Cx24,
        LensAttribute::AnamorphicDegree4Cy24,
        LensAttribute::AnamorphicDegree4Cx44,
        LensAttribute::AnamorphicDegree4Cy44,
        LensAttribute::AnamorphicLensRotation,
        LensAttribute::AnamorphicSqueezeX,
        LensAttribute::AnamorphicSqueezeY,
    ];

    /// Attribute name on a lens node.
    pub fn attr_name(&self) -> &'static str {
        match self {
            LensAttribute::BasicK1 => "k1",
            LensAttribute::BasicK2 => "k2",
            LensAttribute::ClassicDistortion => "tdeClassic_distortion",
            LensAttribute::ClassicAnamorphicSqueeze => "tdeClassic_anamorphicSqueeze",
            LensAttribute::ClassicCurvatureX => "tdeClassic_curvatureX",
            LensAttribute::ClassicCurvatureY => "tdeClassic_curvatureY",
            LensAttribute::ClassicQuarticDistortion => "tdeClassic_quarticDistortion",
            LensAttribute::RadialDegree2Distortion => "tdeRadialDeg4_degree2_distortion",
            LensAttribute::RadialDegree2U => "tdeRadialDeg4_degree2_u",
            LensAttribute::RadialDegree2V => "tdeRadialDeg4_degree2_v",
            LensAttribute::RadialDegree4Distortion => "tdeRadialDeg4_degree4_distortion",
            LensAttribute::RadialDegree4U => "tdeRadialDeg4_degree4_u",
            LensAttribute::RadialDegree4V => "tdeRadialDeg4_degree4_v",
            LensAttribute::RadialCylindricDirection => "tdeRadialDeg4_cylindricDirection",
            LensAttribute::RadialCylindricBending => "tdeRadialDeg4_cylindricBending",
            LensAttribute::AnamorphicDegree2Cx02 => "tdeAnamorphicDeg4_degree2_cx02",
            LensAttribute::AnamorphicDegree2Cy02 => "tdeAnamorphicDeg4_degree2_cy02",
            LensAttribute::AnamorphicDegree2Cx22 => "tdeAnamorphicDeg4_degree2_cx22",
            LensAttribute::AnamorphicDegree2Cy22 => "tdeAnamorphicDeg4_degree2_cy22",
            LensAttribute::AnamorphicDegree4Cx04 => "tdeAnamorphicDeg4_degree4_cx04",
            LensAttribute::AnamorphicDegree4Cy04 => "tdeAnamorphicDeg4_degree4_cy04",
            LensAttribute::AnamorphicDegree4Cx24 => "tdeAnamorphicDeg4_degree4_cx24",
            LensAttribute::AnamorphicDegree4Cy24 => "tdeAnamorphicDeg4_degree4_cy24",
            LensAttribute::AnamorphicDegree4Cx44 => "tdeAnamorphicDeg4_degree4_cx44",
            LensAttribute::AnamorphicDegree4Cy44 => "tdeAnamorphicDeg4_degree4_cy44",
            LensAttribute::AnamorphicLensRotation => "tdeAnamorphicDeg4_lensRotation",
            LensAttribute::AnamorphicSqueezeX => "tdeAnamorphicDeg4_squeeze_x",
            LensAttribute::AnamorphicSqueezeY => "tdeAnamorphicDeg4_squeeze_y",
        }
    }

    /// Resolve a lens node attribute name, `None` if it is not a lens coefficient.
    pub fn from_attr_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.attr_name() == name)
    }

    /// The model variant this coefficient belongs to.
    pub fn model_type(&self) -> LensModelType {
        use LensAttribute::*;
        match self {
            BasicK1 | BasicK2 => LensModelType::Basic,
            ClassicDistortion
            | ClassicAnamorphicSqueeze
            | ClassicCurvatureX
            | ClassicCurvatureY
            | ClassicQuarticDistortion => LensModelType::Classic3de,
            RadialDegree2Distortion
            | RadialDegree2U
            | RadialDegree2V
            | RadialDegree4Distortion
            | RadialDegree4U
            | RadialDegree4V
            | RadialCylindricDirection
            | RadialCylindricBending => LensModelType::RadialDecenteredDeg4Cylindric,
            _ => LensModelType::AnamorphicDeg4RotateSqueezeXY,
        }
    }
}

impl fmt::Display for LensAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.attr_name())
    }
}

impl FromStr for LensAttribute {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_attr_name(s).ok_or_else(|| {
            CamSolveError::Configuration(format!("Unknown lens attribute kind: {s}"))
        })
    }
}

/// Physical film back description shared by the 3DE-style models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LensGeometry {
    pub film_back_width_cm: f64,
    pub film_back_height_cm: f64,
    pub lens_center_offset_x_cm: f64,
    pub lens_center_offset_y_cm: f64,
}

impl Default for LensGeometry {
    fn default() -> Self {
        Self {
            film_back_width_cm: 3.6,
            film_back_height_cm: 2.4,
            lens_center_offset_x_cm: 0.0,
            lens_center_offset_y_cm: 0.0,
        }
    }
}

impl LensGeometry {
    /// Radius of the film back diagonal; the unit length of normalized coordinates.
    pub fn diagonal_radius(&self) -> f64 {
        0.5 * self
            .film_back_width_cm
            .hypot(self.film_back_height_cm)
    }

    /// Film-back unit coordinates to diagonally normalized coordinates.
    pub fn unit_to_diagonal(&self, x: f64, y: f64) -> (f64, f64) {
        let r = self.diagonal_radius();
        (
            (x * self.film_back_width_cm - self.lens_center_offset_x_cm) / r,
            (y * self.film_back_height_cm - self.lens_center_offset_y_cm) / r,
        )
    }

    /// Inverse of [`LensGeometry::unit_to_diagonal`].
    pub fn diagonal_to_unit(&self, x: f64, y: f64) -> (f64, f64) {
        let r = self.diagonal_radius();
        (
            (x * r + self.lens_center_offset_x_cm) / self.film_back_width_cm,
            (y * r + self.lens_center_offset_y_cm) / self.film_back_height_cm,
        )
    }
}

/// A single distortion transform, without its input chain.
pub trait Distortion {
    /// Polynomial mapping from distorted to undistorted coordinates.
    fn undistort(&self, x: f64, y: f64) -> (f64, f64);

    /// Inverse of [`Distortion::undistort`], found iteratively.
    ///
    /// Returns non-finite values when the polynomial cannot be inverted near
    /// the point; callers fall back to the undistorted input.
    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        invert_undistort(|px, py| self.undistort(px, py), x, y)
    }
}

/// Newton iteration solving `undistort(p) == target` starting at the target.
pub(crate) fn invert_undistort<F>(undistort: F, x: f64, y: f64) -> (f64, f64)
where
    F: Fn(f64, f64) -> (f64, f64),
{
    let target = Vector2::new(x, y);
    let mut point = target;
    for _ in 0..MAX_INVERSION_ITERATIONS {
        let (ux, uy) = undistort(point.x, point.y);
        let residual = Vector2::new(ux, uy) - target;
        if !residual.x.is_finite() || !residual.y.is_finite() {
            return (f64::NAN, f64::NAN);
        }
        if residual.norm() < INVERSION_TOLERANCE {
            break;
        }

        let h = INVERSION_JACOBIAN_STEP;
        let (ax, ay) = undistort(point.x + h, point.y);
        let (bx, by) = undistort(point.x, point.y + h);
        let jacobian = Matrix2::new(
            (ax - ux) / h,
            (bx - ux) / h,
            (ay - uy) / h,
            (by - uy) / h,
        );
        let Some(inverse) = jacobian.try_inverse() else {
            return (f64::NAN, f64::NAN);
        };
        point -= inverse * residual;
    }
    (point.x, point.y)
}

/// One lens model: a closed set of variants with their coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LensModel {
    Passthrough,
    Basic(BasicBrownian),
    Classic3de(Classic3de),
    RadialDecenteredDeg4Cylindric(RadialDecenteredDeg4Cylindric),
    AnamorphicDeg4RotateSqueezeXY(AnamorphicDeg4RotateSqueezeXY),
}

impl Default for LensModel {
    fn default() -> Self {
        LensModel::Passthrough
    }
}

impl LensModel {
    /// A model of the given kind with identity coefficients.
    pub fn identity(model_type: LensModelType) -> Self {
        match model_type {
            LensModelType::Passthrough => LensModel::Passthrough,
            LensModelType::Basic => LensModel::Basic(BasicBrownian::default()),
            LensModelType::Classic3de => LensModel::Classic3de(Classic3de::default()),
            LensModelType::RadialDecenteredDeg4Cylindric => {
                LensModel::RadialDecenteredDeg4Cylindric(RadialDecenteredDeg4Cylindric::default())
            }
            LensModelType::AnamorphicDeg4RotateSqueezeXY => {
                LensModel::AnamorphicDeg4RotateSqueezeXY(AnamorphicDeg4RotateSqueezeXY::default())
            }
        }
    }

    pub fn model_type(&self) -> LensModelType {
        match self {
            LensModel::Passthrough => LensModelType::Passthrough,
            LensModel::Basic(_) => LensModelType::Basic,
            LensModel::Classic3de(_) => LensModelType::Classic3de,
            LensModel::RadialDecenteredDeg4Cylindric(_) => {
                LensModelType::RadialDecenteredDeg4Cylindric
            }
            LensModel::AnamorphicDeg4RotateSqueezeXY(_) => {
                LensModelType::AnamorphicDeg4RotateSqueezeXY
            }
        }
    }

    /// Coefficients this model exposes as lens node attributes.
    pub fn attributes(&self) -> Vec<LensAttribute> {
        let model_type = self.model_type();
        LensAttribute::ALL
            .iter()
            .copied()
            .filter(|kind| kind.model_type() == model_type)
            .collect()
    }

    /// Current value of a coefficient, `None` if the model has no such coefficient.
    pub fn attribute(&self, kind: LensAttribute) -> Option<f64> {
        match self {
            LensModel::Passthrough => None,
            LensModel::Basic(m) => m.attribute(kind),
            LensModel::Classic3de(m) => m.attribute(kind),
            LensModel::RadialDecenteredDeg4Cylindric(m) => m.attribute(kind),
            LensModel::AnamorphicDeg4RotateSqueezeXY(m) => m.attribute(kind),
        }
    }

    /// Set a coefficient; returns false when the model has no such coefficient.
    pub fn set_attribute(&mut self, kind: LensAttribute, value: f64) -> bool {
        match self {
            LensModel::Passthrough => false,
            LensModel::Basic(m) => m.set_attribute(kind, value),
            LensModel::Classic3de(m) => m.set_attribute(kind, value),
            LensModel::RadialDecenteredDeg4Cylindric(m) => m.set_attribute(kind, value),
            LensModel::AnamorphicDeg4RotateSqueezeXY(m) => m.set_attribute(kind, value),
        }
    }

    fn as_distortion(&self) -> Option<&dyn Distortion> {
        match self {
            LensModel::Passthrough => None,
            LensModel::Basic(m) => Some(m),
            LensModel::Classic3de(m) => Some(m),
            LensModel::RadialDecenteredDeg4Cylindric(m) => Some(m),
            LensModel::AnamorphicDeg4RotateSqueezeXY(m) => Some(m),
        }
    }

    /// This model's own undistortion, ignoring any input chain.
    pub fn undistort_point(&self, x: f64, y: f64) -> (f64, f64) {
        match self.as_distortion() {
            Some(model) => model.undistort(x, y),
            None => (x, y),
        }
    }

    /// This model's own distortion, ignoring any input chain.
    pub fn distort_point(&self, x: f64, y: f64) -> (f64, f64) {
        match self.as_distortion() {
            Some(model) => model.distort(x, y),
            None => (x, y),
        }
    }
}
