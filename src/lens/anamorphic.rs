//! 3DE "Anamorphic - Standard, Degree 4" with lens rotation and x/y squeeze.

use serde::{Deserialize, Serialize};

use super::{Distortion, LensAttribute, LensGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnamorphicDeg4RotateSqueezeXY {
    pub cx02: f64,
    pub cy02: f64,
    pub cx22: f64,
    pub cy22: f64,
    pub cx04: f64,
    pub cy04: f64,
    pub cx24: f64,
    pub cy24: f64,
    pub cx44: f64,
    pub cy44: f64,
    /// Degrees.
    pub lens_rotation: f64,
    pub squeeze_x: f64,
    pub squeeze_y: f64,
    pub geometry: LensGeometry,
}

impl Default for AnamorphicDeg4RotateSqueezeXY {
    fn default() -> Self {
        Self {
            cx02: 0.0,
            cy02: 0.0,
            cx22: 0.0,
            cy22: 0.0,
            cx04: 0.0,
            cy04: 0.0,
            cx24: 0.0,
            cy24: 0.0,
            cx44: 0.0,
            cy44: 0.0,
            lens_rotation: 0.0,
            squeeze_x: 1.0,
            squeeze_y: 1.0,
            geometry: LensGeometry::default(),
        }
    }
}

impl AnamorphicDeg4RotateSqueezeXY {
    fn coefficient_mut(&mut self, kind: LensAttribute) -> Option<&mut f64> {
        let field = match kind {
            LensAttribute::AnamorphicDegree2Cx02 => &mut self.cx02,
            LensAttribute::AnamorphicDegree2Cy02 => &mut self.cy02,
            LensAttribute::AnamorphicDegree2Cx22 => &mut self.cx22,
            LensAttribute::AnamorphicDegree2Cy22 => &mut self.cy22,
            LensAttribute::AnamorphicDegree4Cx04 => &mut self.cx04,
            LensAttribute::AnamorphicDegree4Cy04 => &mut self.cy04,
            LensAttribute::AnamorphicDegree4Cx24 => &mut self.cx24,
            LensAttribute::AnamorphicDegree4Cy24 => &mut self.cy24,
            LensAttribute::AnamorphicDegree4Cx44 => &mut self.cx44,
            LensAttribute::AnamorphicDegree4Cy44 => &mut self.cy44,
            LensAttribute::AnamorphicLensRotation => &mut self.lens_rotation,
            LensAttribute::AnamorphicSqueezeX => &mut self.squeeze_x,
            LensAttribute::AnamorphicSqueezeY => &mut self.squeeze_y,
            _ => return None,
        };
        Some(field)
    }

    pub fn attribute(&self, kind: LensAttribute) -> Option<f64> {
        let mut copy = *self;
        copy.coefficient_mut(kind).map(|value| *value)
    }

    pub fn set_attribute(&mut self, kind: LensAttribute, value: f64) -> bool {
        match self.coefficient_mut(kind) {
            Some(field) => {
                *field = value;
                true
            }
            None => false,
        }
    }

    fn is_identity(&self) -> bool {
        [
            self.cx02, self.cy02, self.cx22, self.cy22, self.cx04, self.cy04, self.cx24,
            self.cy24, self.cx44, self.cy44, self.lens_rotation,
        ]
        .iter()
        .all(|c| *c == 0.0)
            && self.squeeze_x == 1.0
            && self.squeeze_y == 1.0
    }
}

impl Distortion for AnamorphicDeg4RotateSqueezeXY {
    fn undistort(&self, x: f64, y: f64) -> (f64, f64) {
        if self.is_identity() {
            return (x, y);
        }
        let (x, y) = self.geometry.unit_to_diagonal(x, y);
        let (s, c) = self.lens_rotation.to_radians().sin_cos();
        let xr = c * x + s * y;
        let yr = -s * x + c * y;

        let x2 = xr * xr;
        let y2 = yr * yr;
        let r2 = x2 + y2;
        let r4 = r2 * r2;
        // r^2 cos(2 phi) and r^4 cos(4 phi)
        let cos2 = x2 - y2;
        let cos4 = cos2 * cos2 - 4.0 * x2 * y2;

        let xp = xr
            * (1.0
                + self.cx02 * r2
                + self.cx22 * cos2
                + self.cx04 * r4
                + self.cx24 * cos2 * r2
                + self.cx44 * cos4);
        let yp = yr
            * (1.0
                + self.cy02 * r2
                + self.cy22 * cos2
                + self.cy04 * r4
                + self.cy24 * cos2 * r2
                + self.cy44 * cos4);

        let xu = (c * xp - s * yp) * self.squeeze_x;
        let yu = (s * xp + c * yp) * self.squeeze_y;
        self.geometry.diagonal_to_unit(xu, yu)
    }
}
