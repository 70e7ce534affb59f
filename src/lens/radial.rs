//! 3DE "Radial - Standard, Degree 4" with decentering and cylindric correction.

use serde::{Deserialize, Serialize};

use super::{Distortion, LensAttribute, LensGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RadialDecenteredDeg4Cylindric {
    pub degree2_distortion: f64,
    pub degree2_u: f64,
    pub degree2_v: f64,
    pub degree4_distortion: f64,
    pub degree4_u: f64,
    pub degree4_v: f64,
    /// Degrees.
    pub cylindric_direction: f64,
    pub cylindric_bending: f64,
    pub geometry: LensGeometry,
}

impl RadialDecenteredDeg4Cylindric {
    pub fn attribute(&self, kind: LensAttribute) -> Option<f64> {
        match kind {
            LensAttribute::RadialDegree2Distortion => Some(self.degree2_distortion),
            LensAttribute::RadialDegree2U => Some(self.degree2_u),
            LensAttribute::RadialDegree2V => Some(self.degree2_v),
            LensAttribute::RadialDegree4Distortion => Some(self.degree4_distortion),
            LensAttribute::RadialDegree4U => Some(self.degree4_u),
            LensAttribute::RadialDegree4V => Some(self.degree4_v),
            LensAttribute::RadialCylindricDirection => Some(self.cylindric_direction),
            LensAttribute::RadialCylindricBending => Some(self.cylindric_bending),
            _ => None,
        }
    }

    pub fn set_attribute(&mut self, kind: LensAttribute, value: f64) -> bool {
        match kind {
            LensAttribute::RadialDegree2Distortion => self.degree2_distortion = value,
            LensAttribute::RadialDegree2U => self.degree2_u = value,
            LensAttribute::RadialDegree2V => self.degree2_v = value,
            LensAttribute::RadialDegree4Distortion => self.degree4_distortion = value,
            LensAttribute::RadialDegree4U => self.degree4_u = value,
            LensAttribute::RadialDegree4V => self.degree4_v = value,
            LensAttribute::RadialCylindricDirection => self.cylindric_direction = value,
            LensAttribute::RadialCylindricBending => self.cylindric_bending = value,
            _ => return false,
        }
        true
    }

    fn is_identity(&self) -> bool {
        self.degree2_distortion == 0.0
            && self.degree2_u == 0.0
            && self.degree2_v == 0.0
            && self.degree4_distortion == 0.0
            && self.degree4_u == 0.0
            && self.degree4_v == 0.0
            && self.cylindric_bending == 0.0
    }

    /// Symmetric 2x2 cylindric correction matrix `[m00, m01, m11]`.
    fn cylindric_matrix(&self) -> [f64; 3] {
        let q = (1.0 + self.cylindric_bending).sqrt();
        let (s, c) = self.cylindric_direction.to_radians().sin_cos();
        [
            c * c * q + s * s / q,
            (q - 1.0 / q) * c * s,
            c * c / q + s * s * q,
        ]
    }
}

impl Distortion for RadialDecenteredDeg4Cylindric {
    fn undistort(&self, x: f64, y: f64) -> (f64, f64) {
        if self.is_identity() {
            return (x, y);
        }
        let (x, y) = self.geometry.unit_to_diagonal(x, y);
        let x2 = x * x;
        let y2 = y * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;
        let xy = x * y;

        let radial = 1.0 + self.degree2_distortion * r2 + self.degree4_distortion * r4;
        let u = self.degree2_u + self.degree4_u * r2;
        let v = self.degree2_v + self.degree4_v * r2;
        let xr = x * radial + (r2 + 2.0 * x2) * u + 2.0 * xy * v;
        let yr = y * radial + (r2 + 2.0 * y2) * v + 2.0 * xy * u;

        let (xu, yu) = if self.cylindric_bending == 0.0 {
            (xr, yr)
        } else {
            let [m00, m01, m11] = self.cylindric_matrix();
            (m00 * xr + m01 * yr, m01 * xr + m11 * yr)
        };
        self.geometry.diagonal_to_unit(xu, yu)
    }
}
