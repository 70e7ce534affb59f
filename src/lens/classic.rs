//! 3DE "Classic LD Model".

use serde::{Deserialize, Serialize};

use super::{Distortion, LensAttribute, LensGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classic3de {
    pub distortion: f64,
    pub anamorphic_squeeze: f64,
    pub curvature_x: f64,
    pub curvature_y: f64,
    pub quartic_distortion: f64,
    pub geometry: LensGeometry,
}

impl Default for Classic3de {
    fn default() -> Self {
        Self {
            distortion: 0.0,
            anamorphic_squeeze: 1.0,
            curvature_x: 0.0,
            curvature_y: 0.0,
            quartic_distortion: 0.0,
            geometry: LensGeometry::default(),
        }
    }
}

/// Polynomial coefficients derived from the user-facing parameters.
struct ClassicTerms {
    cxx: f64,
    cxy: f64,
    cyx: f64,
    cyy: f64,
    cxxx: f64,
    cxxy: f64,
    cxyy: f64,
    cyxx: f64,
    cyyx: f64,
    cyyy: f64,
}

impl Classic3de {
    pub fn attribute(&self, kind: LensAttribute) -> Option<f64> {
        match kind {
            LensAttribute::ClassicDistortion => Some(self.distortion),
            LensAttribute::ClassicAnamorphicSqueeze => Some(self.anamorphic_squeeze),
            LensAttribute::ClassicCurvatureX => Some(self.curvature_x),
            LensAttribute::ClassicCurvatureY => Some(self.curvature_y),
            LensAttribute::ClassicQuarticDistortion => Some(self.quartic_distortion),
            _ => None,
        }
    }

    pub fn set_attribute(&mut self, kind: LensAttribute, value: f64) -> bool {
        match kind {
            LensAttribute::ClassicDistortion => self.distortion = value,
            LensAttribute::ClassicAnamorphicSqueeze => self.anamorphic_squeeze = value,
            LensAttribute::ClassicCurvatureX => self.curvature_x = value,
            LensAttribute::ClassicCurvatureY => self.curvature_y = value,
            LensAttribute::ClassicQuarticDistortion => self.quartic_distortion = value,
            _ => return false,
        }
        true
    }

    fn is_identity(&self) -> bool {
        self.distortion == 0.0
            && self.curvature_x == 0.0
            && self.curvature_y == 0.0
            && self.quartic_distortion == 0.0
    }

    fn terms(&self) -> ClassicTerms {
        let ld = self.distortion;
        let sq = self.anamorphic_squeeze;
        let qd = self.quartic_distortion;
        ClassicTerms {
            cxx: ld / sq,
            cxy: (ld + self.curvature_x) / sq,
            cyx: ld + self.curvature_y,
            cyy: ld,
            cxxx: qd / sq,
            cxxy: 2.0 * qd / sq,
            cxyy: qd / sq,
            cyxx: qd,
            cyyx: 2.0 * qd,
            cyyy: qd,
        }
    }
}

impl Distortion for Classic3de {
    fn undistort(&self, x: f64, y: f64) -> (f64, f64) {
        if self.is_identity() {
            return (x, y);
        }
        let c = self.terms();
        let (x, y) = self.geometry.unit_to_diagonal(x, y);
        let x2 = x * x;
        let y2 = y * y;
        let x4 = x2 * x2;
        let y4 = y2 * y2;
        let x2y2 = x2 * y2;

        let xu = x * (1.0 + c.cxx * x2 + c.cxy * y2 + c.cxxx * x4 + c.cxxy * x2y2 + c.cxyy * y4);
        let yu = y * (1.0 + c.cyx * x2 + c.cyy * y2 + c.cyxx * x4 + c.cyyx * x2y2 + c.cyyy * y4);
        self.geometry.diagonal_to_unit(xu, yu)
    }
}
