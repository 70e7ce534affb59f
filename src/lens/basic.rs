//! Two-term radial Brownian model.

use serde::{Deserialize, Serialize};

use super::{Distortion, LensAttribute};

/// Radial distortion `xu = xd (1 + k1 r^2 + k2 r^4)` centred on the film back.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BasicBrownian {
    pub k1: f64,
    pub k2: f64,
}

impl BasicBrownian {
    pub fn new(k1: f64, k2: f64) -> Self {
        Self { k1, k2 }
    }

    pub fn attribute(&self, kind: LensAttribute) -> Option<f64> {
        match kind {
            LensAttribute::BasicK1 => Some(self.k1),
            LensAttribute::BasicK2 => Some(self.k2),
            _ => None,
        }
    }

    pub fn set_attribute(&mut self, kind: LensAttribute, value: f64) -> bool {
        match kind {
            LensAttribute::BasicK1 => self.k1 = value,
            LensAttribute::BasicK2 => self.k2 = value,
            _ => return false,
        }
        true
    }
}

impl Distortion for BasicBrownian {
    fn undistort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let factor = self.k1 * r2 + self.k2 * r2 * r2;
        (x + x * factor, y + y * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_barrel_pulls_points_outward_when_undistorting() {
        let model = BasicBrownian::new(0.1, 0.0);
        let (x, y) = model.undistort(0.4, 0.0);
        assert_abs_diff_eq!(x, 0.4 + 0.4 * 0.1 * 0.16, epsilon = 1e-15);
        assert_eq!(y, 0.0);
    }

    #[test]
    fn test_distort_inverts_undistort() {
        let model = BasicBrownian::new(-0.08, 0.02);
        let (dx, dy) = model.distort(0.35, -0.25);
        let (ux, uy) = model.undistort(dx, dy);
        assert_abs_diff_eq!(ux, 0.35, epsilon = 1e-11);
        assert_abs_diff_eq!(uy, -0.25, epsilon = 1e-11);
    }

    #[test]
    fn test_centre_is_fixed() {
        let model = BasicBrownian::new(0.3, 0.3);
        assert_eq!(model.distort(0.0, 0.0), (0.0, 0.0));
    }
}
