//! Mapping between attribute values and solver parameters.
//!
//! Solver parameters live in an unbounded internal space. An attribute value
//! `v` is first clamped and mapped to `s = v * scale + offset`, then bounded
//! attributes go through a smooth change of variables so the optimizer can
//! move freely while the written value never leaves `[minimum, maximum]`:
//!
//! ```text
//! both bounds   p = asin(2 (s - lo) / (hi - lo) - 1)     s = lo + (hi - lo) / 2 (sin p + 1)
//! lower only    p = sqrt((s - lo + 1)^2 - 1)             s = lo - 1 + sqrt(p^2 + 1)
//! upper only    p = sqrt((hi - s + 1)^2 - 1)             s = hi + 1 - sqrt(p^2 + 1)
//! ```

use nalgebra::DVector;
use std::f64::consts::FRAC_PI_2;

use crate::attribute::{Attribute, AttributeStore, TimeEvalMode};
use crate::error::CamSolveResult;
use crate::layout::SolveLayout;
use crate::scene::Scene;
use crate::topology::LensTopology;

/// Bounds at or beyond this magnitude are treated as absent.
const NO_BOUND: f64 = f32::MAX as f64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum BoundKind {
    None,
    Lower(f64),
    Upper(f64),
    Both(f64, f64),
}

fn has_lower(attr: &Attribute) -> bool {
    attr.minimum > -NO_BOUND
}

fn has_upper(attr: &Attribute) -> bool {
    attr.maximum < NO_BOUND
}

/// Bounds mapped into scaled space.
fn scaled_bounds(attr: &Attribute) -> BoundKind {
    let lo = attr.minimum * attr.scale + attr.offset;
    let hi = attr.maximum * attr.scale + attr.offset;
    // A negative scale swaps which side each bound ends up on.
    let (lo, hi, lower, upper) = if attr.scale < 0.0 {
        (hi, lo, has_upper(attr), has_lower(attr))
    } else {
        (lo, hi, has_lower(attr), has_upper(attr))
    };
    match (lower, upper) {
        (true, true) => BoundKind::Both(lo, hi),
        (true, false) => BoundKind::Lower(lo),
        (false, true) => BoundKind::Upper(hi),
        (false, false) => BoundKind::None,
    }
}

/// How attribute values map to the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterMapping {
    /// Apply the bounded change of variables. When off, values are only
    /// offset/scaled and bounds are enforced by clamping on write.
    pub bounded: bool,
}

impl ParameterMapping {
    pub fn new(bounded: bool) -> Self {
        Self { bounded }
    }

    /// Attribute value to internal parameter.
    pub fn to_internal(&self, attr: &Attribute, value: f64) -> f64 {
        let s = value.clamp(attr.minimum, attr.maximum) * attr.scale + attr.offset;
        if !self.bounded {
            return s;
        }
        match scaled_bounds(attr) {
            BoundKind::None => s,
            BoundKind::Lower(lo) => {
                let t = (s - lo).max(0.0) + 1.0;
                (t * t - 1.0).sqrt()
            }
            BoundKind::Upper(hi) => {
                let t = (hi - s).max(0.0) + 1.0;
                (t * t - 1.0).sqrt()
            }
            BoundKind::Both(lo, hi) => {
                if hi - lo <= 0.0 {
                    return 0.0;
                }
                (2.0 * (s - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0).asin()
            }
        }
    }

    /// Internal parameter to attribute value, clamped to the attribute bounds.
    pub fn to_external(&self, attr: &Attribute, internal: f64) -> f64 {
        let s = if self.bounded {
            match scaled_bounds(attr) {
                BoundKind::None => internal,
                BoundKind::Lower(lo) => lo - 1.0 + (internal * internal + 1.0).sqrt(),
                BoundKind::Upper(hi) => hi + 1.0 - (internal * internal + 1.0).sqrt(),
                BoundKind::Both(lo, hi) => lo + (hi - lo) / 2.0 * (internal.sin() + 1.0),
            }
        } else {
            internal
        };
        ((s - attr.offset) / attr.scale).clamp(attr.minimum, attr.maximum)
    }

    /// Range the internal parameter is meaningful in.
    pub fn internal_range(&self, attr: &Attribute) -> (f64, f64) {
        if !self.bounded {
            return (f64::NEG_INFINITY, f64::INFINITY);
        }
        match scaled_bounds(attr) {
            BoundKind::None => (f64::NEG_INFINITY, f64::INFINITY),
            BoundKind::Lower(_) | BoundKind::Upper(_) => (0.0, f64::INFINITY),
            BoundKind::Both(_, _) => (-FRAC_PI_2, FRAC_PI_2),
        }
    }

    /// Finite-difference steps `(dA, dB)` for a central difference.
    ///
    /// `dA` flips sign when `internal + delta` leaves the internal range and
    /// `dB = -dA` unless that leaves the range too, in which case `dB == dA`
    /// and callers fall back to a forward difference.
    pub fn difference_steps(&self, attr: &Attribute, internal: f64, delta: f64) -> (f64, f64) {
        let (lo, hi) = self.internal_range(attr);
        let delta_a = if internal + delta > hi { -delta } else { delta };
        let delta_b = -delta_a;
        let b = internal + delta_b;
        if b < lo || b > hi {
            (delta_a, delta_a)
        } else {
            (delta_a, delta_b)
        }
    }
}

/// Read the current attribute values into a parameter vector.
///
/// Static attributes are read at the first frame of the batch.
pub fn read_parameters(
    scene: &Scene,
    layout: &SolveLayout,
    mapping: ParameterMapping,
    mode: TimeEvalMode,
) -> CamSolveResult<DVector<f64>> {
    let mut params = DVector::zeros(layout.num_params());
    for (i, slot) in layout.params.iter().enumerate() {
        let attr = &layout.attributes[slot.attr_index];
        let frame_index = slot.frame_index.unwrap_or(0);
        let frame = layout.frames[frame_index];
        let value = attr.value(scene, frame, mode)?;
        params[i] = mapping.to_internal(attr, value);
    }
    Ok(params)
}

/// Write a parameter vector into the scene and the lens models it drives.
pub fn write_parameters(
    scene: &mut Scene,
    topology: &mut LensTopology,
    layout: &SolveLayout,
    mapping: ParameterMapping,
    params: &DVector<f64>,
) -> CamSolveResult<()> {
    for (param, &internal) in params.iter().enumerate() {
        write_parameter(scene, topology, layout, mapping, param, internal)?;
    }
    Ok(())
}

/// Write one parameter, for Jacobian columns.
pub fn write_parameter(
    scene: &mut Scene,
    topology: &mut LensTopology,
    layout: &SolveLayout,
    mapping: ParameterMapping,
    param: usize,
    internal: f64,
) -> CamSolveResult<()> {
    let Some(slot) = layout.params.get(param) else {
        return Ok(());
    };
    let attr = &layout.attributes[slot.attr_index];
    let value = mapping.to_external(attr, internal);
    attr.set_value(scene, layout.param_frame(param), value)?;
    topology.set_lens_attribute(slot.attr_index, slot.frame_index, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{ObjectType, PlugId};
    use approx::assert_relative_eq;

    fn attr() -> Attribute {
        Attribute::new("node", "attr", PlugId(0), ObjectType::Bundle)
    }

    #[test]
    fn test_unbounded_is_offset_scale_only() {
        let mapping = ParameterMapping::new(true);
        let a = attr().with_scale(2.0).with_offset(1.0);
        assert_eq!(mapping.to_internal(&a, 3.0), 7.0);
        assert_eq!(mapping.to_external(&a, 7.0), 3.0);
    }

    #[test]
    fn test_bounded_round_trips() {
        let mapping = ParameterMapping::new(true);
        let cases = [
            (attr().with_bounds(-2.0, 5.0), [-1.5, 0.0, 4.9]),
            (attr().with_minimum(1.0), [1.0, 2.5, 100.0]),
            (attr().with_maximum(-3.0), [-3.0, -10.0, -3.5]),
            (attr().with_bounds(0.0, 10.0).with_scale(-0.5).with_offset(2.0), [0.5, 5.0, 9.0]),
        ];
        for (a, values) in cases {
            for v in values {
                let p = mapping.to_internal(&a, v);
                assert!(p.is_finite());
                assert_relative_eq!(mapping.to_external(&a, p), v, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_any_internal_value_stays_in_bounds() {
        let mapping = ParameterMapping::new(true);
        let a = attr().with_bounds(10.0, 20.0);
        for p in [-100.0, -3.0, 0.0, 1.2, 7.0, 1e6] {
            let v = mapping.to_external(&a, p);
            assert!((10.0..=20.0).contains(&v), "{v}");
        }
        let lower = attr().with_minimum(0.0);
        for p in [-50.0, 0.0, 50.0] {
            assert!(mapping.to_external(&lower, p) >= 0.0);
        }
    }

    #[test]
    fn test_out_of_range_value_is_clamped() {
        let mapping = ParameterMapping::new(false);
        let a = attr().with_bounds(0.0, 1.0);
        assert_eq!(mapping.to_internal(&a, 3.0), 1.0);
        assert_eq!(mapping.to_external(&a, -4.0), 0.0);
    }

    #[test]
    fn test_difference_steps_respect_range() {
        let mapping = ParameterMapping::new(true);
        let both = attr().with_bounds(0.0, 1.0);
        assert_eq!(mapping.difference_steps(&both, 0.0, 1e-4), (1e-4, -1e-4));
        // At the edge of the range both steps point inwards.
        assert_eq!(mapping.difference_steps(&both, FRAC_PI_2, 1e-4), (-1e-4, -1e-4));
        assert_eq!(mapping.difference_steps(&both, 1.0, 1e-4), (1e-4, -1e-4));
        let lower = attr().with_minimum(0.0);
        assert_eq!(mapping.difference_steps(&lower, 0.0, 1e-4), (1e-4, 1e-4));
    }
}
