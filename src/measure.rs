//! Reprojection error measurement.
//!
//! One pass fills two residual lists over the layout of a [`SolveLayout`]:
//!
//! - `errors`, handed to the optimizer: signed `(observed - projected) *
//!   image_width * sqrt(weight)`, times [`BEHIND_CAMERA_FACTOR`] when the
//!   bundle is behind the camera, followed by the regularization residuals;
//! - `error_list`, for users: the unweighted absolute pixel error per axis.
//!
//! Statistics are the Euclidean pixel distance per (marker, frame) pair.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, trace};

use crate::attribute::{AttributeStore, TimeEvalMode};
use crate::error::CamSolveResult;
use crate::layout::{ActiveTerm, MarkerFrame, SolveLayout};
use crate::scene::{Scene, SceneEvaluator};
use crate::topology::LensTopology;

/// Residual multiplier for bundles behind the camera.
pub const BEHIND_CAMERA_FACTOR: f64 = 1e6;

/// Smallest standard deviation a regularization term is evaluated with.
const MIN_SIGMA: f64 = 1e-9;

/// Largest exponent of the inverse Gaussian before it is capped.
const MAX_EXPONENT: f64 = 700.0;

/// `exp(-(x - mean)^2 / (2 sigma^2))`
pub fn gaussian(x: f64, mean: f64, sigma: f64) -> f64 {
    let d = x - mean;
    (-(d * d) / (2.0 * sigma * sigma)).exp()
}

/// `(1 / gaussian(value, target, variance) - 1) * weight`
///
/// The variance is floored to a small positive value, and the inverse Gaussian
/// is capped so a far-off value yields a large finite residual.
pub fn regularization_residual(value: f64, target: f64, weight: f64, variance: f64) -> f64 {
    let sigma = if variance.is_finite() && variance.abs() > MIN_SIGMA {
        variance.abs()
    } else {
        MIN_SIGMA
    };
    let d = value - target;
    let exponent = ((d * d) / (2.0 * sigma * sigma)).min(MAX_EXPONENT);
    // exp(e) - 1 == 1 / gaussian - 1, exact at the target.
    exponent.exp_m1() * weight
}

/// Mean, minimum and maximum pixel distance over the measured pairs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl ErrorStats {
    /// Statistics over `distances`; all zero (with an error log) when empty.
    pub fn from_distances<I: IntoIterator<Item = f64>>(distances: I) -> Self {
        let mut sum = 0.0;
        let mut min = f64::MAX;
        let mut max = 0.0_f64;
        let mut count = 0;
        for d in distances {
            sum += d;
            min = min.min(d);
            max = max.max(d);
            count += 1;
        }
        if count == 0 {
            error!("No marker errors were measured");
            return Self::default();
        }
        Self {
            avg: sum / count as f64,
            min,
            max,
            count,
        }
    }
}

impl fmt::Display for ErrorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error avg {:8.4} min {:8.4} max {:8.4}",
            self.avg, self.min, self.max
        )
    }
}

/// Output buffers of a measurement pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Measurement {
    /// Optimizer residuals, `layout.num_errors()` entries.
    pub errors: Vec<f64>,
    /// User-facing residuals, same layout as `errors`.
    pub error_list: Vec<f64>,
    /// Pixel distance per entry of `layout.marker_frames`.
    pub distances: Vec<f64>,
    /// Whether each entry was behind its camera on the last pass it was measured.
    pub behind_camera: Vec<bool>,
    pub stats: ErrorStats,
}

impl Measurement {
    pub fn zeros(layout: &SolveLayout) -> Self {
        let num_entries = layout.marker_frames.len();
        Self {
            errors: vec![0.0; layout.num_errors()],
            error_list: vec![0.0; layout.num_errors()],
            distances: vec![0.0; num_entries],
            behind_camera: vec![false; num_entries],
            stats: ErrorStats::default(),
        }
    }
}

/// Evaluates reprojection and regularization residuals for one batch.
pub struct ErrorMeasurer {
    evaluator: Box<dyn SceneEvaluator>,
    image_width: f64,
    time_eval_mode: TimeEvalMode,
    use_marker_position_cache: bool,
    /// Observed positions per entry of `layout.marker_frames`.
    marker_position_cache: Option<Vec<Vector2<f64>>>,
}

impl fmt::Debug for ErrorMeasurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMeasurer")
            .field("mode", &self.evaluator.mode())
            .field("image_width", &self.image_width)
            .field("use_marker_position_cache", &self.use_marker_position_cache)
            .finish()
    }
}

impl ErrorMeasurer {
    pub fn new(
        evaluator: Box<dyn SceneEvaluator>,
        image_width: f64,
        time_eval_mode: TimeEvalMode,
        use_marker_position_cache: bool,
    ) -> Self {
        Self {
            evaluator,
            image_width,
            time_eval_mode,
            use_marker_position_cache,
            marker_position_cache: None,
        }
    }

    pub fn evaluator(&self) -> &dyn SceneEvaluator {
        self.evaluator.as_ref()
    }

    fn fill_marker_position_cache(
        &mut self,
        scene: &Scene,
        layout: &SolveLayout,
    ) -> CamSolveResult<()> {
        let filled = self
            .marker_position_cache
            .as_ref()
            .is_some_and(|positions| positions.len() == layout.marker_frames.len());
        if !self.use_marker_position_cache || filled {
            return Ok(());
        }
        let positions = layout
            .marker_frames
            .iter()
            .map(|entry| {
                self.evaluator
                    .marker_position(scene, entry.marker_index, entry.frame_index)
            })
            .collect::<CamSolveResult<Vec<_>>>()?;
        self.marker_position_cache = Some(positions);
        Ok(())
    }

    /// Measure the entries selected by `mask` (all when `None`) into `out`.
    ///
    /// Entries that are not measured keep their previous values. The
    /// regularization residuals are always recomputed. `out.stats` is only
    /// updated by full passes.
    pub fn measure(
        &mut self,
        scene: &Scene,
        topology: &LensTopology,
        layout: &SolveLayout,
        mask: Option<&[bool]>,
        out: &mut Measurement,
    ) -> CamSolveResult<()> {
        if out.errors.len() != layout.num_errors() || out.distances.len() != layout.marker_frames.len() {
            *out = Measurement::zeros(layout);
        }

        let samples: Option<Vec<MarkerFrame>> = mask.map(|mask| {
            layout
                .marker_frames
                .iter()
                .zip(mask)
                .filter(|(_, selected)| **selected)
                .map(|(entry, _)| *entry)
                .collect()
        });
        self.evaluator.evaluate(scene, samples.as_deref())?;
        self.fill_marker_position_cache(scene, layout)?;
        let evaluator = self.evaluator.as_ref();
        let cache = self.marker_position_cache.as_deref();
        let image_width = self.image_width;

        let mut measured = Vec::new();
        for (i, entry) in layout.marker_frames.iter().enumerate() {
            if mask.is_some_and(|mask| !mask.get(i).copied().unwrap_or(false)) {
                continue;
            }
            let observed = match cache {
                Some(positions) => positions[i],
                None => evaluator.marker_position(scene, entry.marker_index, entry.frame_index)?,
            };
            let projection = evaluator.project(scene, entry.marker_index, entry.frame_index)?;
            let (px, py) = topology.distort(
                entry.marker_index,
                entry.frame_index,
                projection.point.x,
                projection.point.y,
            );

            let dx = observed.x - px;
            let dy = observed.y - py;
            let factor = if projection.behind_camera {
                BEHIND_CAMERA_FACTOR
            } else {
                1.0
            };
            let scale = image_width * layout.marker_weights[i].sqrt() * factor;

            out.errors[2 * i] = dx * scale;
            out.errors[2 * i + 1] = dy * scale;
            out.error_list[2 * i] = dx.abs() * image_width;
            out.error_list[2 * i + 1] = dy.abs() * image_width;
            out.distances[i] = dx.hypot(dy) * image_width;
            out.behind_camera[i] = projection.behind_camera;
            measured.push(out.distances[i]);
            trace!(
                "marker {} frame {}: observed ({:.6}, {:.6}) projected ({:.6}, {:.6})",
                entry.marker_index,
                entry.frame_index,
                observed.x,
                observed.y,
                px,
                py
            );
        }

        let mut index = layout.num_marker_errors();
        for term in layout.stiffness.iter().chain(layout.smoothness.iter()) {
            let residual = self.term_residual(scene, layout, term)?;
            out.errors[index] = residual;
            out.error_list[index] = residual;
            index += 1;
        }

        if mask.is_none() {
            out.stats = ErrorStats::from_distances(measured);
        }
        Ok(())
    }

    fn term_residual(
        &self,
        scene: &Scene,
        layout: &SolveLayout,
        term: &ActiveTerm,
    ) -> CamSolveResult<f64> {
        let mode = self.time_eval_mode;
        let attr = &layout.attributes[term.attr_index];
        let value = attr.value(scene, term.frame, mode)?;
        let target = scene.value(term.target, term.frame, mode)?;
        let weight = scene.value(term.weight, term.frame, mode)?;
        let variance = scene.value(term.variance, term.frame, mode)?;
        Ok(regularization_residual(value, target, weight, variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_at_mean() {
        for sigma in [1e-6, 0.5, 1.0, 100.0] {
            assert_eq!(gaussian(3.25, 3.25, sigma), 1.0);
        }
        assert!(gaussian(1.0, 0.0, 1.0) < 1.0);
    }

    #[test]
    fn test_regularization_residual() {
        assert_eq!(regularization_residual(2.0, 2.0, 5.0, 0.1), 0.0);
        let expected = (1.0 / gaussian(1.0, 0.0, 2.0) - 1.0) * 3.0;
        assert!((regularization_residual(1.0, 0.0, 3.0, 2.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_regularization_residual_degenerate_variance() {
        let r = regularization_residual(1.0, 0.0, 1.0, 0.0);
        assert!(r.is_finite() && r > 0.0);
        assert_eq!(regularization_residual(1.0, 1.0, 1.0, 0.0), 0.0);
        assert!(regularization_residual(1.0, 0.0, 1.0, f64::NAN).is_finite());
    }

    #[test]
    fn test_stats_empty_is_zero() {
        let stats = ErrorStats::from_distances(Vec::new());
        assert_eq!(stats, ErrorStats::default());
        assert_eq!((stats.avg, stats.min, stats.max), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_stats_values() {
        let stats = ErrorStats::from_distances([1.0, 3.0, 2.0]);
        assert_eq!(stats.avg, 2.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.count, 3);
        assert_eq!(
            stats.to_string(),
            "error avg   2.0000 min   1.0000 max   3.0000"
        );
    }
}
