//! Camera projection math shared by every scene evaluator.

use nalgebra::{Matrix4, Point3, Rotation3, Translation3, Vector2, Vector3, Vector4};

use crate::error::{CamSolveError, CamSolveResult};

const NEAR_CLIP: f64 = 0.1;
const FAR_CLIP: f64 = 10000.0;

/// Evaluated camera values at one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraState {
    /// Maps world points to clip space.
    pub world_projection: Matrix4<f64>,
    pub position: Point3<f64>,
    /// Unit viewing direction in world space.
    pub forward: Vector3<f64>,
    pub film_back_aspect: f64,
    pub render_aspect: f64,
}

/// A bundle projected into film-back unit coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub point: Vector2<f64>,
    pub behind_camera: bool,
}

/// Inputs needed to build a [`CameraState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSample {
    pub translate: Vector3<f64>,
    /// Euler XYZ, degrees.
    pub rotate: Vector3<f64>,
    pub focal_length_mm: f64,
    pub film_back_width_mm: f64,
    pub film_back_height_mm: f64,
    pub render_width: u32,
    pub render_height: u32,
}

/// Euler XYZ rotation (X applied first), angles in degrees.
pub fn rotation_xyz(rotate: &Vector3<f64>) -> Rotation3<f64> {
    let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), rotate.x.to_radians());
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), rotate.y.to_radians());
    let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), rotate.z.to_radians());
    rz * ry * rx
}

impl CameraState {
    pub fn new(sample: &CameraSample) -> CamSolveResult<Self> {
        if sample.focal_length_mm <= 0.0
            || sample.film_back_width_mm <= 0.0
            || sample.film_back_height_mm <= 0.0
        {
            return Err(CamSolveError::SceneEvaluation(format!(
                "Invalid camera lens: focal {} mm, film back {} x {} mm",
                sample.focal_length_mm, sample.film_back_width_mm, sample.film_back_height_mm
            )));
        }
        if sample.render_width == 0 || sample.render_height == 0 {
            return Err(CamSolveError::SceneEvaluation(
                "Render resolution must be non-zero".to_string(),
            ));
        }

        let rotation = rotation_xyz(&sample.rotate);
        let world = Translation3::from(sample.translate).to_homogeneous() * rotation.to_homogeneous();
        let view = world.try_inverse().ok_or_else(|| {
            CamSolveError::SceneEvaluation("Camera world matrix is singular".to_string())
        })?;

        let mut projection = Matrix4::zeros();
        projection[(0, 0)] = 2.0 * sample.focal_length_mm / sample.film_back_width_mm;
        projection[(1, 1)] = 2.0 * sample.focal_length_mm / sample.film_back_height_mm;
        projection[(2, 2)] = -(FAR_CLIP + NEAR_CLIP) / (FAR_CLIP - NEAR_CLIP);
        projection[(2, 3)] = -2.0 * FAR_CLIP * NEAR_CLIP / (FAR_CLIP - NEAR_CLIP);
        projection[(3, 2)] = -1.0;

        Ok(Self {
            world_projection: projection * view,
            position: Point3::from(sample.translate),
            forward: rotation * -Vector3::z(),
            film_back_aspect: sample.film_back_width_mm / sample.film_back_height_mm,
            render_aspect: f64::from(sample.render_width) / f64::from(sample.render_height),
        })
    }

    /// Project a world point to film-back unit coordinates.
    pub fn project(&self, point: &Point3<f64>) -> Projection {
        let clip = self.world_projection * Vector4::new(point.x, point.y, point.z, 1.0);
        let mut w = clip.w;
        if w.abs() < f64::EPSILON {
            w = f64::EPSILON.copysign(w);
        }
        let ndc = Vector2::new(clip.x / w, clip.y / w);

        let direction = point - self.position;
        let norm = direction.norm();
        let behind_camera = norm > 0.0 && self.forward.dot(&(direction / norm)) < 0.0;

        Projection {
            point: ndc * 0.5,
            behind_camera,
        }
    }

    /// Factor applied to observed marker y so it is in film-back units.
    pub fn marker_aspect_correction(&self) -> f64 {
        self.render_aspect / self.film_back_aspect
    }
}
