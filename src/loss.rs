//! Robust loss functions applied to the optimizer residuals.
//!
//! Each loss is evaluated on the normalized squared residual `z = (f / s)^2`
//! where `s` is the loss scale, and returns `[ρ(z), ρ'(z), ρ''(z)]`. The
//! residual is then rescaled so that its square is the robust cost while its
//! sign is kept:
//!
//! ```text
//! f <- f sqrt(ρ(z) / z)      (f unchanged when z = 0, since ρ'(0) = 1)
//! ```
//!
//! so `sum f^2 = s^2 sum ρ(z)`, and a finite-difference Jacobian of the
//! rescaled residuals is the Gauss-Newton model of the robust cost.
//!
//! Only the copy handed to the optimizer is rescaled. The per-marker pixel
//! errors reported to users never pass through a loss.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CamSolveError, CamSolveResult};

/// Cost function of a normalized squared residual.
pub trait Loss: Send + Sync {
    /// Evaluate the loss and its first two derivatives at `z >= 0`.
    fn evaluate(&self, z: f64) -> [f64; 3];
}

/// Plain least squares, `ρ(z) = z`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialLoss;

impl Loss for TrivialLoss {
    fn evaluate(&self, z: f64) -> [f64; 3] {
        [z, 1.0, 0.0]
    }
}

/// Smooth L1, `ρ(z) = 2 (sqrt(1 + z) - 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftL1Loss;

impl Loss for SoftL1Loss {
    fn evaluate(&self, z: f64) -> [f64; 3] {
        let t = 1.0 + z;
        let sqrt_t = t.sqrt();
        [
            2.0 * (sqrt_t - 1.0),
            1.0 / sqrt_t,
            -0.5 / (t * sqrt_t),
        ]
    }
}

/// Cauchy, `ρ(z) = ln(1 + z)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CauchyLoss;

impl Loss for CauchyLoss {
    fn evaluate(&self, z: f64) -> [f64; 3] {
        let t = 1.0 + z;
        let inv = 1.0 / t;
        [t.ln(), inv, -(inv * inv)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustLossType {
    #[default]
    Trivial,
    SoftL1,
    Cauchy,
}

impl fmt::Display for RobustLossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobustLossType::Trivial => write!(f, "trivial"),
            RobustLossType::SoftL1 => write!(f, "soft_l1"),
            RobustLossType::Cauchy => write!(f, "cauchy"),
        }
    }
}

impl FromStr for RobustLossType {
    type Err = CamSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" | "none" => Ok(RobustLossType::Trivial),
            "soft_l1" | "softl1" => Ok(RobustLossType::SoftL1),
            "cauchy" => Ok(RobustLossType::Cauchy),
            other => Err(CamSolveError::Configuration(format!(
                "Unknown robust loss type: {other}"
            ))),
        }
    }
}

/// A loss function together with the scale it is applied at.
pub struct RobustLoss {
    loss_type: RobustLossType,
    scale: f64,
    loss: Box<dyn Loss>,
}

impl fmt::Debug for RobustLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustLoss")
            .field("loss_type", &self.loss_type)
            .field("scale", &self.scale)
            .finish()
    }
}

impl RobustLoss {
    pub fn new(loss_type: RobustLossType, scale: f64) -> CamSolveResult<Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(CamSolveError::Configuration(format!(
                "Robust loss scale must be a positive finite number, got {scale}"
            )));
        }
        let loss: Box<dyn Loss> = match loss_type {
            RobustLossType::Trivial => Box::new(TrivialLoss),
            RobustLossType::SoftL1 => Box::new(SoftL1Loss),
            RobustLossType::Cauchy => Box::new(CauchyLoss),
        };
        Ok(Self {
            loss_type,
            scale,
            loss,
        })
    }

    pub fn loss_type(&self) -> RobustLossType {
        self.loss_type
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_trivial(&self) -> bool {
        self.loss_type == RobustLossType::Trivial
    }

    /// Rescale residuals in place. Length and signs are preserved.
    pub fn apply(&self, residuals: &mut [f64]) {
        if self.is_trivial() {
            return;
        }
        let scale2 = self.scale * self.scale;
        for f in residuals.iter_mut() {
            let z = (*f * *f) / scale2;
            if !(z > 0.0) || !z.is_finite() {
                continue;
            }
            let [rho, _, _] = self.loss.evaluate(z);
            *f *= (rho / z).max(0.0).sqrt();
        }
    }
}
