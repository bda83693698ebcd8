//! Closed-form disposition of the three-compartment mammillary model.

use super::{PkParameters, RateConstants};
use serde::Serialize;
use std::f64::consts::PI;
use thiserror::Error;

/// Relative discriminant magnitude below which two roots are treated as equal.
const REPEATED_ROOT_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CubicDefect {
    #[error("characteristic polynomial has complex roots (discriminant {0:e})")]
    ComplexRoots(f64),
    #[error("characteristic polynomial has a repeated root at {0}")]
    RepeatedRoot(f64),
    #[error("characteristic polynomial has a non-positive root {0}")]
    NonPositiveRoot(f64),
}

/// Roots of the characteristic cubic, largest first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CubicRoots {
    Distinct([f64; 3]),
    /// `simple` root plus a `double` root (equal when the root is triple).
    Repeated { simple: f64, double: f64 },
}

impl CubicRoots {
    /// Solves `λ³ - a2·λ² + a1·λ - a0 = 0` with the trigonometric method.
    pub fn solve(a2: f64, a1: f64, a0: f64) -> Result<Self, CubicDefect> {
        let shift = a2 / 3.0;
        let p = a1 - a2 * a2 / 3.0;
        let q = -2.0 * a2.powi(3) / 27.0 + a2 * a1 / 3.0 - a0;

        let scale = 4.0 * p.abs().powi(3) + 27.0 * q * q;
        let discriminant = -(4.0 * p.powi(3) + 27.0 * q * q);

        if scale == 0.0 {
            return Ok(CubicRoots::Repeated {
                simple: shift,
                double: shift,
            });
        }
        if discriminant.abs() <= REPEATED_ROOT_TOLERANCE * scale {
            return Ok(CubicRoots::Repeated {
                simple: 3.0 * q / p + shift,
                double: -1.5 * q / p + shift,
            });
        }
        if discriminant < 0.0 {
            return Err(CubicDefect::ComplexRoots(discriminant));
        }

        let m = 2.0 * (-p / 3.0).sqrt();
        let cos_arg = (1.5 * q / p * (-3.0 / p).sqrt()).clamp(-1.0, 1.0);
        let theta = cos_arg.acos() / 3.0;
        let mut roots = [0.0; 3];
        for (k, root) in roots.iter_mut().enumerate() {
            *root = m * (theta - 2.0 * PI * k as f64 / 3.0).cos() + shift;
        }
        roots.sort_by(|a, b| b.total_cmp(a));
        Ok(CubicRoots::Distinct(roots))
    }

    pub fn distinct(self) -> Result<[f64; 3], CubicDefect> {
        match self {
            CubicRoots::Distinct(roots) => Ok(roots),
            CubicRoots::Repeated { double, .. } => Err(CubicDefect::RepeatedRoot(double)),
        }
    }
}

/// Tri-exponential impulse response `Cp(t)/dose = A·e^(-αt) + B·e^(-βt) + C·e^(-γt)`.
///
/// Exponents in 1/min with α > β > γ > 0; coefficients in 1/L (per mg bolus).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlasmaCoefficients {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl PlasmaCoefficients {
    pub fn new(pk: &PkParameters, k: &RateConstants) -> Result<Self, CubicDefect> {
        let (a2, a1, a0) = k.characteristic_polynomial();
        let lambda = CubicRoots::solve(a2, a1, a0)?.distinct()?;
        if lambda[2] <= 0.0 {
            return Err(CubicDefect::NonPositiveRoot(lambda[2]));
        }

        let mut coeff = [0.0; 3];
        for i in 0..3 {
            let (j, l) = ((i + 1) % 3, (i + 2) % 3);
            let l_i = lambda[i];
            coeff[i] = (k.k21 - l_i) * (k.k31 - l_i)
                / ((lambda[j] - l_i) * (lambda[l] - l_i))
                / pk.v1;
        }

        Ok(Self {
            alpha: lambda[0],
            beta: lambda[1],
            gamma: lambda[2],
            a: coeff[0],
            b: coeff[1],
            c: coeff[2],
        })
    }

    pub fn exponents(&self) -> [f64; 3] {
        [self.alpha, self.beta, self.gamma]
    }

    pub fn coefficients(&self) -> [f64; 3] {
        [self.a, self.b, self.c]
    }

    /// Plasma concentration `t` minutes after a bolus of `dose` mg.
    pub fn bolus_concentration(&self, dose: f64, t: f64) -> f64 {
        if t < 0.0 {
            return 0.0;
        }
        dose * self
            .exponents()
            .iter()
            .zip(self.coefficients())
            .map(|(l, c)| c * (-l * t).exp())
            .sum::<f64>()
    }
}
