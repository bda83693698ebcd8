pub mod masui;
pub mod three_compartment;

use crate::error::{TciError, TciResult};
use crate::patient::PatientParameters;
use serde::Serialize;

pub use masui::MasuiModel;
pub use three_compartment::{CubicDefect, CubicRoots, PlasmaCoefficients};

/// A published population model mapping demographics to compartment parameters.
pub trait PopulationModel {
    fn name(&self) -> &'static str;
    fn pk_parameters(&self, patient: &PatientParameters) -> TciResult<PkParameters>;
    /// Time to peak effect-site concentration after a bolus (min).
    fn time_to_peak_effect(&self) -> f64;
}

/// Compartment volumes (L) and clearances (L/min) for one patient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PkParameters {
    pub ideal_body_weight: f64,
    pub adjusted_body_weight: f64,
    pub v1: f64,
    pub v2: f64,
    pub v3: f64,
    pub cl: f64,
    pub q2: f64,
    pub q3: f64,
}

impl PkParameters {
    /// Rejects any non-positive or non-finite value.
    pub fn checked(self) -> TciResult<Self> {
        let named = [
            ("IBW", self.ideal_body_weight),
            ("ABW", self.adjusted_body_weight),
            ("V1", self.v1),
            ("V2", self.v2),
            ("V3", self.v3),
            ("CL", self.cl),
            ("Q2", self.q2),
            ("Q3", self.q3),
        ];
        for (name, value) in named {
            if !value.is_finite() || value <= 0.0 {
                return Err(TciError::Validation(format!(
                    "{} must be positive (got {})",
                    name, value
                )));
            }
        }
        Ok(self)
    }

    pub fn rate_constants(&self) -> RateConstants {
        RateConstants {
            k10: self.cl / self.v1,
            k12: self.q2 / self.v1,
            k13: self.q3 / self.v1,
            k21: self.q2 / self.v2,
            k31: self.q3 / self.v3,
        }
    }
}

/// First-order transfer rates (1/min).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateConstants {
    pub k10: f64,
    pub k12: f64,
    pub k13: f64,
    pub k21: f64,
    pub k31: f64,
}

impl RateConstants {
    /// Coefficients `(a2, a1, a0)` of `λ³ - a2·λ² + a1·λ - a0`, whose roots
    /// are the disposition exponents.
    pub fn characteristic_polynomial(&self) -> (f64, f64, f64) {
        let a2 = self.k10 + self.k12 + self.k13 + self.k21 + self.k31;
        let a1 = self.k10 * self.k21
            + self.k10 * self.k31
            + self.k12 * self.k31
            + self.k13 * self.k21
            + self.k21 * self.k31;
        let a0 = self.k10 * self.k21 * self.k31;
        (a2, a1, a0)
    }

    /// Mass derivatives for the three compartments, `infusion` in mg/min.
    pub fn derivatives(&self, masses: &[f64; 3], infusion: f64) -> [f64; 3] {
        let [a1, a2, a3] = *masses;
        [
            infusion - (self.k10 + self.k12 + self.k13) * a1 + self.k21 * a2 + self.k31 * a3,
            self.k12 * a1 - self.k21 * a2,
            self.k13 * a1 - self.k31 * a3,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> PkParameters {
        PkParameters {
            ideal_body_weight: 66.0,
            adjusted_body_weight: 67.6,
            v1: 10.0,
            v2: 5.0,
            v3: 3.0,
            cl: 2.0,
            q2: 1.0,
            q3: 0.5,
        }
    }

    #[test]
    fn test_rate_constants() {
        let k = params().rate_constants();
        assert_relative_eq!(k.k10, 0.2, epsilon = 1e-12);
        assert_relative_eq!(k.k12, 0.1, epsilon = 1e-12);
        assert_relative_eq!(k.k13, 0.05, epsilon = 1e-12);
        assert_relative_eq!(k.k21, 0.2, epsilon = 1e-12);
        assert_relative_eq!(k.k31, 0.5 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_checked_rejects_non_positive() {
        let mut p = params();
        p.v3 = -0.1;
        assert!(matches!(p.checked(), Err(TciError::Validation(_))));
        assert!(params().checked().is_ok());
    }

    #[test]
    fn test_derivatives_conserve_mass_without_elimination() {
        let mut k = params().rate_constants();
        k.k10 = 0.0;
        let d = k.derivatives(&[5.0, 2.0, 1.0], 0.0);
        assert_relative_eq!(d.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rate_constants_are_stable_across_calls() {
        let p = params();
        assert_eq!(p.rate_constants(), p.rate_constants());
    }
}
