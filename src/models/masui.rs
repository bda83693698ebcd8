//! Masui remimazolam population model.

use super::{PkParameters, PopulationModel};
use crate::error::TciResult;
use crate::patient::PatientParameters;

const REFERENCE_WEIGHT: f64 = 67.3;
const REFERENCE_AGE: f64 = 54.0;
const ALLOMETRIC_EXPONENT: f64 = 0.75;

const THETA_V1: f64 = 3.57;
const THETA_V2: f64 = 11.3;
const THETA_V3: f64 = 27.2;
const THETA_CL: f64 = 1.03;
const THETA_Q2: f64 = 1.10;
const THETA_Q3: f64 = 0.401;
const THETA_V3_AGE: f64 = 0.308;
const THETA_CL_SEX: f64 = 0.146;
const THETA_CL_ASA: f64 = -0.184;

const TIME_TO_PEAK_EFFECT: f64 = 2.6;

#[derive(Debug, Clone, Copy, Default)]
pub struct MasuiModel;

impl MasuiModel {
    pub fn ideal_body_weight(patient: &PatientParameters) -> f64 {
        45.4 + 0.89 * (patient.height() - 152.4) + 4.5 * (1.0 - patient.sex().code())
    }

    pub fn adjusted_body_weight(patient: &PatientParameters) -> f64 {
        let ibw = Self::ideal_body_weight(patient);
        ibw + 0.4 * (patient.weight() - ibw)
    }
}

impl PopulationModel for MasuiModel {
    fn name(&self) -> &'static str {
        "masui"
    }

    fn pk_parameters(&self, patient: &PatientParameters) -> TciResult<PkParameters> {
        let ibw = Self::ideal_body_weight(patient);
        let abw = Self::adjusted_body_weight(patient);
        let size = abw / REFERENCE_WEIGHT;
        let flow = size.powf(ALLOMETRIC_EXPONENT);

        PkParameters {
            ideal_body_weight: ibw,
            adjusted_body_weight: abw,
            v1: THETA_V1 * size,
            v2: THETA_V2 * size,
            v3: THETA_V3 * size + THETA_V3_AGE * (patient.age() - REFERENCE_AGE),
            cl: (THETA_CL + THETA_CL_SEX * patient.sex().code() + THETA_CL_ASA * patient.asa().code())
                * flow,
            q2: THETA_Q2 * flow,
            q3: THETA_Q3 * flow,
        }
        .checked()
    }

    fn time_to_peak_effect(&self) -> f64 {
        TIME_TO_PEAK_EFFECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Sex, AGE_RANGE, HEIGHT_RANGE, WEIGHT_RANGE};
    use approx::assert_relative_eq;

    #[test]
    fn test_reference_patient() {
        let patient = PatientParameters::new(45.0, 70.0, 170.0, Sex::Male, AsaClass::OneToTwo).unwrap();
        let pk = MasuiModel.pk_parameters(&patient).unwrap();

        assert_relative_eq!(pk.ideal_body_weight, 65.564, epsilon = 1e-9);
        assert_relative_eq!(pk.adjusted_body_weight, 67.3384, epsilon = 1e-9);
        assert_relative_eq!(pk.v1, 3.57 * 67.3384 / 67.3, epsilon = 1e-9);
        assert_relative_eq!(pk.v3, 27.2 * 67.3384 / 67.3 - 0.308 * 9.0, epsilon = 1e-9);
        assert_relative_eq!(pk.cl, 1.03 * (67.3384_f64 / 67.3).powf(0.75), epsilon = 1e-9);
    }

    #[test]
    fn test_covariate_effects_on_clearance() {
        let male = PatientParameters::new(60.0, 70.0, 170.0, Sex::Male, AsaClass::OneToTwo).unwrap();
        let sick = PatientParameters::new(60.0, 70.0, 170.0, Sex::Male, AsaClass::ThreeToFour).unwrap();
        let cl_male = MasuiModel.pk_parameters(&male).unwrap().cl;
        let cl_sick = MasuiModel.pk_parameters(&sick).unwrap().cl;
        assert_relative_eq!(cl_male - cl_sick, 0.184, epsilon = 1e-9);
    }

    #[test]
    fn test_all_parameters_positive_over_valid_domain() {
        let ages = [AGE_RANGE.0, 40.0, 70.0, AGE_RANGE.1];
        let weights = [WEIGHT_RANGE.0, 55.0, 90.0, 140.0, WEIGHT_RANGE.1];
        let heights = [HEIGHT_RANGE.0, 160.0, 185.0, HEIGHT_RANGE.1];
        for &age in &ages {
            for &weight in &weights {
                for &height in &heights {
                    for sex in [Sex::Male, Sex::Female] {
                        for asa in [AsaClass::OneToTwo, AsaClass::ThreeToFour] {
                            let patient = PatientParameters::new(age, weight, height, sex, asa).unwrap();
                            let pk = MasuiModel.pk_parameters(&patient).unwrap();
                            for v in [pk.v1, pk.v2, pk.v3, pk.cl, pk.q2, pk.q3] {
                                assert!(v > 0.0, "{:?} -> {:?}", patient, pk);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let patient = PatientParameters::new(33.0, 82.5, 181.0, Sex::Female, AsaClass::OneToTwo).unwrap();
        let first = MasuiModel.pk_parameters(&patient).unwrap();
        for _ in 0..10 {
            assert_eq!(MasuiModel.pk_parameters(&patient).unwrap(), first);
        }
    }
}
