//! Demographic regression for ke0, independent of the compartment solve.

use crate::patient::PatientParameters;

const AGE_CENTER: f64 = 55.0;
const AGE_SCALE: f64 = 20.0;
const WEIGHT_CENTER: f64 = 70.0;
const WEIGHT_SCALE: f64 = 20.0;
const HEIGHT_CENTER: f64 = 165.0;
const HEIGHT_SCALE: f64 = 15.0;

/// Coefficients of `ln ke0`, in the term order of [`terms`].
const COEFFICIENTS: [f64; 21] = [
    -1.524, -0.002928, 0.03515, 0.03397, -0.09732, 0.1094, 0.0006869, -0.002871, -0.001602,
    0.0003675, 0.0004226, -0.002583, -0.0002228, 0.00203, 0.002326, -7.973e-06, -0.001422,
    -0.001596, -0.001542, -0.0002027, 0.0002443,
];

fn terms(patient: &PatientParameters) -> [f64; 21] {
    let a = (patient.age() - AGE_CENTER) / AGE_SCALE;
    let x = (patient.weight() - WEIGHT_CENTER) / WEIGHT_SCALE;
    let y = (patient.height() - HEIGHT_CENTER) / HEIGHT_SCALE;
    let s = patient.sex().code();
    let r = patient.asa().code();
    [
        1.0,
        a,
        x,
        y,
        s,
        r,
        a * a,
        x * x,
        y * y,
        a * x,
        a * y,
        x * y,
        a * s,
        x * s,
        y * s,
        a * r,
        x * r,
        y * r,
        s * r,
        a * a * a,
        x * x * x,
    ]
}

/// Approximate ke0 (1/min) straight from demographics.
pub fn ke0(patient: &PatientParameters) -> f64 {
    terms(patient)
        .iter()
        .zip(COEFFICIENTS)
        .map(|(t, c)| t * c)
        .sum::<f64>()
        .exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Sex};
    use approx::assert_relative_eq;

    #[test]
    fn test_centre_patient_is_intercept() {
        let p = PatientParameters::new(55.0, 70.0, 165.0, Sex::Male, AsaClass::OneToTwo).unwrap();
        assert_relative_eq!(ke0(&p), (-1.524_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_covariate_directions() {
        let base = PatientParameters::new(55.0, 70.0, 165.0, Sex::Male, AsaClass::OneToTwo).unwrap();
        let female = PatientParameters::new(55.0, 70.0, 165.0, Sex::Female, AsaClass::OneToTwo).unwrap();
        let asa = PatientParameters::new(55.0, 70.0, 165.0, Sex::Male, AsaClass::ThreeToFour).unwrap();
        assert!(ke0(&female) < ke0(&base));
        assert!(ke0(&asa) > ke0(&base));
    }
}
