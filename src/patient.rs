use serde::{Deserialize, Serialize};

use crate::error::{TciError, TciResult};

pub const AGE_RANGE: (f64, f64) = (18.0, 100.0);
pub const WEIGHT_RANGE: (f64, f64) = (30.0, 200.0);
pub const HEIGHT_RANGE: (f64, f64) = (140.0, 220.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Model covariate coding: 0 = male, 1 = female.
    pub fn code(self) -> f64 {
        match self {
            Sex::Male => 0.0,
            Sex::Female => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsaClass {
    #[serde(rename = "I-II")]
    OneToTwo,
    #[serde(rename = "III-IV")]
    ThreeToFour,
}

impl AsaClass {
    /// Model covariate coding: 0 = ASA I-II, 1 = ASA III-IV.
    pub fn code(self) -> f64 {
        match self {
            AsaClass::OneToTwo => 0.0,
            AsaClass::ThreeToFour => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPatient")]
pub struct PatientParameters {
    age: f64,
    weight: f64,
    height: f64,
    sex: Sex,
    asa: AsaClass,
}

#[derive(Deserialize)]
struct RawPatient {
    age: f64,
    weight: f64,
    height: f64,
    sex: Sex,
    asa: AsaClass,
}

impl TryFrom<RawPatient> for PatientParameters {
    type Error = TciError;

    fn try_from(raw: RawPatient) -> TciResult<Self> {
        Self::new(raw.age, raw.weight, raw.height, raw.sex, raw.asa)
    }
}

impl PatientParameters {
    pub fn new(age: f64, weight: f64, height: f64, sex: Sex, asa: AsaClass) -> TciResult<Self> {
        check_range("age", age, AGE_RANGE, "years")?;
        check_range("weight", weight, WEIGHT_RANGE, "kg")?;
        check_range("height", height, HEIGHT_RANGE, "cm")?;
        Ok(Self {
            age,
            weight,
            height,
            sex,
            asa,
        })
    }

    pub fn age(&self) -> f64 {
        self.age
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn sex(&self) -> Sex {
        self.sex
    }

    pub fn asa(&self) -> AsaClass {
        self.asa
    }

    pub fn key(&self) -> PatientKey {
        PatientKey {
            age: self.age.to_bits(),
            weight: self.weight.to_bits(),
            height: self.height.to_bits(),
            sex: self.sex,
            asa: self.asa,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatientKey {
    age: u64,
    weight: u64,
    height: u64,
    sex: Sex,
    asa: AsaClass,
}

fn check_range(name: &str, value: f64, (lo, hi): (f64, f64), unit: &str) -> TciResult<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(TciError::Validation(format!(
            "{} must be within {}-{} {} (got {})",
            name, lo, hi, unit, value
        )));
    }
    Ok(())
}
