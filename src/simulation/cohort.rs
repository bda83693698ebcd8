//! Virtual-patient batteries comparing the exact and regression ke0.

use crate::diagnostics::DiagnosticSink;
use crate::error::{TciError, TciResult};
use crate::ke0::{Ke0Bounds, Ke0Method, Ke0Solver};
use crate::models::{MasuiModel, PlasmaCoefficients, PopulationModel};
use crate::patient::{AsaClass, PatientParameters, Sex, AGE_RANGE, HEIGHT_RANGE, WEIGHT_RANGE};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// Sampling box for virtual patients. Defaults to realistic adults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortRanges {
    pub age: (f64, f64),
    pub weight: (f64, f64),
    pub height: (f64, f64),
    pub female_fraction: f64,
    pub asa_high_fraction: f64,
}

impl Default for CohortRanges {
    fn default() -> Self {
        Self {
            age: (20.0, 85.0),
            weight: (45.0, 110.0),
            height: (150.0, 195.0),
            female_fraction: 0.5,
            asa_high_fraction: 0.3,
        }
    }
}

impl CohortRanges {
    pub fn full() -> Self {
        Self {
            age: AGE_RANGE,
            weight: WEIGHT_RANGE,
            height: HEIGHT_RANGE,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> TciResult<()> {
        let within = |(lo, hi): (f64, f64), (min, max): (f64, f64)| lo <= hi && lo >= min && hi <= max;
        if !within(self.age, AGE_RANGE) || !within(self.weight, WEIGHT_RANGE) || !within(self.height, HEIGHT_RANGE) {
            return Err(TciError::Validation(
                "cohort ranges must lie inside the accepted demographic ranges".to_string(),
            ));
        }
        for p in [self.female_fraction, self.asa_high_fraction] {
            if !(0.0..=1.0).contains(&p) {
                return Err(TciError::Validation(format!(
                    "fractions must be within 0-1 (got {})",
                    p
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortRecord {
    pub id: usize,
    pub patient: PatientParameters,
    pub exact: Option<f64>,
    pub regression: f64,
    pub selected: Option<f64>,
    pub method: Ke0Method,
    pub disagreement: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortSummary {
    pub n_patients: usize,
    pub exact_available: usize,
    pub regression_fallbacks: usize,
    pub safety_failures: usize,
    pub mean_disagreement: f64,
    pub max_disagreement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortReport {
    pub seed: u64,
    pub records: Vec<CohortRecord>,
    pub summary: CohortSummary,
}

pub struct CohortSampler {
    rng: StdRng,
    seed: u64,
    age: Uniform<f64>,
    weight: Uniform<f64>,
    height: Uniform<f64>,
    female: Bernoulli,
    asa_high: Bernoulli,
}

impl CohortSampler {
    pub fn new(ranges: CohortRanges, seed: Option<u64>) -> TciResult<Self> {
        ranges.validate()?;
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        let bernoulli = |p: f64| {
            Bernoulli::new(p).map_err(|e| TciError::Validation(format!("invalid fraction {}: {}", p, e)))
        };
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            age: Uniform::new_inclusive(ranges.age.0, ranges.age.1),
            weight: Uniform::new_inclusive(ranges.weight.0, ranges.weight.1),
            height: Uniform::new_inclusive(ranges.height.0, ranges.height.1),
            female: bernoulli(ranges.female_fraction)?,
            asa_high: bernoulli(ranges.asa_high_fraction)?,
        })
    }

    pub fn sample(&mut self) -> TciResult<PatientParameters> {
        let sex = if self.female.sample(&mut self.rng) {
            Sex::Female
        } else {
            Sex::Male
        };
        let asa = if self.asa_high.sample(&mut self.rng) {
            AsaClass::ThreeToFour
        } else {
            AsaClass::OneToTwo
        };
        PatientParameters::new(
            self.age.sample(&mut self.rng),
            self.weight.sample(&mut self.rng),
            self.height.sample(&mut self.rng),
            sex,
            asa,
        )
    }

    /// Solves ke0 both ways for `n` sampled patients. Patients whose
    /// model parameters are invalid are skipped and resampled.
    pub fn run(&mut self, n: usize, bounds: Ke0Bounds, sink: &dyn DiagnosticSink) -> TciResult<CohortReport> {
        info!("Evaluating ke0 for a cohort of {} patients (seed {})", n, self.seed);
        let solver = Ke0Solver::new(bounds);
        let model = MasuiModel;
        let mut records = Vec::with_capacity(n);
        let mut attempts = 0;

        while records.len() < n {
            attempts += 1;
            if attempts > n.saturating_mul(10).max(100) {
                return Err(TciError::Validation(
                    "cohort ranges produce too few valid patients".to_string(),
                ));
            }
            let patient = self.sample()?;
            let pk = match model.pk_parameters(&patient) {
                Ok(pk) => pk,
                Err(err) => {
                    warn!("Skipping sampled patient {:?}: {}", patient, err);
                    continue;
                }
            };
            let plasma = PlasmaCoefficients::new(&pk, &pk.rate_constants());
            let id = records.len() + 1;
            let record = match solver.select(&model, &patient, plasma.as_ref(), sink) {
                Ok(selection) => CohortRecord {
                    id,
                    patient,
                    exact: selection.exact.map(|e| e.ke0),
                    regression: selection.regression,
                    selected: Some(selection.ke0),
                    method: selection.method,
                    disagreement: selection.disagreement(),
                },
                Err(TciError::Safety(_)) => {
                    let exact = plasma
                        .as_ref()
                        .ok()
                        .and_then(|p| solver.solve_exact(Ok(p), model.time_to_peak_effect(), sink).ok())
                        .map(|e| e.ke0);
                    let regression = crate::ke0::regression::ke0(&patient);
                    CohortRecord {
                        id,
                        patient,
                        exact,
                        regression,
                        selected: None,
                        method: Ke0Method::Unavailable,
                        disagreement: exact.map(|e| (regression - e).abs() / e),
                    }
                }
                Err(err) => return Err(err),
            };
            records.push(record);
        }

        let summary = summarize(&records);
        info!(
            "Cohort: {} exact, {} regression fallbacks, {} safety failures, max disagreement {:.2}%",
            summary.exact_available,
            summary.regression_fallbacks,
            summary.safety_failures,
            summary.max_disagreement * 100.0
        );
        Ok(CohortReport {
            seed: self.seed,
            records,
            summary,
        })
    }
}

fn summarize(records: &[CohortRecord]) -> CohortSummary {
    let disagreements: Vec<f64> = records.iter().filter_map(|r| r.disagreement).collect();
    let mean_disagreement = if disagreements.is_empty() {
        0.0
    } else {
        disagreements.iter().sum::<f64>() / disagreements.len() as f64
    };
    CohortSummary {
        n_patients: records.len(),
        exact_available: records.iter().filter(|r| r.exact.is_some()).count(),
        regression_fallbacks: records
            .iter()
            .filter(|r| matches!(r.method, Ke0Method::Regression(_)))
            .count(),
        safety_failures: records.iter().filter(|r| r.selected.is_none()).count(),
        mean_disagreement,
        max_disagreement: disagreements.iter().fold(0.0, |m: f64, d| m.max(*d)),
    }
}
