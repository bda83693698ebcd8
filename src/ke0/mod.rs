//! Effect-site equilibration constant.
//!
//! Two independent estimates are produced: an exact solve of the
//! time-to-peak condition ([`exact`]) and a demographic regression
//! ([`regression`]). [`reconcile`] picks the authoritative value.

pub mod exact;
pub mod regression;
pub mod roots;

use crate::diagnostics::{Category, Diagnostic, DiagnosticSink};
use crate::error::{TciError, TciResult};
use crate::models::{CubicDefect, PlasmaCoefficients, PopulationModel};
use crate::patient::{PatientKey, PatientParameters};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use exact::{BracketStrategy, ExactSolution, PeakCondition, STRATEGY_CHAIN};
pub use roots::RootTolerance;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RootFindingFailure {
    #[error("invalid bracket [{lo}, {hi}]")]
    InvalidBracket { lo: f64, hi: f64 },
    #[error("no sign change over [{lo}, {hi}]")]
    NoSignChange { lo: f64, hi: f64 },
    #[error("non-finite function value at {at}")]
    NonFinite { at: f64 },
    #[error("no convergence after {iterations} iterations (last {last})")]
    MaxIterations { iterations: usize, last: f64 },
    #[error("root {value} outside accepted band [{min}, {max}]")]
    OutOfBounds { value: f64, min: f64, max: f64 },
    #[error("plasma model defect: {0}")]
    Model(#[from] CubicDefect),
    #[error("all {} bracketing strategies failed", .0.len())]
    Exhausted(Vec<(BracketStrategy, RootFindingFailure)>),
}

/// Accepted ke0 band (1/min), inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ke0Bounds {
    pub min: f64,
    pub max: f64,
}

impl Default for Ke0Bounds {
    fn default() -> Self {
        Self { min: 0.05, max: 0.5 }
    }
}

impl Ke0Bounds {
    pub fn contains(&self, ke0: f64) -> bool {
        ke0.is_finite() && ke0 >= self.min && ke0 <= self.max
    }

    pub fn validate(&self) -> TciResult<()> {
        if !(self.min > 0.0 && self.max > self.min && self.max.is_finite()) {
            return Err(TciError::Validation(format!(
                "ke0 bounds must satisfy 0 < min < max (got [{}, {}])",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Outcome of one estimation stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Ke0Method {
    Exact(f64),
    Regression(f64),
    Unavailable,
}

impl Ke0Method {
    pub fn value(&self) -> Option<f64> {
        match *self {
            Ke0Method::Exact(v) | Ke0Method::Regression(v) => Some(v),
            Ke0Method::Unavailable => None,
        }
    }
}

/// Picks the exact estimate when it is inside `bounds`, else the regression
/// estimate when it is, else reports a safety error.
pub fn reconcile(exact: Ke0Method, regression: Ke0Method, bounds: &Ke0Bounds) -> TciResult<Ke0Method> {
    for candidate in [exact, regression] {
        if let Some(v) = candidate.value() {
            if bounds.contains(v) {
                return Ok(candidate);
            }
        }
    }
    Err(TciError::Safety(format!(
        "no ke0 estimate within [{}, {}] /min (exact: {:?}, regression: {:?})",
        bounds.min,
        bounds.max,
        exact.value(),
        regression.value()
    )))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ke0Selection {
    pub ke0: f64,
    pub method: Ke0Method,
    pub exact: Option<ExactSolution>,
    pub regression: f64,
}

impl Ke0Selection {
    pub fn is_exact(&self) -> bool {
        matches!(self.method, Ke0Method::Exact(_))
    }

    /// Relative disagreement of the regression estimate from the exact one.
    pub fn disagreement(&self) -> Option<f64> {
        self.exact
            .map(|e| (self.regression - e.ke0).abs() / e.ke0)
    }
}

/// Memoised selections keyed by demographics.
#[derive(Debug, Default, Clone)]
pub struct Ke0Cache {
    entries: HashMap<PatientKey, Ke0Selection>,
}

impl Ke0Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, patient: &PatientParameters) -> Option<&Ke0Selection> {
        self.entries.get(&patient.key())
    }

    pub fn insert(&mut self, patient: &PatientParameters, selection: Ke0Selection) {
        self.entries.insert(patient.key(), selection);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Ke0Solver {
    pub bounds: Ke0Bounds,
    pub tolerance: RootTolerance,
    pub strategies: Vec<BracketStrategy>,
}

impl Default for Ke0Solver {
    fn default() -> Self {
        Self {
            bounds: Ke0Bounds::default(),
            tolerance: RootTolerance::default(),
            strategies: STRATEGY_CHAIN.to_vec(),
        }
    }
}

impl Ke0Solver {
    pub fn new(bounds: Ke0Bounds) -> Self {
        Self {
            bounds,
            ..Self::default()
        }
    }

    /// Exact stage; `plasma` is the result of the disposition solve.
    pub fn solve_exact(
        &self,
        plasma: Result<&PlasmaCoefficients, &CubicDefect>,
        t_peak: f64,
        sink: &dyn DiagnosticSink,
    ) -> Result<ExactSolution, RootFindingFailure> {
        let plasma = plasma.map_err(|defect| RootFindingFailure::Model(defect.clone()))?;
        let condition = PeakCondition::new(plasma, t_peak);
        exact::solve_with_chain(&condition, &self.strategies, &self.bounds, &self.tolerance, sink)
    }

    pub fn select(
        &self,
        model: &dyn PopulationModel,
        patient: &PatientParameters,
        plasma: Result<&PlasmaCoefficients, &CubicDefect>,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<Ke0Selection> {
        let exact = match self.solve_exact(plasma, model.time_to_peak_effect(), sink) {
            Ok(solution) => Some(solution),
            Err(failure) => {
                sink.emit(Diagnostic::new(
                    Category::Numeric,
                    "ke0",
                    format!("exact ke0 unavailable: {}", failure),
                ));
                None
            }
        };

        let regression = regression::ke0(patient);
        let exact_method = exact.map_or(Ke0Method::Unavailable, |e| Ke0Method::Exact(e.ke0));
        let regression_method = if regression.is_finite() && regression > 0.0 {
            Ke0Method::Regression(regression)
        } else {
            Ke0Method::Unavailable
        };

        let method = match reconcile(exact_method, regression_method, &self.bounds) {
            Ok(method) => method,
            Err(err) => {
                sink.emit(
                    Diagnostic::new(Category::Safety, "ke0", err.to_string())
                        .with("regression", regression)
                        .with("min", self.bounds.min)
                        .with("max", self.bounds.max),
                );
                return Err(err);
            }
        };

        if let Ke0Method::Regression(v) = method {
            sink.emit(
                Diagnostic::new(Category::Numeric, "ke0", "fell back to regression ke0")
                    .with("ke0", v)
                    .resolved(true),
            );
        }

        let ke0 = method.value().unwrap_or(regression);
        debug!("ke0 = {:.5} /min via {:?}", ke0, method);
        Ok(Ke0Selection {
            ke0,
            method,
            exact,
            regression,
        })
    }

    /// [`Ke0Solver::select`] through `cache`.
    pub fn select_cached(
        &self,
        cache: &mut Ke0Cache,
        model: &dyn PopulationModel,
        patient: &PatientParameters,
        plasma: Result<&PlasmaCoefficients, &CubicDefect>,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<Ke0Selection> {
        if let Some(hit) = cache.get(patient) {
            return Ok(hit.clone());
        }
        let selection = self.select(model, patient, plasma, sink)?;
        cache.insert(patient, selection.clone());
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{MemorySink, NullSink};
    use crate::models::MasuiModel;
    use crate::patient::{AsaClass, Sex};
    use approx::assert_relative_eq;

    fn plasma_for(patient: &PatientParameters) -> Result<PlasmaCoefficients, CubicDefect> {
        let pk = MasuiModel.pk_parameters(patient).unwrap();
        PlasmaCoefficients::new(&pk, &pk.rate_constants())
    }

    fn reference_patients() -> Vec<PatientParameters> {
        [
            (45.0, 70.0, 170.0, Sex::Male, AsaClass::OneToTwo),
            (54.0, 67.0, 165.0, Sex::Male, AsaClass::OneToTwo),
            (30.0, 55.0, 160.0, Sex::Female, AsaClass::OneToTwo),
            (80.0, 60.0, 155.0, Sex::Female, AsaClass::ThreeToFour),
            (20.0, 120.0, 190.0, Sex::Male, AsaClass::OneToTwo),
            (90.0, 40.0, 145.0, Sex::Female, AsaClass::ThreeToFour),
            (65.0, 95.0, 178.0, Sex::Male, AsaClass::ThreeToFour),
        ]
        .into_iter()
        .map(|(a, w, h, s, r)| PatientParameters::new(a, w, h, s, r).unwrap())
        .collect()
    }

    #[test]
    fn test_reconcile_prefers_exact() {
        let bounds = Ke0Bounds::default();
        let m = reconcile(Ke0Method::Exact(0.22), Ke0Method::Regression(0.21), &bounds).unwrap();
        assert_eq!(m, Ke0Method::Exact(0.22));
    }

    #[test]
    fn test_reconcile_falls_back_to_regression() {
        let bounds = Ke0Bounds::default();
        let m = reconcile(Ke0Method::Unavailable, Ke0Method::Regression(0.21), &bounds).unwrap();
        assert_eq!(m, Ke0Method::Regression(0.21));
        let m = reconcile(Ke0Method::Exact(0.9), Ke0Method::Regression(0.21), &bounds).unwrap();
        assert_eq!(m, Ke0Method::Regression(0.21));
    }

    #[test]
    fn test_reconcile_safety_error() {
        let bounds = Ke0Bounds::default();
        let err = reconcile(Ke0Method::Unavailable, Ke0Method::Regression(0.9), &bounds);
        assert!(matches!(err, Err(TciError::Safety(_))));
        let err = reconcile(Ke0Method::Unavailable, Ke0Method::Unavailable, &bounds);
        assert!(matches!(err, Err(TciError::Safety(_))));
    }

    #[test]
    fn test_exact_and_regression_agree_for_reference_patients() {
        let solver = Ke0Solver::default();
        for patient in reference_patients() {
            let plasma = plasma_for(&patient);
            let selection = solver
                .select(&MasuiModel, &patient, plasma.as_ref(), &NullSink)
                .unwrap();
            assert!(selection.is_exact(), "{:?}", patient);
            let exact = selection.exact.unwrap().ke0;
            assert!(Ke0Bounds::default().contains(exact));
            assert!(Ke0Bounds::default().contains(selection.regression));
            assert!(
                selection.disagreement().unwrap() <= 0.15,
                "{:?}: exact {} regression {}",
                patient,
                exact,
                selection.regression
            );
        }
    }

    #[test]
    fn test_model_defect_falls_back_to_regression() {
        let patient = reference_patients()[0];
        let sink = MemorySink::new();
        let defect = CubicDefect::ComplexRoots(-1.0);
        let selection = Ke0Solver::default()
            .select(&MasuiModel, &patient, Err(&defect), &sink)
            .unwrap();
        assert_eq!(selection.method, Ke0Method::Regression(selection.regression));
        assert!(sink.contains("ke0", "exact ke0 unavailable"));
        assert!(sink
            .records()
            .iter()
            .any(|d| d.message.contains("fell back to regression") && d.resolved));
    }

    #[test]
    fn test_exact_success_emits_nothing() {
        let patient = reference_patients()[0];
        let sink = MemorySink::new();
        let plasma = plasma_for(&patient);
        Ke0Solver::default()
            .select(&MasuiModel, &patient, plasma.as_ref(), &sink)
            .unwrap();
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_narrow_band_raises_safety_error() {
        let patient = reference_patients()[0];
        let sink = MemorySink::new();
        let plasma = plasma_for(&patient);
        let solver = Ke0Solver::new(Ke0Bounds { min: 0.4, max: 0.5 });
        let err = solver.select(&MasuiModel, &patient, plasma.as_ref(), &sink);
        assert!(matches!(err, Err(TciError::Safety(_))));
        assert!(sink.records().iter().any(|d| d.category == Category::Safety));
    }

    #[test]
    fn test_cache_returns_identical_selection() {
        let patient = reference_patients()[2];
        let plasma = plasma_for(&patient);
        let solver = Ke0Solver::default();
        let mut cache = Ke0Cache::new();
        let first = solver
            .select_cached(&mut cache, &MasuiModel, &patient, plasma.as_ref(), &NullSink)
            .unwrap();
        let sink = MemorySink::new();
        let defect = CubicDefect::ComplexRoots(-1.0);
        // A hit never re-solves, so the defect passed here is never looked at.
        let second = solver
            .select_cached(&mut cache, &MasuiModel, &patient, Err(&defect), &sink)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert!(sink.records().is_empty());
        assert_relative_eq!(first.ke0, 0.1908, epsilon = 1e-3);
    }
}
