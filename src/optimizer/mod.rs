//! Bolus / infusion search for a target effect-site concentration.
//!
//! Every candidate is scored by a full forward simulation. The rate
//! search window starts from the steady-state infusion for the target and
//! doubles, up to `max_rate`, while the target lies above it.

pub mod stepdown;

use crate::diagnostics::{rejected, Category, Diagnostic, DiagnosticSink};
use crate::dosing::{DoseEvent, DosingSchedule};
use crate::error::{TciError, TciResult};
use crate::simulation::Session;
use crate::units;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub use stepdown::{AdjustmentEvent, ProtocolState, StepDownProtocol, StepDownResult, StepDownSettings};

/// Bisection stops once the relative error is below this.
const BISECTION_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub coarse_points: usize,
    pub refine_iterations: usize,
    /// Relative error accepted as converged.
    pub tolerance: f64,
    /// Lowest rate searched (mg/kg/h).
    pub min_rate: f64,
    /// Upper search bound as a multiple of the steady-state rate.
    pub upper_multiplier: f64,
    /// Hard ceiling on the searched rate (mg/kg/h).
    pub max_rate: f64,
    /// Simulation grid spacing (min).
    pub resolution: f64,
    pub max_evaluations: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            coarse_points: 21,
            refine_iterations: 40,
            tolerance: 0.10,
            min_rate: 0.01,
            upper_multiplier: 4.0,
            max_rate: 30.0,
            resolution: 0.1,
            max_evaluations: 500,
        }
    }
}

impl OptimizerSettings {
    pub fn validate(&self) -> TciResult<()> {
        if self.coarse_points < 2 {
            return Err(TciError::Validation("coarse_points must be at least 2".to_string()));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(TciError::Validation("tolerance must be positive".to_string()));
        }
        if !(self.min_rate > 0.0 && self.max_rate > self.min_rate && self.max_rate.is_finite()) {
            return Err(TciError::Validation(format!(
                "rate limits must satisfy 0 < min_rate < max_rate (got {} and {})",
                self.min_rate, self.max_rate
            )));
        }
        if !(self.upper_multiplier > 0.0 && self.upper_multiplier.is_finite()) {
            return Err(TciError::Validation("upper_multiplier must be positive".to_string()));
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(TciError::Validation("resolution must be positive".to_string()));
        }
        if self.max_evaluations == 0 {
            return Err(TciError::Validation("max_evaluations must be positive".to_string()));
        }
        Ok(())
    }
}

/// Reach `target_ce` (µg/mL) at `target_time` (min) with a bolus at t=0
/// taken from `boluses` (mg) plus a constant infusion from t=0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub target_ce: f64,
    pub target_time: f64,
    #[serde(default = "default_boluses")]
    pub boluses: Vec<f64>,
}

fn default_boluses() -> Vec<f64> {
    vec![0.0]
}

impl OptimizationRequest {
    pub fn new(target_ce: f64, target_time: f64) -> Self {
        Self {
            target_ce,
            target_time,
            boluses: default_boluses(),
        }
    }

    pub fn with_boluses(mut self, boluses: Vec<f64>) -> Self {
        self.boluses = boluses;
        self
    }

    fn validate(&self) -> TciResult<()> {
        if !(self.target_ce >= 0.0 && self.target_ce.is_finite()) {
            return Err(TciError::Validation(format!(
                "target concentration must be non-negative (got {})",
                self.target_ce
            )));
        }
        if !(self.target_time >= 0.0 && self.target_time.is_finite()) {
            return Err(TciError::Validation(format!(
                "target time must be non-negative (got {})",
                self.target_time
            )));
        }
        if self.boluses.is_empty() || self.boluses.iter().any(|b| !(*b >= 0.0 && b.is_finite())) {
            return Err(TciError::Validation(
                "bolus candidates must be a non-empty list of non-negative doses".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimizationResult {
    pub bolus_mg: f64,
    pub rate_mg_kg_h: f64,
    pub predicted_ce: f64,
    pub absolute_error: f64,
    pub relative_error: f64,
    pub converged: bool,
    pub evaluations: usize,
    /// Rate window searched (mg/kg/h) after any widening; `None` when no search ran.
    pub rate_bounds: Option<(f64, f64)>,
}

impl OptimizationResult {
    pub fn schedule(&self) -> TciResult<DosingSchedule> {
        DosingSchedule::new(vec![DoseEvent::bolus_and_infusion(
            0.0,
            self.bolus_mg,
            self.rate_mg_kg_h,
        )])
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    bolus: f64,
    rate: f64,
    ce: f64,
    error: f64,
}

impl Candidate {
    /// Smaller error wins; ties go to the smaller rate, then the smaller bolus.
    fn cmp_quality(&self, other: &Candidate) -> Ordering {
        self.error
            .total_cmp(&other.error)
            .then(self.rate.total_cmp(&other.rate))
            .then(self.bolus.total_cmp(&other.bolus))
    }
}

/// Scores candidates and keeps the evaluation count.
struct Evaluator<'a> {
    session: &'a Session,
    request: &'a OptimizationRequest,
    resolution: f64,
    max_evaluations: usize,
    evaluations: usize,
    sink: &'a dyn DiagnosticSink,
}

impl Evaluator<'_> {
    fn exhausted(&self) -> bool {
        self.evaluations >= self.max_evaluations
    }

    fn evaluate(&mut self, bolus: f64, rate: f64) -> TciResult<Candidate> {
        self.evaluations += 1;
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus_and_infusion(0.0, bolus, rate)])?;
        let ce = self
            .session
            .predict_ce(&schedule, self.request.target_time, self.resolution, self.sink)?;
        Ok(Candidate {
            bolus,
            rate,
            ce,
            error: (ce - self.request.target_ce).abs(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DoseOptimizer {
    settings: OptimizerSettings,
}

impl DoseOptimizer {
    pub fn new(settings: OptimizerSettings) -> TciResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Search window (mg/kg/h) around the steady-state rate for `target_ce`.
    pub fn rate_bounds(&self, session: &Session, target_ce: f64) -> (f64, f64) {
        let steady = units::mg_min_to_mg_kg_h(
            units::steady_state_infusion_mg_min(target_ce, session.pk().cl),
            session.patient().weight(),
        );
        let lower = self.settings.min_rate;
        let upper = (steady * self.settings.upper_multiplier)
            .min(self.settings.max_rate)
            .max(lower * 2.0);
        (lower, upper)
    }

    pub fn optimize(
        &self,
        session: &Session,
        request: &OptimizationRequest,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<OptimizationResult> {
        request.validate().map_err(|e| rejected(sink, "optimizer", e))?;

        if request.target_ce == 0.0 {
            debug!("zero target: no dosing needed");
            return Ok(OptimizationResult {
                bolus_mg: 0.0,
                rate_mg_kg_h: 0.0,
                predicted_ce: 0.0,
                absolute_error: 0.0,
                relative_error: 0.0,
                converged: true,
                evaluations: 0,
                rate_bounds: None,
            });
        }

        let bounds = self.rate_bounds(session, request.target_ce);
        let mut evaluator = Evaluator {
            session,
            request,
            resolution: self.settings.resolution,
            max_evaluations: self.settings.max_evaluations,
            evaluations: 0,
            sink,
        };

        let mut best: Option<Candidate> = None;
        let mut searched_upper = bounds.1;
        for &bolus in &request.boluses {
            if evaluator.exhausted() {
                break;
            }
            if let Some((candidate, upper)) = self.search_rate(&mut evaluator, bolus, bounds)? {
                searched_upper = searched_upper.max(upper);
                if best.map_or(true, |b| candidate.cmp_quality(&b) == Ordering::Less) {
                    best = Some(candidate);
                }
            }
        }

        // max_evaluations >= 1 and at least one bolus, so one candidate exists.
        let best = best.ok_or_else(|| TciError::Validation("no candidate was evaluated".to_string()))?;
        let relative_error = best.error / request.target_ce;
        let converged = relative_error <= self.settings.tolerance;
        if evaluator.exhausted() {
            sink.emit(
                Diagnostic::new(Category::Numeric, "optimizer", "evaluation cap reached")
                    .with("evaluations", evaluator.evaluations as f64)
                    .resolved(converged),
            );
        }
        if !converged {
            sink.emit(
                Diagnostic::new(Category::Numeric, "optimizer", "target not reached within tolerance")
                    .with("target_ce", request.target_ce)
                    .with("predicted_ce", best.ce)
                    .with("relative_error", relative_error),
            );
        }
        info!(
            "optimized: bolus {:.2} mg, rate {:.4} mg/kg/h -> Ce {:.4} (target {:.4}, {} evaluations)",
            best.bolus, best.rate, best.ce, request.target_ce, evaluator.evaluations
        );

        Ok(OptimizationResult {
            bolus_mg: best.bolus,
            rate_mg_kg_h: best.rate,
            predicted_ce: best.ce,
            absolute_error: best.error,
            relative_error,
            converged,
            evaluations: evaluator.evaluations,
            rate_bounds: Some((bounds.0, searched_upper)),
        })
    }

    /// Coarse grid over `bounds`, widened while the target sits above it,
    /// then bisection on a bracketed crossing or a fine grid over the cells
    /// next to the coarse optimum. Returns the best candidate and the upper
    /// end of the window finally searched.
    fn search_rate(
        &self,
        evaluator: &mut Evaluator<'_>,
        bolus: f64,
        (lower, upper): (f64, f64),
    ) -> TciResult<Option<(Candidate, f64)>> {
        let target = evaluator.request.target_ce;
        let mut upper = upper;
        let mut coarse = self.grid(evaluator, bolus, lower, upper)?;

        while upper < self.settings.max_rate
            && coarse.len() == self.settings.coarse_points
            && best_index(&coarse) == Some(coarse.len() - 1)
            && coarse[coarse.len() - 1].ce < target
            && !evaluator.exhausted()
        {
            let widened = (upper * 2.0).min(self.settings.max_rate);
            evaluator.sink.emit(
                Diagnostic::new(Category::Numeric, "optimizer", "rate window widened")
                    .with("bolus", bolus)
                    .with("ce_at_upper", coarse[coarse.len() - 1].ce)
                    .with("upper_before", upper)
                    .with("upper_after", widened)
                    .resolved(true),
            );
            debug!(
                "bolus {:.2} mg: Ce {:.4} at {:.3} mg/kg/h is below target, widening to {:.3}",
                bolus,
                coarse[coarse.len() - 1].ce,
                upper,
                widened
            );
            let next = self.grid(evaluator, bolus, upper, widened)?;
            if next.is_empty() {
                break;
            }
            coarse = next;
            upper = widened;
        }

        let Some(best_at) = best_index(&coarse) else {
            return Ok(None);
        };
        let mut best = coarse[best_at];
        let signed = |c: &Candidate| c.ce - target;

        let bracket = [best_at.checked_sub(1).map(|i| (i, best_at)), Some((best_at, best_at + 1))]
            .into_iter()
            .flatten()
            .find(|&(i, j)| j < coarse.len() && signed(&coarse[i]) * signed(&coarse[j]) < 0.0);

        if let Some((i, j)) = bracket {
            let (mut lo, mut hi) = (coarse[i], coarse[j]);
            for _ in 0..self.settings.refine_iterations {
                if evaluator.exhausted() || best.error <= BISECTION_TOLERANCE * target {
                    break;
                }
                let mid = evaluator.evaluate(bolus, 0.5 * (lo.rate + hi.rate))?;
                if mid.cmp_quality(&best) == Ordering::Less {
                    best = mid;
                }
                if signed(&lo) * signed(&mid) <= 0.0 {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
        } else {
            let lo = coarse[best_at.saturating_sub(1)].rate;
            let hi = coarse[(best_at + 1).min(coarse.len() - 1)].rate;
            if hi > lo {
                let fine = self.grid(evaluator, bolus, lo, hi)?;
                if let Some(i) = best_index(&fine) {
                    if fine[i].cmp_quality(&best) == Ordering::Less {
                        best = fine[i];
                    }
                }
            }
        }
        debug!(
            "bolus {:.2} mg: best rate {:.4} mg/kg/h, Ce {:.4}",
            bolus, best.rate, best.ce
        );
        Ok(Some((best, upper)))
    }

    fn grid(
        &self,
        evaluator: &mut Evaluator<'_>,
        bolus: f64,
        lo: f64,
        hi: f64,
    ) -> TciResult<Vec<Candidate>> {
        let n = self.settings.coarse_points;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            if evaluator.exhausted() {
                break;
            }
            let rate = lo + (hi - lo) * i as f64 / (n - 1) as f64;
            out.push(evaluator.evaluate(bolus, rate)?);
        }
        Ok(out)
    }
}

fn best_index(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cmp_quality(b))
        .map(|(i, _)| i)
}
