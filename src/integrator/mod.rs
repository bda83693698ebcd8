//! Time integration of the compartment masses under a dosing schedule.
//!
//! Integration is split at every dose event so no span contains a
//! discontinuity. Each span is handed to an ordered chain of
//! [`SpanMethod`]s (by default the adaptive Adams solver, then fixed-step
//! RK4); the first method that succeeds wins and every transition is
//! reported to the diagnostic sink.

pub mod adams;
pub mod rk4;

use crate::diagnostics::{Category, Diagnostic, DiagnosticSink};
use crate::dosing::DosingSchedule;
use crate::error::{TciError, TciResult};
use crate::models::RateConstants;
use crate::units;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use adams::AdamsSolver;
pub use rk4::Rk4Solver;

/// Right-hand side of `dy/dt = f(t, y)`.
pub trait OdeSystem {
    fn ndim(&self) -> usize;
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);
}

/// Integrates one continuous span, returning the state at every stop.
pub trait SpanSolver {
    fn integrate(
        &self,
        system: &dyn OdeSystem,
        t0: f64,
        y0: &[f64],
        stops: &[f64],
        stats: &mut IntegrationStats,
        sink: &dyn DiagnosticSink,
    ) -> Result<Vec<Vec<f64>>, IntegrationFailure>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationFailure {
    #[error("step size {h:e} fell below the minimum {h_min:e} at t={t}")]
    StepSizeUnderflow { t: f64, h: f64, h_min: f64 },
    #[error("step limit of {steps} reached at t={t}")]
    TooManySteps { t: f64, steps: usize },
    #[error("non-finite state at t={t}")]
    NonFinite { t: f64 },
    #[error("no integration method configured")]
    NoMethods,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanMethod {
    Adams,
    Rk4,
}

impl fmt::Display for SpanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanMethod::Adams => f.write_str("adams"),
            SpanMethod::Rk4 => f.write_str("rk4"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub rtol: f64,
    pub atol: f64,
    pub max_order: usize,
    /// Adaptive steps allowed per span.
    pub max_steps: usize,
    pub initial_step: Option<f64>,
    /// Consecutive rejections after which the span is flagged as stiff.
    pub stiffness_rejection_limit: usize,
    /// Fixed step of the RK4 fallback (min).
    pub rk4_step: f64,
    /// Negative excursions smaller than this (relative) are clipped silently.
    pub negative_noise: f64,
    pub methods: Vec<SpanMethod>,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-10,
            max_order: 5,
            max_steps: 50_000,
            initial_step: None,
            stiffness_rejection_limit: 8,
            rk4_step: 0.01,
            negative_noise: 1e-9,
            methods: vec![SpanMethod::Adams, SpanMethod::Rk4],
        }
    }
}

impl IntegratorOptions {
    pub fn validate(&self) -> TciResult<()> {
        if !(self.rtol > 0.0 && self.rtol.is_finite()) || !(self.atol > 0.0 && self.atol.is_finite()) {
            return Err(TciError::Validation("tolerances must be positive".to_string()));
        }
        if !(1..=adams::MAX_ORDER).contains(&self.max_order) {
            return Err(TciError::Validation(format!(
                "max_order must be within 1-{}",
                adams::MAX_ORDER
            )));
        }
        if !(self.rk4_step > 0.0 && self.rk4_step.is_finite()) {
            return Err(TciError::Validation("rk4_step must be positive".to_string()));
        }
        if self.methods.is_empty() {
            return Err(TciError::Validation(
                "at least one integration method must be configured".to_string(),
            ));
        }
        Ok(())
    }

    fn solver(&self, method: SpanMethod) -> Box<dyn SpanSolver + '_> {
        match method {
            SpanMethod::Adams => Box::new(AdamsSolver::new(self)),
            SpanMethod::Rk4 => Box::new(Rk4Solver::new(self)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IntegrationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
    pub fallback_spans: usize,
    pub max_order_used: usize,
    pub stiffness_suspected: bool,
    pub clipped_values: usize,
}

/// Clamps negative components to zero, reporting excursions above the noise floor.
pub(crate) fn clip_negative(
    y: &mut [f64],
    t: f64,
    noise: f64,
    stats: &mut IntegrationStats,
    sink: &dyn DiagnosticSink,
) {
    let scale = y.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
    for (i, v) in y.iter_mut().enumerate() {
        if *v < 0.0 {
            if *v < -noise * scale {
                sink.emit(
                    Diagnostic::new(Category::Numeric, "integrator", "negative compartment value clipped")
                        .with("t", t)
                        .with("compartment", (i + 1) as f64)
                        .with("value", *v)
                        .resolved(true),
                );
            }
            *v = 0.0;
            stats.clipped_values += 1;
        }
    }
}

/// Three-compartment mass balance with a constant infusion (mg/min).
#[derive(Debug, Clone, Copy)]
pub struct CompartmentSystem {
    pub rates: RateConstants,
    pub infusion: f64,
}

impl OdeSystem for CompartmentSystem {
    fn ndim(&self) -> usize {
        3
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        let d = self.rates.derivatives(&[y[0], y[1], y[2]], self.infusion);
        dydt.copy_from_slice(&d);
    }
}

/// Compartment masses (mg) at `time` (min).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompartmentState {
    pub time: f64,
    pub masses: [f64; 3],
}

impl CompartmentState {
    pub fn central_concentration(&self, v1: f64) -> f64 {
        self.masses[0] / v1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationOutput {
    pub states: Vec<CompartmentState>,
    pub stats: IntegrationStats,
}

pub struct CompartmentIntegrator<'a> {
    rates: RateConstants,
    weight: f64,
    options: &'a IntegratorOptions,
}

impl<'a> CompartmentIntegrator<'a> {
    pub fn new(rates: RateConstants, weight: f64, options: &'a IntegratorOptions) -> Self {
        Self {
            rates,
            weight,
            options,
        }
    }

    /// States at each of `times`. A bolus at time `t` is included in the
    /// state reported at `t`.
    pub fn run(
        &self,
        schedule: &DosingSchedule,
        times: &[f64],
        sink: &dyn DiagnosticSink,
    ) -> TciResult<IntegrationOutput> {
        validate_times(times)?;

        let events = schedule.events();
        let end = times[times.len() - 1];
        let mut stats = IntegrationStats::default();
        let mut states = Vec::with_capacity(times.len());
        let mut y = vec![0.0; 3];
        let mut t = 0.0;
        let mut next_event = 0;
        let mut next_out = 0;

        loop {
            let due = schedule.due(next_event, t);
            for event in due {
                y[0] += event.bolus;
            }
            next_event += due.len();
            while next_out < times.len() && times[next_out] <= t {
                states.push(CompartmentState {
                    time: times[next_out],
                    masses: [y[0], y[1], y[2]],
                });
                next_out += 1;
            }
            if next_out == times.len() {
                break;
            }

            let span_end = events
                .get(next_event)
                .map_or(end, |e| e.time.min(end));
            let mut stops: Vec<f64> = Vec::new();
            for &time in &times[next_out..] {
                if time >= span_end {
                    break;
                }
                if stops.last() != Some(&time) {
                    stops.push(time);
                }
            }
            stops.push(span_end);

            let system = CompartmentSystem {
                rates: self.rates,
                infusion: units::mg_kg_h_to_mg_min(schedule.infusion_rate_at(t), self.weight),
            };
            let span_states = self
                .integrate_span(&system, t, &y, &stops, &mut stats, sink)
                .map_err(TciError::NumericIntegration)?;

            let mut stop = 0;
            while next_out < times.len() && times[next_out] < span_end {
                while stops[stop] < times[next_out] {
                    stop += 1;
                }
                let s = &span_states[stop];
                states.push(CompartmentState {
                    time: times[next_out],
                    masses: [s[0], s[1], s[2]],
                });
                next_out += 1;
            }
            y.clone_from(&span_states[span_states.len() - 1]);
            t = span_end;
        }

        debug!(
            "integrated {} outputs: {} accepted / {} rejected steps, {} fallback spans",
            states.len(),
            stats.accepted_steps,
            stats.rejected_steps,
            stats.fallback_spans
        );
        Ok(IntegrationOutput { states, stats })
    }

    /// Runs the configured method chain over one continuous span.
    pub fn integrate_span(
        &self,
        system: &dyn OdeSystem,
        t0: f64,
        y0: &[f64],
        stops: &[f64],
        stats: &mut IntegrationStats,
        sink: &dyn DiagnosticSink,
    ) -> Result<Vec<Vec<f64>>, IntegrationFailure> {
        let t1 = stops.last().copied().unwrap_or(t0);
        let mut last_failure = None;

        for (attempt, &method) in self.options.methods.iter().enumerate() {
            match self.options.solver(method).integrate(system, t0, y0, stops, stats, sink) {
                Ok(states) => {
                    if attempt > 0 {
                        stats.fallback_spans += 1;
                        sink.emit(
                            Diagnostic::new(
                                Category::Numeric,
                                "integrator",
                                format!("span integrated by fallback method {}", method),
                            )
                            .with("t_start", t0)
                            .with("t_end", t1)
                            .resolved(true),
                        );
                    }
                    return Ok(states);
                }
                Err(failure) => {
                    sink.emit(
                        Diagnostic::new(
                            Category::Numeric,
                            "integrator",
                            format!("{} failed: {}", method, failure),
                        )
                        .with("t_start", t0)
                        .with("t_end", t1),
                    );
                    last_failure = Some(failure);
                }
            }
        }

        Err(last_failure.unwrap_or(IntegrationFailure::NoMethods))
    }
}

fn validate_times(times: &[f64]) -> TciResult<()> {
    if times.is_empty() {
        return Err(TciError::Validation(
            "at least one output time must be requested".to_string(),
        ));
    }
    if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
        return Err(TciError::Validation(
            "output times must be non-negative numbers".to_string(),
        ));
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(TciError::Validation(
            "output times must be non-decreasing".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{MemorySink, NullSink};
    use crate::dosing::DoseEvent;
    use crate::models::{PkParameters, PlasmaCoefficients};
    use approx::assert_relative_eq;

    fn pk() -> PkParameters {
        PkParameters {
            ideal_body_weight: 65.6,
            adjusted_body_weight: 67.3,
            v1: 3.57,
            v2: 11.3,
            v3: 24.4,
            cl: 1.03,
            q2: 1.10,
            q3: 0.401,
        }
    }

    fn grid(end: f64, step: f64) -> Vec<f64> {
        let n = (end / step).round() as usize;
        (0..=n).map(|i| i as f64 * step).collect()
    }

    #[test]
    fn test_zero_dosing_stays_exactly_zero() {
        let options = IntegratorOptions::default();
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let out = integrator
            .run(&DosingSchedule::empty(), &grid(60.0, 1.0), &NullSink)
            .unwrap();
        assert_eq!(out.states.len(), 61);
        for s in &out.states {
            assert_eq!(s.masses, [0.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_bolus_at_time_zero_is_applied() {
        let options = IntegratorOptions::default();
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus(0.0, 14.0)]).unwrap();
        let out = integrator.run(&schedule, &grid(10.0, 0.5), &NullSink).unwrap();
        assert_eq!(out.states[0].masses, [14.0, 0.0, 0.0]);
        assert!(out.states[1].masses[0] < 14.0);
    }

    #[test]
    fn test_bolus_matches_triexponential_solution() {
        let options = IntegratorOptions::default();
        let pk = pk();
        let rates = pk.rate_constants();
        let plasma = PlasmaCoefficients::new(&pk, &rates).unwrap();
        let integrator = CompartmentIntegrator::new(rates, 70.0, &options);
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus(0.0, 14.0)]).unwrap();
        let times = grid(120.0, 0.5);
        let out = integrator.run(&schedule, &times, &NullSink).unwrap();

        for s in &out.states {
            let expected = plasma.bolus_concentration(14.0, s.time);
            let got = s.central_concentration(pk.v1);
            assert_relative_eq!(got, expected, max_relative = 1e-4, epsilon = 1e-9);
        }
        assert_eq!(out.stats.fallback_spans, 0);
        assert!(out.stats.max_order_used > 1);
    }

    #[test]
    fn test_superposed_boluses() {
        let options = IntegratorOptions::default();
        let pk = pk();
        let rates = pk.rate_constants();
        let plasma = PlasmaCoefficients::new(&pk, &rates).unwrap();
        let integrator = CompartmentIntegrator::new(rates, 70.0, &options);
        // Two boluses inside one output interval.
        let schedule = DosingSchedule::new(vec![
            DoseEvent::bolus(0.0, 10.0),
            DoseEvent::bolus(5.2, 4.0),
            DoseEvent::bolus(5.7, 2.0),
        ])
        .unwrap();
        let out = integrator.run(&schedule, &[0.0, 5.0, 6.0, 30.0], &NullSink).unwrap();
        for s in &out.states {
            let expected = plasma.bolus_concentration(10.0, s.time)
                + plasma.bolus_concentration(4.0, s.time - 5.2)
                + plasma.bolus_concentration(2.0, s.time - 5.7);
            assert_relative_eq!(s.central_concentration(pk.v1), expected, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_output_at_bolus_time_includes_bolus() {
        let options = IntegratorOptions::default();
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let schedule =
            DosingSchedule::new(vec![DoseEvent::bolus(0.0, 10.0), DoseEvent::bolus(5.0, 10.0)]).unwrap();
        let out = integrator.run(&schedule, &[4.999, 5.0], &NullSink).unwrap();
        assert_relative_eq!(out.states[1].masses[0] - out.states[0].masses[0], 10.0, epsilon = 0.01);
    }

    #[test]
    fn test_infusion_approaches_steady_state() {
        let options = IntegratorOptions::default();
        let pk = pk();
        let integrator = CompartmentIntegrator::new(pk.rate_constants(), 70.0, &options);
        // 1 µg/mL target: CL·C = 1.03 mg/min = 0.882857 mg/kg/h at 70 kg.
        let rate = units::mg_min_to_mg_kg_h(units::steady_state_infusion_mg_min(1.0, pk.cl), 70.0);
        let schedule = DosingSchedule::new(vec![DoseEvent::infusion(0.0, rate)]).unwrap();
        let out = integrator.run(&schedule, &[0.0, 3000.0], &NullSink).unwrap();
        assert_relative_eq!(out.states[1].central_concentration(pk.v1), 1.0, max_relative = 1e-3);
        assert!(out.states.iter().all(|s| s.masses.iter().all(|m| *m >= 0.0)));
    }

    #[test]
    fn test_fallback_to_rk4_when_adams_exhausts_steps() {
        let options = IntegratorOptions {
            max_steps: 3,
            ..IntegratorOptions::default()
        };
        let pk = pk();
        let rates = pk.rate_constants();
        let plasma = PlasmaCoefficients::new(&pk, &rates).unwrap();
        let integrator = CompartmentIntegrator::new(rates, 70.0, &options);
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus(0.0, 14.0)]).unwrap();
        let sink = MemorySink::new();
        let out = integrator.run(&schedule, &[0.0, 10.0], &sink).unwrap();

        assert_eq!(out.stats.fallback_spans, 1);
        assert!(sink.contains("integrator", "adams failed"));
        assert!(sink
            .records()
            .iter()
            .any(|d| d.resolved && d.message.contains("fallback method rk4")));
        assert_relative_eq!(
            out.states[1].central_concentration(pk.v1),
            plasma.bolus_concentration(14.0, 10.0),
            max_relative = 1e-6
        );
    }

    #[test]
    fn test_failure_surfaces_without_fallback() {
        let options = IntegratorOptions {
            max_steps: 3,
            methods: vec![SpanMethod::Adams],
            ..IntegratorOptions::default()
        };
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus(0.0, 14.0)]).unwrap();
        let err = integrator.run(&schedule, &[0.0, 10.0], &NullSink).unwrap_err();
        assert!(matches!(
            err,
            TciError::NumericIntegration(IntegrationFailure::TooManySteps { .. })
        ));
    }

    #[test]
    fn test_rejects_decreasing_times() {
        let options = IntegratorOptions::default();
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let err = integrator.run(&DosingSchedule::empty(), &[0.0, 2.0, 1.0], &NullSink);
        assert!(matches!(err, Err(TciError::Validation(_))));
        let err = integrator.run(&DosingSchedule::empty(), &[], &NullSink);
        assert!(matches!(err, Err(TciError::Validation(_))));
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let options = IntegratorOptions::default();
        let integrator = CompartmentIntegrator::new(pk().rate_constants(), 70.0, &options);
        let schedule = DosingSchedule::new(vec![
            DoseEvent::bolus_and_infusion(0.0, 14.0, 1.0),
            DoseEvent::infusion(15.0, 0.5),
        ])
        .unwrap();
        let times = grid(30.0, 0.25);
        let a = integrator.run(&schedule, &times, &NullSink).unwrap();
        let b = integrator.run(&schedule, &times, &NullSink).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_clip_negative_reports_significant_excursions() {
        let sink = MemorySink::new();
        let mut stats = IntegrationStats::default();
        let mut y = vec![5.0, -1e-12, -0.5];
        clip_negative(&mut y, 1.0, 1e-9, &mut stats, &sink);
        assert_eq!(y, vec![5.0, 0.0, 0.0]);
        assert_eq!(stats.clipped_values, 2);
        assert_eq!(sink.count("integrator"), 1);
    }
}
