//! Exact ke0: the value for which the effect-site concentration after a
//! bolus peaks at the model's time to peak effect.
//!
//! After a unit bolus, `Ce(t) = ke0 · Σ cᵢ (e^(-λᵢt) - e^(-ke0·t)) / (ke0 - λᵢ)`.
//! Dropping the positive `ke0` factor, `dCe/dt = 0` at `t_peak` becomes
//!
//! ```text
//! g(ke0) = Σ cᵢ (ke0·e^(-ke0·t) - λᵢ·e^(-λᵢ·t)) / (ke0 - λᵢ) = 0
//! ```
//!
//! Each term is a divided difference of `u(x) = x·e^(-x·t)` and is
//! evaluated as `e^(-λt)·(e^(-δt) + λ·expm1(-δt)/δ)` with `δ = ke0 - λ`,
//! switching to a Taylor series where `δ` is too small to divide by.

use super::roots::{bisection, brent, RootEstimate, RootTolerance};
use super::{Ke0Bounds, RootFindingFailure};
use crate::diagnostics::{Category, Diagnostic, DiagnosticSink};
use crate::models::PlasmaCoefficients;
use serde::Serialize;
use std::fmt;

/// `|ke0 - λ|` below which `g` uses its Taylor expansion.
pub const SINGULAR_NEIGHBORHOOD: f64 = 1e-8;
/// Same, for `g'`, whose direct form cancels more digits.
const DERIVATIVE_SINGULAR_NEIGHBORHOOD: f64 = 1e-4;

const NEWTON_ITERATIONS: usize = 3;
const NARROW_HALF_WIDTH: f64 = 0.25;
const NARROW_WIDENING: f64 = 1.5;
const NARROW_EXPANSIONS: usize = 12;
pub const DEFAULT_BRACKET: (f64, f64) = (0.01, 2.0);
pub const WIDE_BRACKET: (f64, f64) = (1e-4, 10.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BracketStrategy {
    NarrowBrent,
    DefaultBisection,
    WideBrent,
}

impl fmt::Display for BracketStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BracketStrategy::NarrowBrent => "brent (narrow bracket)",
            BracketStrategy::DefaultBisection => "bisection (default bracket)",
            BracketStrategy::WideBrent => "brent (wide bracket)",
        };
        f.write_str(name)
    }
}

pub const STRATEGY_CHAIN: [BracketStrategy; 3] = [
    BracketStrategy::NarrowBrent,
    BracketStrategy::DefaultBisection,
    BracketStrategy::WideBrent,
];

/// `expm1(-δt)/δ`, which tends to `-t` as `δ → 0`.
fn phi(delta: f64, t: f64) -> f64 {
    if delta.abs() < SINGULAR_NEIGHBORHOOD {
        -t + delta * t * t / 2.0 - delta * delta * t.powi(3) / 6.0
    } else {
        (-delta * t).exp_m1() / delta
    }
}

/// `d/dδ [expm1(-δt)/δ]`.
fn phi_prime(delta: f64, t: f64) -> f64 {
    if delta.abs() < DERIVATIVE_SINGULAR_NEIGHBORHOOD {
        t * t / 2.0 - delta * t.powi(3) / 3.0 + delta * delta * t.powi(4) / 8.0
    } else {
        (-t * delta * (-delta * t).exp() - (-delta * t).exp_m1()) / (delta * delta)
    }
}

/// The stationarity condition `g(ke0) = 0` for one patient.
#[derive(Debug, Clone, Copy)]
pub struct PeakCondition {
    exponents: [f64; 3],
    weights: [f64; 3],
    t_peak: f64,
}

impl PeakCondition {
    pub fn new(plasma: &PlasmaCoefficients, t_peak: f64) -> Self {
        let coeffs = plasma.coefficients();
        let total: f64 = coeffs.iter().sum();
        Self {
            exponents: plasma.exponents(),
            weights: coeffs.map(|c| c / total),
            t_peak,
        }
    }

    pub fn value(&self, ke0: f64) -> f64 {
        let t = self.t_peak;
        self.exponents
            .iter()
            .zip(self.weights)
            .map(|(&l, w)| {
                let delta = ke0 - l;
                w * (-l * t).exp() * ((-delta * t).exp() + l * phi(delta, t))
            })
            .sum()
    }

    pub fn derivative(&self, ke0: f64) -> f64 {
        let t = self.t_peak;
        self.exponents
            .iter()
            .zip(self.weights)
            .map(|(&l, w)| {
                let delta = ke0 - l;
                w * (-l * t).exp() * (-t * (-delta * t).exp() + l * phi_prime(delta, t))
            })
            .sum()
    }

    /// AUC-weighted mean of the exponents, refined by a few Newton steps.
    pub fn initial_guess(&self) -> f64 {
        let auc: f64 = self
            .exponents
            .iter()
            .zip(self.weights)
            .map(|(l, w)| w / l)
            .sum();
        let mut guess = self.weights.iter().sum::<f64>() / auc;

        for _ in 0..NEWTON_ITERATIONS {
            let slope = self.derivative(guess);
            if slope == 0.0 || !slope.is_finite() {
                break;
            }
            let next = guess - self.value(guess) / slope;
            if !next.is_finite() || next <= 0.0 {
                break;
            }
            guess = next;
        }
        guess
    }

    fn narrow_bracket(&self, guess: f64) -> Result<(f64, f64), RootFindingFailure> {
        let mut lo = guess * (1.0 - NARROW_HALF_WIDTH);
        let mut hi = guess * (1.0 + NARROW_HALF_WIDTH);
        for _ in 0..NARROW_EXPANSIONS {
            if self.value(lo) * self.value(hi) <= 0.0 {
                return Ok((lo, hi));
            }
            lo /= NARROW_WIDENING;
            hi *= NARROW_WIDENING;
        }
        Err(RootFindingFailure::NoSignChange { lo, hi })
    }

    fn run(
        &self,
        strategy: BracketStrategy,
        guess: f64,
        tol: &RootTolerance,
    ) -> Result<RootEstimate, RootFindingFailure> {
        let f = |k: f64| self.value(k);
        match strategy {
            BracketStrategy::NarrowBrent => {
                let (lo, hi) = self.narrow_bracket(guess)?;
                brent(f, lo, hi, tol)
            }
            BracketStrategy::DefaultBisection => {
                bisection(f, DEFAULT_BRACKET.0, DEFAULT_BRACKET.1, tol)
            }
            BracketStrategy::WideBrent => brent(f, WIDE_BRACKET.0, WIDE_BRACKET.1, tol),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExactSolution {
    pub ke0: f64,
    pub strategy: BracketStrategy,
    pub initial_guess: f64,
    pub iterations: usize,
}

/// Tries `strategies` in order; the first in-band root wins.
pub fn solve_with_chain(
    condition: &PeakCondition,
    strategies: &[BracketStrategy],
    bounds: &Ke0Bounds,
    tol: &RootTolerance,
    sink: &dyn DiagnosticSink,
) -> Result<ExactSolution, RootFindingFailure> {
    let guess = condition.initial_guess();
    let mut failures = Vec::new();

    for &strategy in strategies {
        let outcome = condition
            .run(strategy, guess, tol)
            .and_then(|estimate| {
                if bounds.contains(estimate.root) {
                    Ok(estimate)
                } else {
                    Err(RootFindingFailure::OutOfBounds {
                        value: estimate.root,
                        min: bounds.min,
                        max: bounds.max,
                    })
                }
            });

        match outcome {
            Ok(estimate) => {
                if !failures.is_empty() {
                    sink.emit(
                        Diagnostic::new(
                            Category::Numeric,
                            "ke0",
                            format!("exact ke0 recovered by {}", strategy),
                        )
                        .with("ke0", estimate.root)
                        .with("failed_strategies", failures.len() as f64)
                        .resolved(true),
                    );
                }
                return Ok(ExactSolution {
                    ke0: estimate.root,
                    strategy,
                    initial_guess: guess,
                    iterations: estimate.iterations,
                });
            }
            Err(failure) => {
                sink.emit(
                    Diagnostic::new(
                        Category::Numeric,
                        "ke0",
                        format!("{} failed: {}", strategy, failure),
                    )
                    .with("initial_guess", guess),
                );
                failures.push((strategy, failure));
            }
        }
    }

    Err(RootFindingFailure::Exhausted(failures))
}
