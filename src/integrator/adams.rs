//! Variable-step, variable-order Adams–Bashforth–Moulton (PECE).
//!
//! Predictor and corrector weights are recomputed every step for the
//! actual, non-uniform history by integrating the Lagrange interpolant of
//! the stored derivatives with Gauss–Legendre quadrature. The difference
//! between corrector and predictor serves as the local error estimate.

use super::{clip_negative, IntegrationFailure, IntegrationStats, IntegratorOptions, OdeSystem, SpanSolver};
use crate::diagnostics::{Category, Diagnostic, DiagnosticSink};
use std::collections::VecDeque;

pub const MAX_ORDER: usize = 5;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
/// Error norms above this shrink the step ×0.1 instead of ×0.5.
const SEVERE_ERROR: f64 = 1e3;
const ORDER_RAISE_THRESHOLD: f64 = 0.5;

const GAUSS_NODES: [f64; 4] = [
    -0.861_136_311_594_052_6,
    -0.339_981_043_584_856_3,
    0.339_981_043_584_856_3,
    0.861_136_311_594_052_6,
];
const GAUSS_WEIGHTS: [f64; 4] = [
    0.347_854_845_137_453_8,
    0.652_145_154_862_546_1,
    0.652_145_154_862_546_1,
    0.347_854_845_137_453_8,
];

/// Weights `w` with `∫[a,b] p(s) ds = Σ wⱼ·fⱼ`, `p` interpolating `(nodes[j], fⱼ)`.
pub fn quadrature_weights(nodes: &[f64], a: f64, b: f64) -> Vec<f64> {
    let half = 0.5 * (b - a);
    let mid = 0.5 * (a + b);
    let mut weights = vec![0.0; nodes.len()];
    for (xi, wg) in GAUSS_NODES.iter().zip(GAUSS_WEIGHTS) {
        let s = mid + half * xi;
        for (j, w) in weights.iter_mut().enumerate() {
            let mut basis = 1.0;
            for (m, &node) in nodes.iter().enumerate() {
                if m != j {
                    basis *= (s - node) / (nodes[j] - node);
                }
            }
            *w += half * wg * basis;
        }
    }
    weights
}

fn weighted_rms(diff: &[f64], y_old: &[f64], y_new: &[f64], rtol: f64, atol: f64) -> f64 {
    let n = diff.len() as f64;
    let sum: f64 = diff
        .iter()
        .zip(y_old.iter().zip(y_new))
        .map(|(d, (a, b))| {
            let scale = atol + rtol * a.abs().max(b.abs());
            (d / scale).powi(2)
        })
        .sum();
    (sum / n).sqrt()
}

pub struct AdamsSolver<'a> {
    options: &'a IntegratorOptions,
}

impl<'a> AdamsSolver<'a> {
    pub fn new(options: &'a IntegratorOptions) -> Self {
        Self { options }
    }

    fn initial_step(&self, y: &[f64], f: &[f64], span: f64) -> f64 {
        if let Some(h) = self.options.initial_step {
            return h.min(span);
        }
        let d0 = weighted_rms(y, y, y, self.options.rtol, self.options.atol);
        let d1 = weighted_rms(f, y, y, self.options.rtol, self.options.atol);
        let h = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
        h.min(span)
    }
}

impl SpanSolver for AdamsSolver<'_> {
    fn integrate(
        &self,
        system: &dyn OdeSystem,
        t0: f64,
        y0: &[f64],
        stops: &[f64],
        stats: &mut IntegrationStats,
        sink: &dyn DiagnosticSink,
    ) -> Result<Vec<Vec<f64>>, IntegrationFailure> {
        let opts = self.options;
        let n = system.ndim();
        let t_end = match stops.last() {
            Some(&t) if t > t0 => t,
            _ => return Ok(stops.iter().map(|_| y0.to_vec()).collect()),
        };

        let mut t = t0;
        let mut y = y0.to_vec();
        let mut f = vec![0.0; n];
        system.rhs(t, &y, &mut f);
        stats.rhs_evaluations += 1;

        // Newest first.
        let mut history: VecDeque<(f64, Vec<f64>)> = VecDeque::with_capacity(opts.max_order + 1);
        history.push_front((t, f));

        let mut h = self.initial_step(&y, &history[0].1, t_end - t0);
        let mut order = 1;
        let mut steps = 0;
        let mut consecutive_rejections = 0;
        let mut stiffness_reported = false;
        let mut next_stop = 0;
        let mut out = Vec::with_capacity(stops.len());
        while next_stop < stops.len() && stops[next_stop] <= t0 {
            out.push(y.clone());
            next_stop += 1;
        }

        let mut y_pred = vec![0.0; n];
        let mut y_corr = vec![0.0; n];
        let mut f_pred = vec![0.0; n];

        while next_stop < stops.len() {
            if steps >= opts.max_steps {
                return Err(IntegrationFailure::TooManySteps { t, steps });
            }
            let target = stops[next_stop];
            let h_min = 16.0 * f64::EPSILON * t.abs().max(1.0);
            if h < h_min {
                return Err(IntegrationFailure::StepSizeUnderflow { t, h, h_min });
            }

            let remaining = target - t;
            let (step, t_new) = if h >= remaining * (1.0 - 1e-3) {
                (remaining, target)
            } else {
                (h, t + h)
            };

            let k = order.min(history.len());
            steps += 1;

            // Predict (Adams–Bashforth, k nodes).
            let nodes: Vec<f64> = history.iter().take(k).map(|(tn, _)| *tn).collect();
            let wp = quadrature_weights(&nodes, t, t_new);
            y_pred.copy_from_slice(&y);
            for (w, (_, fj)) in wp.iter().zip(history.iter()) {
                for i in 0..n {
                    y_pred[i] += w * fj[i];
                }
            }
            system.rhs(t_new, &y_pred, &mut f_pred);

            // Correct (Adams–Moulton, k + 1 nodes).
            let mut nodes_c = Vec::with_capacity(k + 1);
            nodes_c.push(t_new);
            nodes_c.extend_from_slice(&nodes);
            let wc = quadrature_weights(&nodes_c, t, t_new);
            for i in 0..n {
                y_corr[i] = y[i] + wc[0] * f_pred[i];
            }
            for (w, (_, fj)) in wc[1..].iter().zip(history.iter()) {
                for i in 0..n {
                    y_corr[i] += w * fj[i];
                }
            }
            stats.rhs_evaluations += 1;

            let diff: Vec<f64> = y_corr.iter().zip(&y_pred).map(|(c, p)| c - p).collect();
            let err = if y_corr.iter().all(|v| v.is_finite()) {
                weighted_rms(&diff, &y, &y_corr, opts.rtol, opts.atol)
            } else {
                f64::INFINITY
            };

            if err <= 1.0 {
                t = t_new;
                y.copy_from_slice(&y_corr);
                clip_negative(&mut y, t, opts.negative_noise, stats, sink);

                let mut f_new = vec![0.0; n];
                system.rhs(t, &y, &mut f_new);
                stats.rhs_evaluations += 1;
                if !f_new.iter().all(|v| v.is_finite()) {
                    return Err(IntegrationFailure::NonFinite { t });
                }
                history.push_front((t, f_new));
                history.truncate(opts.max_order + 1);

                stats.accepted_steps += 1;
                stats.max_order_used = stats.max_order_used.max(k);
                consecutive_rejections = 0;

                if t_new == target {
                    out.push(y.clone());
                    next_stop += 1;
                }

                if order < opts.max_order && history.len() > order && err < ORDER_RAISE_THRESHOLD {
                    order += 1;
                }
                let factor = if err == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err.powf(-1.0 / (k as f64 + 1.0))).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                // A step shortened to land on a stop does not shrink the next one.
                h = h.max(step) * factor;
            } else {
                stats.rejected_steps += 1;
                consecutive_rejections += 1;
                h = step * if err > SEVERE_ERROR || !err.is_finite() { 0.1 } else { 0.5 };
                order = order.saturating_sub(1).max(1);

                if consecutive_rejections >= opts.stiffness_rejection_limit && !stiffness_reported {
                    stiffness_reported = true;
                    stats.stiffness_suspected = true;
                    sink.emit(
                        Diagnostic::new(
                            Category::Numeric,
                            "integrator",
                            "repeated step rejections, problem may be stiff; no stiff method available",
                        )
                        .with("t", t)
                        .with("h", h)
                        .with("rejections", consecutive_rejections as f64),
                    );
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{MemorySink, NullSink};
    use approx::assert_relative_eq;

    struct Decay(f64);

    impl OdeSystem for Decay {
        fn ndim(&self) -> usize {
            1
        }
        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -self.0 * y[0];
        }
    }

    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn ndim(&self) -> usize {
            2
        }
        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        }
    }

    struct Poisoned;

    impl OdeSystem for Poisoned {
        fn ndim(&self) -> usize {
            1
        }
        fn rhs(&self, t: f64, _y: &[f64], dydt: &mut [f64]) {
            dydt[0] = if t > 0.0 { f64::NAN } else { 1.0 };
        }
    }

    #[test]
    fn test_quadrature_weights_reproduce_polynomials() {
        let nodes = [1.0, 0.7, 0.2, -0.4];
        let w = quadrature_weights(&nodes, 1.0, 1.5);
        // ∫[1, 1.5] s³ ds
        let exact = (1.5_f64.powi(4) - 1.0) / 4.0;
        let approx: f64 = w.iter().zip(nodes).map(|(w, s)| w * s.powi(3)).sum();
        assert_relative_eq!(approx, exact, epsilon = 1e-12);
        // Single node is forward Euler.
        assert_relative_eq!(quadrature_weights(&[0.0], 0.0, 0.3)[0], 0.3, epsilon = 1e-15);
    }

    #[test]
    fn test_exponential_decay() {
        let options = IntegratorOptions::default();
        let mut stats = IntegrationStats::default();
        let stops = [0.5, 1.0, 2.0, 5.0];
        let out = AdamsSolver::new(&options)
            .integrate(&Decay(1.0), 0.0, &[1.0], &stops, &mut stats, &NullSink)
            .unwrap();
        for (y, t) in out.iter().zip(stops) {
            assert_relative_eq!(y[0], (-t).exp(), max_relative = 1e-5);
        }
        assert!(stats.max_order_used >= 3);
        assert!(stats.rhs_evaluations >= stats.accepted_steps);
    }

    #[test]
    fn test_harmonic_oscillator() {
        let options = IntegratorOptions::default();
        let mut stats = IntegrationStats::default();
        // Quarter period keeps both components non-negative.
        let out = AdamsSolver::new(&options)
            .integrate(&Oscillator, 0.0, &[0.0, 1.0], &[1.5], &mut stats, &NullSink)
            .unwrap();
        assert_relative_eq!(out[0][0], 1.5_f64.sin(), max_relative = 1e-5);
        assert_relative_eq!(out[0][1], 1.5_f64.cos(), max_relative = 1e-4);
    }

    #[test]
    fn test_non_finite_rhs_underflows_and_flags_stiffness() {
        let options = IntegratorOptions::default();
        let mut stats = IntegrationStats::default();
        let sink = MemorySink::new();
        let err = AdamsSolver::new(&options)
            .integrate(&Poisoned, 0.0, &[1.0], &[1.0], &mut stats, &sink)
            .unwrap_err();
        assert!(matches!(err, IntegrationFailure::StepSizeUnderflow { .. }));
        assert!(stats.stiffness_suspected);
        assert!(sink.contains("integrator", "stiff"));
    }

    /// Step size right after the first rejection of a span started at `h0`.
    fn step_after_first_rejection(h0: f64) -> f64 {
        let options = IntegratorOptions {
            initial_step: Some(h0),
            stiffness_rejection_limit: 1,
            ..IntegratorOptions::default()
        };
        let mut stats = IntegrationStats::default();
        let sink = MemorySink::new();
        let out = AdamsSolver::new(&options)
            .integrate(&Decay(1.0), 0.0, &[1.0], &[10.0], &mut stats, &sink)
            .unwrap();
        assert_relative_eq!(out[0][0], (-10.0_f64).exp(), max_relative = 1e-3);
        assert!(stats.rejected_steps >= 1);
        sink.records()[0].context["h"]
    }

    #[test]
    fn test_rejection_shrink_depends_on_error_size() {
        // First order-1 step on y' = -y: the corrector and predictor differ
        // by h²/2, so err ≈ h²/2 / rtol.
        // h = 1: err ≈ 5e5, severe.
        assert_relative_eq!(step_after_first_rejection(1.0), 0.1, epsilon = 1e-15);
        // h = 0.01: err ≈ 50, ordinary.
        assert_relative_eq!(step_after_first_rejection(0.01), 0.005, epsilon = 1e-15);
    }

    #[test]
    fn test_step_cap() {
        let options = IntegratorOptions {
            max_steps: 5,
            ..IntegratorOptions::default()
        };
        let mut stats = IntegrationStats::default();
        let err = AdamsSolver::new(&options)
            .integrate(&Decay(1.0), 0.0, &[1.0], &[100.0], &mut stats, &NullSink)
            .unwrap_err();
        assert!(matches!(err, IntegrationFailure::TooManySteps { steps: 5, .. }));
    }

    #[test]
    fn test_zero_length_span() {
        let options = IntegratorOptions::default();
        let mut stats = IntegrationStats::default();
        let out = AdamsSolver::new(&options)
            .integrate(&Decay(1.0), 2.0, &[3.0], &[2.0], &mut stats, &NullSink)
            .unwrap();
        assert_eq!(out, vec![vec![3.0]]);
        assert_eq!(stats.rhs_evaluations, 0);
    }
}
