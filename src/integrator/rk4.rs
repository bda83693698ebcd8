//! Classical fixed-step 4th-order Runge-Kutta, the fallback when the
//! adaptive solver cannot finish a span.

use super::{clip_negative, IntegrationFailure, IntegrationStats, IntegratorOptions, OdeSystem, SpanSolver};
use crate::diagnostics::DiagnosticSink;

pub struct Rk4Solver<'a> {
    options: &'a IntegratorOptions,
}

impl<'a> Rk4Solver<'a> {
    pub fn new(options: &'a IntegratorOptions) -> Self {
        Self { options }
    }
}

/// One RK4 step of size `dt` from `(t, y)`, in place.
///
/// k1 = f(t, y)
/// k2 = f(t + dt/2, y + dt/2 * k1)
/// k3 = f(t + dt/2, y + dt/2 * k2)
/// k4 = f(t + dt, y + dt * k3)
/// y_new = y + dt/6 * (k1 + 2*k2 + 2*k3 + k4)
pub fn step(system: &dyn OdeSystem, t: f64, dt: f64, y: &mut [f64], scratch: &mut Scratch) {
    let n = y.len();
    let Scratch { k1, k2, k3, k4, y_temp } = scratch;

    system.rhs(t, y, k1);
    for i in 0..n {
        y_temp[i] = y[i] + 0.5 * dt * k1[i];
    }
    system.rhs(t + 0.5 * dt, y_temp, k2);
    for i in 0..n {
        y_temp[i] = y[i] + 0.5 * dt * k2[i];
    }
    system.rhs(t + 0.5 * dt, y_temp, k3);
    for i in 0..n {
        y_temp[i] = y[i] + dt * k3[i];
    }
    system.rhs(t + dt, y_temp, k4);

    let dt_6 = dt / 6.0;
    for i in 0..n {
        y[i] += dt_6 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
    }
}

pub struct Scratch {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    y_temp: Vec<f64>,
}

impl Scratch {
    pub fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            y_temp: vec![0.0; n],
        }
    }
}

impl SpanSolver for Rk4Solver<'_> {
    fn integrate(
        &self,
        system: &dyn OdeSystem,
        t0: f64,
        y0: &[f64],
        stops: &[f64],
        stats: &mut IntegrationStats,
        sink: &dyn DiagnosticSink,
    ) -> Result<Vec<Vec<f64>>, IntegrationFailure> {
        let mut scratch = Scratch::new(system.ndim());
        let mut y = y0.to_vec();
        let mut t = t0;
        let mut out = Vec::with_capacity(stops.len());

        for &stop in stops {
            let span = stop - t;
            if span > 0.0 {
                let n_steps = (span / self.options.rk4_step).ceil().max(1.0) as usize;
                let dt = span / n_steps as f64;
                for i in 0..n_steps {
                    let ti = t + i as f64 * dt;
                    step(system, ti, dt, &mut y, &mut scratch);
                    stats.rhs_evaluations += 4;
                    stats.accepted_steps += 1;
                    if !y.iter().all(|v| v.is_finite()) {
                        return Err(IntegrationFailure::NonFinite { t: ti + dt });
                    }
                    clip_negative(&mut y, ti + dt, self.options.negative_noise, stats, sink);
                }
                t = stop;
            }
            out.push(y.clone());
        }

        Ok(out)
    }
}
