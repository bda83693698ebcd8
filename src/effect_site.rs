//! Effect-site concentration from a plasma concentration series.
//!
//! Plasma concentration is taken as linear between samples, which makes
//! `dCe/dt = ke0·(Cp - Ce)` solvable in closed form on every segment.

use crate::error::{TciError, TciResult};

/// Below this absolute change a segment is treated as constant plasma.
pub const CONSTANT_THRESHOLD: f64 = 1e-6;
/// Below this `ke0·Δt` the ramp solution switches to its Taylor expansion.
pub const SMALL_STEP_THRESHOLD: f64 = 1e-3;

/// Advances `ce` over one segment from `cp0` to `cp1` lasting `dt` minutes.
pub fn step(ce: f64, cp0: f64, cp1: f64, dt: f64, ke0: f64) -> f64 {
    if dt <= 0.0 {
        return ce;
    }
    let x = ke0 * dt;
    let delta = cp1 - cp0;

    let next = if delta.abs() < CONSTANT_THRESHOLD {
        cp1 + (ce - cp1) * (-x).exp()
    } else if x < SMALL_STEP_THRESHOLD {
        // 1 - e^-x ≈ x - x²/2 and 1 - (1 - e^-x)/x ≈ x/2 - x²/6
        ce + (cp0 - ce) * (x - x * x / 2.0) + delta * (x / 2.0 - x * x / 6.0)
    } else {
        let decay = (-x).exp();
        let gain = -(-x).exp_m1();
        ce * decay + cp0 * gain + delta * (1.0 - gain / x)
    };
    next.max(0.0)
}

/// Effect-site series aligned with `times`/`plasma`, starting from zero.
pub fn effect_site_series(times: &[f64], plasma: &[f64], ke0: f64) -> TciResult<Vec<f64>> {
    if times.len() != plasma.len() {
        return Err(TciError::Validation(format!(
            "time and concentration series differ in length ({} vs {})",
            times.len(),
            plasma.len()
        )));
    }
    if !(ke0 > 0.0 && ke0.is_finite()) {
        return Err(TciError::Validation(format!("ke0 must be positive (got {})", ke0)));
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(TciError::Validation(
            "time points must be non-decreasing".to_string(),
        ));
    }

    let mut series = Vec::with_capacity(times.len());
    if times.is_empty() {
        return Ok(series);
    }
    let mut ce = 0.0;
    series.push(ce);
    for i in 1..times.len() {
        ce = step(ce, plasma[i - 1], plasma[i], times[i] - times[i - 1], ke0);
        series.push(ce);
    }
    Ok(series)
}
