//! Scalar bracketing root finders.

use super::RootFindingFailure;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootTolerance {
    pub x_abs: f64,
    pub x_rel: f64,
    pub f_abs: f64,
    pub max_iterations: usize,
}

impl Default for RootTolerance {
    fn default() -> Self {
        Self {
            x_abs: 1e-15,
            x_rel: 1e-15,
            f_abs: 1e-15,
            max_iterations: 200,
        }
    }
}

impl RootTolerance {
    fn x_tol(&self, x: f64) -> f64 {
        2.0 * f64::EPSILON * x.abs() + 0.5 * (self.x_abs + self.x_rel * x.abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootEstimate {
    pub root: f64,
    pub iterations: usize,
}

fn checked_ends<F: Fn(f64) -> f64>(
    f: &F,
    lo: f64,
    hi: f64,
) -> Result<(f64, f64), RootFindingFailure> {
    if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
        return Err(RootFindingFailure::InvalidBracket { lo, hi });
    }
    let (f_lo, f_hi) = (f(lo), f(hi));
    if !(f_lo.is_finite() && f_hi.is_finite()) {
        return Err(RootFindingFailure::NonFinite { at: if f_lo.is_finite() { hi } else { lo } });
    }
    if f_lo * f_hi > 0.0 {
        return Err(RootFindingFailure::NoSignChange { lo, hi });
    }
    Ok((f_lo, f_hi))
}

/// Brent's method: inverse quadratic interpolation and secant steps,
/// falling back to bisection whenever they stray from the bracket.
pub fn brent<F: Fn(f64) -> f64>(
    f: F,
    lo: f64,
    hi: f64,
    tol: &RootTolerance,
) -> Result<RootEstimate, RootFindingFailure> {
    let (mut fa, mut fb) = checked_ends(&f, lo, hi)?;
    let (mut a, mut b) = (lo, hi);
    if fa == 0.0 {
        return Ok(RootEstimate { root: a, iterations: 0 });
    }
    if fb == 0.0 {
        return Ok(RootEstimate { root: b, iterations: 0 });
    }

    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;

    for iteration in 1..=tol.max_iterations {
        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = tol.x_tol(b);
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb.abs() <= tol.f_abs {
            return Ok(RootEstimate { root: b, iterations: iteration });
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * xm * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
        fb = f(b);
        if !fb.is_finite() {
            return Err(RootFindingFailure::NonFinite { at: b });
        }
    }

    Err(RootFindingFailure::MaxIterations {
        iterations: tol.max_iterations,
        last: b,
    })
}

pub fn bisection<F: Fn(f64) -> f64>(
    f: F,
    lo: f64,
    hi: f64,
    tol: &RootTolerance,
) -> Result<RootEstimate, RootFindingFailure> {
    let (mut f_lo, _) = checked_ends(&f, lo, hi)?;
    let (mut lo, mut hi) = (lo, hi);

    for iteration in 1..=tol.max_iterations {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if !f_mid.is_finite() {
            return Err(RootFindingFailure::NonFinite { at: mid });
        }
        if f_mid.abs() <= tol.f_abs || 0.5 * (hi - lo) <= tol.x_tol(mid) {
            return Ok(RootEstimate { root: mid, iterations: iteration });
        }
        if (f_lo > 0.0) == (f_mid > 0.0) {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    Err(RootFindingFailure::MaxIterations {
        iterations: tol.max_iterations,
        last: 0.5 * (lo + hi),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_brent_finds_sqrt2() {
        let r = brent(|x| x * x - 2.0, 0.0, 2.0, &RootTolerance::default()).unwrap();
        assert_relative_eq!(r.root, 2.0_f64.sqrt(), epsilon = 1e-14);
        assert!(r.iterations < 20);
    }

    #[test]
    fn test_brent_transcendental() {
        let r = brent(|x| x.cos() - x, 0.0, 1.0, &RootTolerance::default()).unwrap();
        assert_relative_eq!(r.root, 0.739_085_133_215_160_6, epsilon = 1e-14);
    }

    #[test]
    fn test_bisection_matches_brent() {
        let tol = RootTolerance::default();
        let f = |x: f64| (-x).exp() - 0.25;
        let a = brent(f, 0.0, 5.0, &tol).unwrap();
        let b = bisection(f, 0.0, 5.0, &tol).unwrap();
        assert_relative_eq!(a.root, 4.0_f64.ln(), epsilon = 1e-13);
        assert_relative_eq!(b.root, 4.0_f64.ln(), epsilon = 1e-13);
        assert!(a.iterations < b.iterations);
    }

    #[test]
    fn test_no_sign_change_is_reported() {
        let err = brent(|x| x * x + 1.0, -1.0, 1.0, &RootTolerance::default()).unwrap_err();
        assert!(matches!(err, RootFindingFailure::NoSignChange { .. }));
        let err = bisection(|x| x * x + 1.0, -1.0, 1.0, &RootTolerance::default()).unwrap_err();
        assert!(matches!(err, RootFindingFailure::NoSignChange { .. }));
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let tol = RootTolerance {
            max_iterations: 3,
            ..RootTolerance::default()
        };
        let err = bisection(|x| x - 0.123456789, 0.0, 1.0, &tol).unwrap_err();
        assert!(matches!(err, RootFindingFailure::MaxIterations { iterations: 3, .. }));
    }

    #[test]
    fn test_invalid_bracket() {
        let err = brent(|x| x, 1.0, 0.0, &RootTolerance::default()).unwrap_err();
        assert!(matches!(err, RootFindingFailure::InvalidBracket { .. }));
    }
}
