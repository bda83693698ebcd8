//! Maintenance protocol that steps the infusion down whenever the
//! predicted effect-site concentration overshoots the target.

use crate::diagnostics::{rejected, Category, Diagnostic, DiagnosticSink};
use crate::dosing::{DoseEvent, DosingSchedule};
use crate::error::{TciError, TciResult};
use crate::simulation::{time_grid, Session, Trajectory};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Grid points closer than this are the same instant.
const GRID_MATCH: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDownSettings {
    /// Overshoot ratio (Ce / target) that triggers a reduction.
    pub upper_threshold_ratio: f64,
    pub reduction_factor: f64,
    /// Minimum time between two reductions (min).
    pub min_interval: f64,
    /// Rates at or below this (mg/kg/h) are never reduced.
    pub rate_floor: f64,
    pub check_interval: f64,
    pub duration: f64,
    pub resolution: f64,
}

impl Default for StepDownSettings {
    fn default() -> Self {
        Self {
            upper_threshold_ratio: 1.2,
            reduction_factor: 0.7,
            min_interval: 10.0,
            rate_floor: 0.3,
            check_interval: 1.0,
            duration: 120.0,
            resolution: 0.1,
        }
    }
}

impl StepDownSettings {
    pub fn validate(&self) -> TciResult<()> {
        if !(self.upper_threshold_ratio > 1.0 && self.upper_threshold_ratio.is_finite()) {
            return Err(TciError::Validation(
                "upper_threshold_ratio must be greater than 1".to_string(),
            ));
        }
        if !(self.reduction_factor > 0.0 && self.reduction_factor < 1.0) {
            return Err(TciError::Validation(
                "reduction_factor must be within (0, 1)".to_string(),
            ));
        }
        let positive = [
            ("min_interval", self.min_interval, true),
            ("rate_floor", self.rate_floor, false),
            ("check_interval", self.check_interval, true),
            ("duration", self.duration, false),
            ("resolution", self.resolution, true),
        ];
        for (name, value, strict) in positive {
            let ok = value.is_finite() && if strict { value > 0.0 } else { value >= 0.0 };
            if !ok {
                return Err(TciError::Validation(format!("{} out of range (got {})", name, value)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ProtocolState {
    Stable,
    CoolDown { since: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdjustmentEvent {
    pub time: f64,
    pub rate_before: f64,
    pub rate_after: f64,
    pub ce_trigger: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDownResult {
    pub adjustments: Vec<AdjustmentEvent>,
    pub final_rate: f64,
    pub final_state: ProtocolState,
    pub schedule: DosingSchedule,
    pub trajectory: Trajectory,
}

#[derive(Debug, Clone, Default)]
pub struct StepDownProtocol {
    settings: StepDownSettings,
}

impl StepDownProtocol {
    pub fn new(settings: StepDownSettings) -> TciResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &StepDownSettings {
        &self.settings
    }

    /// Next state and whether a reduction fires at check time `t`.
    pub fn transition(&self, state: ProtocolState, t: f64, ce: f64, target: f64, rate: f64) -> (ProtocolState, bool) {
        let state = match state {
            ProtocolState::CoolDown { since } if t - since >= self.settings.min_interval => ProtocolState::Stable,
            other => other,
        };
        let overshoot = ce > self.settings.upper_threshold_ratio * target;
        match state {
            ProtocolState::Stable if overshoot && rate > self.settings.rate_floor => {
                (ProtocolState::CoolDown { since: t }, true)
            }
            other => (other, false),
        }
    }

    pub fn reduced_rate(&self, rate: f64) -> f64 {
        (rate * self.settings.reduction_factor).max(self.settings.rate_floor)
    }

    /// Runs the protocol from `bolus` (mg) and `rate` (mg/kg/h) at t=0.
    pub fn run(
        &self,
        session: &Session,
        target_ce: f64,
        bolus: f64,
        rate: f64,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<StepDownResult> {
        if !(target_ce > 0.0 && target_ce.is_finite()) {
            let err = TciError::Validation(format!("step-down target must be positive (got {})", target_ce));
            return Err(rejected(sink, "step_down", err));
        }
        let grid = self.grid()?;
        let checks = self.check_times();
        let mut schedule = DosingSchedule::new(vec![DoseEvent::bolus_and_infusion(0.0, bolus, rate)])?;
        let mut state = ProtocolState::Stable;
        let mut current_rate = rate;
        let mut adjustments = Vec::new();
        let mut next_check = 0;

        // An adjustment only changes the future, so one simulation per
        // adjustment covers every check up to the next trigger.
        let trajectory = 'outer: loop {
            let trajectory = session.simulate(&schedule, &grid, sink)?;
            while next_check < checks.len() {
                let t = checks[next_check];
                next_check += 1;
                let ce = trajectory.at(t - GRID_MATCH).map_or(0.0, |p| p.ce);
                let (next, fire) = self.transition(state, t, ce, target_ce, current_rate);
                state = next;
                if fire {
                    let rate_after = self.reduced_rate(current_rate);
                    adjustments.push(AdjustmentEvent {
                        time: t,
                        rate_before: current_rate,
                        rate_after,
                        ce_trigger: ce,
                    });
                    sink.emit(
                        Diagnostic::new(Category::Safety, "step_down", "infusion reduced on overshoot")
                            .with("t", t)
                            .with("ce", ce)
                            .with("rate_before", current_rate)
                            .with("rate_after", rate_after)
                            .resolved(true),
                    );
                    debug!("t={:.1}: Ce {:.4} > threshold, rate {:.3} -> {:.3}", t, ce, current_rate, rate_after);
                    current_rate = rate_after;
                    schedule.push(DoseEvent::infusion(t, rate_after))?;
                    continue 'outer;
                }
            }
            break trajectory;
        };

        info!(
            "step-down protocol: {} adjustments, final rate {:.3} mg/kg/h",
            adjustments.len(),
            current_rate
        );
        Ok(StepDownResult {
            adjustments,
            final_rate: current_rate,
            final_state: state,
            schedule,
            trajectory,
        })
    }

    fn check_times(&self) -> Vec<f64> {
        let StepDownSettings { duration, check_interval, .. } = self.settings;
        // 0.3 / 0.1 lands just below 3.
        let n = (duration / check_interval + GRID_MATCH).floor() as usize;
        (1..=n).map(|i| (i as f64 * check_interval).min(duration)).collect()
    }

    /// Uniform grid with every check time on it.
    fn grid(&self) -> TciResult<Vec<f64>> {
        let mut grid = time_grid(self.settings.duration, self.settings.resolution)?;
        grid.extend(self.check_times());
        grid.sort_by(|a, b| a.total_cmp(b));
        grid.dedup_by(|a, b| (*a - *b).abs() < GRID_MATCH);
        Ok(grid)
    }
}
