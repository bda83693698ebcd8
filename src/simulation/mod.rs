pub mod cohort;

use crate::diagnostics::{rejected, DiagnosticSink};
use crate::dosing::DosingSchedule;
use crate::effect_site;
use crate::error::{TciError, TciResult};
use crate::integrator::{CompartmentIntegrator, IntegrationStats, IntegratorOptions};
use crate::ke0::{Ke0Bounds, Ke0Cache, Ke0Selection, Ke0Solver};
use crate::models::{MasuiModel, PkParameters, PlasmaCoefficients, PopulationModel, RateConstants};
use crate::patient::PatientParameters;
use log::{debug, info};
use serde::Serialize;

pub use cohort::{CohortRanges, CohortRecord, CohortReport, CohortSampler, CohortSummary};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSettings {
    pub integrator: IntegratorOptions,
    pub ke0_bounds: Ke0Bounds,
}

impl SessionSettings {
    pub fn validate(&self) -> TciResult<()> {
        self.integrator.validate()?;
        self.ke0_bounds.validate()
    }
}

pub struct Simulator {
    settings: SessionSettings,
    cache: Ke0Cache,
}

impl Simulator {
    pub fn new(settings: SessionSettings) -> TciResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            cache: Ke0Cache::new(),
        })
    }

    pub fn session(&mut self, patient: PatientParameters, sink: &dyn DiagnosticSink) -> TciResult<Session> {
        Session::with_cache(patient, &self.settings, &mut self.cache, sink)
    }

    pub fn cache(&self) -> &Ke0Cache {
        &self.cache
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    patient: PatientParameters,
    pk: PkParameters,
    rates: RateConstants,
    ke0: Ke0Selection,
    integrator: IntegratorOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrajectoryPoint {
    pub time: f64,
    pub masses: [f64; 3],    // mg
    pub cp: f64,             // µg/mL
    pub ce: f64,             // µg/mL
    pub infusion_rate: f64,  // mg/kg/h
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.last()
    }

    /// First point at or after `time`.
    pub fn at(&self, time: f64) -> Option<&TrajectoryPoint> {
        let i = self.points.partition_point(|p| p.time < time);
        self.points.get(i)
    }

    pub fn peak_ce(&self) -> Option<&TrajectoryPoint> {
        self.points
            .iter()
            .fold(None, |best: Option<&TrajectoryPoint>, p| match best {
                Some(b) if b.ce >= p.ce => Some(b),
                _ => Some(p),
            })
    }
}

/// `0, step, 2·step, …` up to and including `end`.
pub fn time_grid(end: f64, step: f64) -> TciResult<Vec<f64>> {
    if !(end >= 0.0 && end.is_finite()) || !(step > 0.0 && step.is_finite()) {
        return Err(TciError::Validation(format!(
            "time grid needs end >= 0 and step > 0 (got end {}, step {})",
            end, step
        )));
    }
    let n = (end / step).ceil() as usize;
    let dt = if n == 0 { 0.0 } else { end / n as f64 };
    Ok((0..=n).map(|i| i as f64 * dt).collect())
}

impl Session {
    pub fn new(
        patient: PatientParameters,
        settings: &SessionSettings,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<Self> {
        Self::with_cache(patient, settings, &mut Ke0Cache::new(), sink)
    }

    /// Fails with [`TciError::Safety`] when no ke0 estimate is acceptable.
    pub fn with_cache(
        patient: PatientParameters,
        settings: &SessionSettings,
        cache: &mut Ke0Cache,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<Self> {
        settings.validate().map_err(|e| rejected(sink, "session", e))?;
        let model = MasuiModel;
        let pk = model.pk_parameters(&patient)?;
        let rates = pk.rate_constants();
        let plasma = PlasmaCoefficients::new(&pk, &rates);

        let solver = Ke0Solver::new(settings.ke0_bounds);
        let ke0 = solver.select_cached(cache, &model, &patient, plasma.as_ref(), sink)?;
        info!(
            "session ready ({} model): V1={:.3} L, CL={:.4} L/min, ke0={:.4} /min ({})",
            model.name(),
            pk.v1,
            pk.cl,
            ke0.ke0,
            if ke0.is_exact() { "exact" } else { "regression" }
        );

        Ok(Self {
            patient,
            pk,
            rates,
            ke0,
            integrator: settings.integrator.clone(),
        })
    }

    pub fn patient(&self) -> &PatientParameters {
        &self.patient
    }

    pub fn pk(&self) -> &PkParameters {
        &self.pk
    }

    pub fn rates(&self) -> &RateConstants {
        &self.rates
    }

    pub fn ke0(&self) -> &Ke0Selection {
        &self.ke0
    }

    pub fn simulate(
        &self,
        schedule: &DosingSchedule,
        grid: &[f64],
        sink: &dyn DiagnosticSink,
    ) -> TciResult<Trajectory> {
        let integrator = CompartmentIntegrator::new(self.rates, self.patient.weight(), &self.integrator);
        let output = integrator
            .run(schedule, grid, sink)
            .map_err(|e| rejected(sink, "session", e))?;

        let times: Vec<f64> = output.states.iter().map(|s| s.time).collect();
        let cp: Vec<f64> = output
            .states
            .iter()
            .map(|s| s.central_concentration(self.pk.v1))
            .collect();
        let ce = effect_site::effect_site_series(&times, &cp, self.ke0.ke0)?;

        let points = output
            .states
            .iter()
            .zip(cp.iter().zip(ce.iter()))
            .map(|(s, (&cp, &ce))| TrajectoryPoint {
                time: s.time,
                masses: s.masses,
                cp,
                ce,
                infusion_rate: schedule.infusion_rate_at(s.time),
            })
            .collect();
        debug!("simulated {} points", grid.len());
        Ok(Trajectory {
            points,
            stats: output.stats,
        })
    }

    /// Effect-site concentration at `time`, simulated on a uniform grid of
    /// at most `resolution` minutes that ends exactly at `time`.
    pub fn predict_ce(
        &self,
        schedule: &DosingSchedule,
        time: f64,
        resolution: f64,
        sink: &dyn DiagnosticSink,
    ) -> TciResult<f64> {
        let grid = time_grid(time, resolution).map_err(|e| rejected(sink, "session", e))?;
        let trajectory = self.simulate(schedule, &grid, sink)?;
        Ok(trajectory.last().map_or(0.0, |p| p.ce))
    }
}
