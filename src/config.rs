use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dosing::{DoseEvent, DosingSchedule};
use crate::error::{TciError, TciResult};
use crate::integrator::IntegratorOptions;
use crate::ke0::Ke0Bounds;
use crate::optimizer::{OptimizationRequest, OptimizerSettings, StepDownSettings};
use crate::patient::PatientParameters;
use crate::simulation::{time_grid, CohortRanges, SessionSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub patient: PatientParameters,
    #[serde(default)]
    pub dosing: DosingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub ke0: Ke0Bounds,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub step_down: StepDownConfig,
    #[serde(default)]
    pub cohort: CohortConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DosingConfig {
    #[serde(default)]
    pub events: Vec<DoseEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub end_time: f64,    // min
    pub output_step: f64, // min
    pub integrator: IntegratorOptions,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            end_time: 120.0,
            output_step: 0.5,
            integrator: IntegratorOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_target_ce")]
    pub target_ce: f64,
    #[serde(default = "default_target_time")]
    pub target_time: f64,
    #[serde(default = "default_boluses")]
    pub boluses: Vec<f64>,
    #[serde(default)]
    pub settings: OptimizerSettings,
}

fn default_target_ce() -> f64 {
    1.0
}

fn default_target_time() -> f64 {
    20.0
}

fn default_boluses() -> Vec<f64> {
    vec![0.0]
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            target_ce: default_target_ce(),
            target_time: default_target_time(),
            boluses: default_boluses(),
            settings: OptimizerSettings::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn request(&self) -> OptimizationRequest {
        OptimizationRequest::new(self.target_ce, self.target_time).with_boluses(self.boluses.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDownConfig {
    #[serde(default = "default_target_ce")]
    pub target_ce: f64,
    #[serde(default)]
    pub bolus: f64,
    #[serde(default)]
    pub initial_rate: Option<f64>, // mg/kg/h, optimized when absent
    #[serde(default)]
    pub settings: StepDownSettings,
}

impl Default for StepDownConfig {
    fn default() -> Self {
        Self {
            target_ce: default_target_ce(),
            bolus: 0.0,
            initial_rate: None,
            settings: StepDownSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default = "default_cohort_size")]
    pub size: usize,
    #[serde(default)]
    pub ranges: CohortRanges,
}

fn default_cohort_size() -> usize {
    100
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            size: default_cohort_size(),
            ranges: CohortRanges::default(),
        }
    }
}

impl Config {
    pub fn new(patient: PatientParameters) -> Self {
        Self {
            patient,
            dosing: DosingConfig::default(),
            simulation: SimulationConfig::default(),
            ke0: Ke0Bounds::default(),
            optimizer: OptimizerConfig::default(),
            step_down: StepDownConfig::default(),
            cohort: CohortConfig::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> TciResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> TciResult<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TciResult<()> {
        self.session_settings().validate()?;
        self.schedule()?;
        self.output_grid()?;
        self.optimizer.settings.validate()?;
        self.step_down.settings.validate()?;
        self.cohort.ranges.validate()?;

        if self.optimizer.boluses.is_empty() {
            return Err(TciError::Validation(
                "optimizer.boluses must list at least one candidate".to_string(),
            ));
        }
        if let Some(rate) = self.step_down.initial_rate {
            if !(rate >= 0.0 && rate.is_finite()) {
                return Err(TciError::InvalidDosing(format!(
                    "step_down.initial_rate must be non-negative (got {})",
                    rate
                )));
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            integrator: self.simulation.integrator.clone(),
            ke0_bounds: self.ke0,
        }
    }

    pub fn schedule(&self) -> TciResult<DosingSchedule> {
        DosingSchedule::new(self.dosing.events.clone())
    }

    pub fn output_grid(&self) -> TciResult<Vec<f64>> {
        time_grid(self.simulation.end_time, self.simulation.output_step)
    }
}
