use crate::error::TciResult;
use crate::ke0::Ke0Selection;
use crate::models::PkParameters;
use crate::optimizer::{AdjustmentEvent, OptimizationResult, StepDownResult};
use crate::patient::PatientParameters;
use crate::simulation::{CohortReport, Trajectory};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct SessionSummary<'a> {
    pub patient: &'a PatientParameters,
    pub pk: &'a PkParameters,
    pub ke0: &'a Ke0Selection,
    pub peak_ce: Option<f64>,
    pub time_of_peak_ce: Option<f64>,
}

impl<'a> SessionSummary<'a> {
    pub fn new(
        patient: &'a PatientParameters,
        pk: &'a PkParameters,
        ke0: &'a Ke0Selection,
        trajectory: &Trajectory,
    ) -> Self {
        let peak = trajectory.peak_ce();
        Self {
            patient,
            pk,
            ke0,
            peak_ce: peak.map(|p| p.ce),
            time_of_peak_ce: peak.map(|p| p.time),
        }
    }
}

pub fn save_simulation<P: AsRef<Path>>(
    summary: &SessionSummary<'_>,
    trajectory: &Trajectory,
    output_dir: P,
) -> TciResult<()> {
    let output_path = output_dir.as_ref();
    save_trajectory(trajectory, output_path.join("trajectory.csv"))?;
    save_json(summary, output_path.join("summary.json"))?;
    info!("Simulation results saved to {:?}", output_path);
    Ok(())
}

pub fn save_optimization<P: AsRef<Path>>(
    summary: &SessionSummary<'_>,
    result: &OptimizationResult,
    trajectory: &Trajectory,
    output_dir: P,
) -> TciResult<()> {
    let output_path = output_dir.as_ref();
    save_json(result, output_path.join("optimization.json"))?;
    save_trajectory(trajectory, output_path.join("trajectory.csv"))?;
    save_json(summary, output_path.join("summary.json"))?;
    info!("Optimization results saved to {:?}", output_path);
    Ok(())
}

pub fn save_step_down<P: AsRef<Path>>(
    summary: &SessionSummary<'_>,
    result: &StepDownResult,
    output_dir: P,
) -> TciResult<()> {
    let output_path = output_dir.as_ref();
    save_adjustments(&result.adjustments, output_path.join("adjustments.csv"))?;
    save_trajectory(&result.trajectory, output_path.join("trajectory.csv"))?;
    save_json(summary, output_path.join("summary.json"))?;
    info!("Step-down results saved to {:?}", output_path);
    Ok(())
}

pub fn save_cohort<P: AsRef<Path>>(report: &CohortReport, output_dir: P) -> TciResult<()> {
    let output_path = output_dir.as_ref();
    save_cohort_records(report, output_path.join("cohort.csv"))?;
    save_json(&report.summary, output_path.join("cohort_summary.json"))?;
    info!("Cohort results saved to {:?}", output_path);
    Ok(())
}

pub fn save_trajectory<P: AsRef<Path>>(trajectory: &Trajectory, path: P) -> TciResult<()> {
    let mut writer = csv::Writer::from_path(path)?;

    writer.write_record([
        "TIME", "A1", "A2", "A3", "CP", "CE", "RATE",
    ])?;

    for p in &trajectory.points {
        writer.write_record(&[
            p.time.to_string(),
            p.masses[0].to_string(),
            p.masses[1].to_string(),
            p.masses[2].to_string(),
            p.cp.to_string(),
            p.ce.to_string(),
            p.infusion_rate.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn save_adjustments<P: AsRef<Path>>(adjustments: &[AdjustmentEvent], path: P) -> TciResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["TIME", "RATE_BEFORE", "RATE_AFTER", "CE_TRIGGER"])?;
    for a in adjustments {
        writer.write_record(&[
            a.time.to_string(),
            a.rate_before.to_string(),
            a.rate_after.to_string(),
            a.ce_trigger.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn save_cohort_records<P: AsRef<Path>>(report: &CohortReport, path: P) -> TciResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "ID", "AGE", "WEIGHT", "HEIGHT", "SEX", "ASA", "KE0_EXACT", "KE0_REGRESSION", "KE0", "DISAGREEMENT",
    ])?;

    let optional = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    for r in &report.records {
        writer.write_record(&[
            r.id.to_string(),
            r.patient.age().to_string(),
            r.patient.weight().to_string(),
            r.patient.height().to_string(),
            r.patient.sex().code().to_string(),
            r.patient.asa().code().to_string(),
            optional(r.exact),
            r.regression.to_string(),
            optional(r.selected),
            optional(r.disagreement),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn save_json<T: Serialize + ?Sized, P: AsRef<Path>>(value: &T, path: P) -> TciResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;
    use crate::dosing::{DoseEvent, DosingSchedule};
    use crate::patient::{AsaClass, Sex};
    use crate::simulation::{time_grid, Session, SessionSettings};

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tci_sim_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_save_simulation_writes_csv_and_json() {
        let patient = PatientParameters::new(45.0, 70.0, 170.0, Sex::Male, AsaClass::OneToTwo).unwrap();
        let session = Session::new(patient, &SessionSettings::default(), &NullSink).unwrap();
        let schedule = DosingSchedule::new(vec![DoseEvent::bolus(0.0, 14.0)]).unwrap();
        let trajectory = session
            .simulate(&schedule, &time_grid(10.0, 1.0).unwrap(), &NullSink)
            .unwrap();
        let summary = SessionSummary::new(session.patient(), session.pk(), session.ke0(), &trajectory);

        let dir = scratch_dir("simulation");
        save_simulation(&summary, &trajectory, &dir).unwrap();

        let mut reader = csv::Reader::from_path(dir.join("trajectory.csv")).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[4], "CP");
        assert_eq!(reader.records().count(), 11);

        let json: serde_json::Value =
            serde_json::from_reader(File::open(dir.join("summary.json")).unwrap()).unwrap();
        assert!(json["ke0"]["ke0"].as_f64().unwrap() > 0.0);
        assert_eq!(json["patient"]["asa"], "I-II");

        std::fs::remove_dir_all(dir).ok();
    }
}
