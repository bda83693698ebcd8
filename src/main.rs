use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};

use tci_sim::config::Config;
use tci_sim::diagnostics::LogSink;
use tci_sim::optimizer::{DoseOptimizer, OptimizationRequest, StepDownProtocol};
use tci_sim::output::{self, SessionSummary};
use tci_sim::simulation::{CohortSampler, Session};

#[derive(Parser)]
#[command(name = "tci_sim")]
#[command(about = "Target-controlled infusion simulation and dose optimization")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, global = true, default_value = "output")]
    output: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate the configured dosing schedule
    Simulate,
    /// Search a bolus and infusion rate for the configured target
    Optimize,
    /// Run the step-down maintenance protocol
    StepDown,
    /// Compare exact and regression ke0 over a random cohort
    Cohort {
        /// Number of virtual patients (overrides the config)
        #[arg(short = 'n', long)]
        patients: Option<usize>,

        /// Random seed for reproducibility
        #[arg(short, long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let config_path = cli
        .config
        .as_ref()
        .context("a configuration file is required (--config)")?;
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;
    info!("Loaded configuration from {:?}", config_path);

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create output directory {:?}", cli.output))?;

    match cli.command {
        Command::Simulate => simulate(&config, &cli.output),
        Command::Optimize => optimize(&config, &cli.output),
        Command::StepDown => step_down(&config, &cli.output),
        Command::Cohort { patients, seed } => cohort(&config, &cli.output, patients, seed),
    }
}

fn open_session(config: &Config) -> Result<Session> {
    let session = Session::new(config.patient, &config.session_settings(), &LogSink)
        .context("could not set up a simulation session for this patient")?;
    if !session.ke0().is_exact() {
        warn!("Using regression ke0 ({:.4} /min)", session.ke0().ke0);
    }
    Ok(session)
}

fn simulate(config: &Config, output_dir: &Path) -> Result<()> {
    let session = open_session(config)?;
    let schedule = config.schedule()?;
    let grid = config.output_grid()?;
    let trajectory = session.simulate(&schedule, &grid, &LogSink)?;
    info!(
        "Simulated {} points ({} accepted steps, {} fallback spans)",
        trajectory.points.len(),
        trajectory.stats.accepted_steps,
        trajectory.stats.fallback_spans
    );

    let summary = SessionSummary::new(session.patient(), session.pk(), session.ke0(), &trajectory);
    output::save_simulation(&summary, &trajectory, output_dir)?;
    Ok(())
}

fn optimize(config: &Config, output_dir: &Path) -> Result<()> {
    let session = open_session(config)?;
    let optimizer = DoseOptimizer::new(config.optimizer.settings.clone())?;
    let result = optimizer.optimize(&session, &config.optimizer.request(), &LogSink)?;
    if !result.converged {
        warn!(
            "Optimizer did not converge: best Ce {:.4} vs target {:.4} ({:.1}% off)",
            result.predicted_ce,
            config.optimizer.target_ce,
            result.relative_error * 100.0
        );
    }

    let trajectory = session.simulate(&result.schedule()?, &config.output_grid()?, &LogSink)?;
    let summary = SessionSummary::new(session.patient(), session.pk(), session.ke0(), &trajectory);
    output::save_optimization(&summary, &result, &trajectory, output_dir)?;
    Ok(())
}

fn step_down(config: &Config, output_dir: &Path) -> Result<()> {
    let session = open_session(config)?;
    let settings = &config.step_down;
    let initial_rate = match settings.initial_rate {
        Some(rate) => rate,
        None => {
            let optimizer = DoseOptimizer::new(config.optimizer.settings.clone())?;
            let request = OptimizationRequest::new(settings.target_ce, config.optimizer.target_time)
                .with_boluses(vec![settings.bolus]);
            optimizer.optimize(&session, &request, &LogSink)?.rate_mg_kg_h
        }
    };

    let protocol = StepDownProtocol::new(settings.settings.clone())?;
    let result = protocol.run(&session, settings.target_ce, settings.bolus, initial_rate, &LogSink)?;
    let summary = SessionSummary::new(session.patient(), session.pk(), session.ke0(), &result.trajectory);
    output::save_step_down(&summary, &result, output_dir)?;
    Ok(())
}

fn cohort(config: &Config, output_dir: &Path, patients: Option<usize>, seed: Option<u64>) -> Result<()> {
    let n = patients.unwrap_or(config.cohort.size);
    match seed {
        Some(s) => info!("Starting cohort of {} patients (seed: {})", n, s),
        None => info!("Starting cohort of {} patients (random seed)", n),
    }
    let mut sampler = CohortSampler::new(config.cohort.ranges, seed)?;
    let report = sampler.run(n, config.ke0, &LogSink)?;
    output::save_cohort(&report, output_dir)?;
    Ok(())
}
