//! Target-controlled infusion simulation for a three-compartment
//! population model with an effect-site compartment.

pub mod config;
pub mod diagnostics;
pub mod dosing;
pub mod effect_site;
pub mod error;
pub mod integrator;
pub mod ke0;
pub mod models;
pub mod optimizer;
pub mod output;
pub mod patient;
pub mod simulation;
pub mod units;

pub use config::Config;
pub use error::{TciError, TciResult};
pub use patient::{AsaClass, PatientParameters, Sex};
pub use simulation::{Session, SessionSettings, Simulator, Trajectory};
