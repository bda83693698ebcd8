use thiserror::Error;

use crate::integrator::IntegrationFailure;
use crate::ke0::RootFindingFailure;

#[derive(Error, Debug)]
pub enum TciError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid dosing schedule: {0}")]
    InvalidDosing(String),

    #[error("Numeric integration failure: {0}")]
    NumericIntegration(#[from] IntegrationFailure),

    #[error("Root finding failure: {0}")]
    RootFinding(#[from] RootFindingFailure),

    #[error("Safety error: {0}")]
    Safety(String),
}

pub type TciResult<T> = Result<T, TciError>;
