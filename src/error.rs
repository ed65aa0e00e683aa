//! Error types for the turnover risk pipeline
//!
//! Core modules return [`Result`]; the command line layer wraps these in
//! `anyhow` with context.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TurnoverError {
    /// Required artifacts are missing, unreadable, or inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Prediction requested while the artifact bundle is not loaded
    #[error("Service unavailable: model artifacts not loaded ({0})")]
    NotReady(String),

    /// Input failed schema or range validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Training cannot proceed on the given data
    #[error("Training infeasible: {0}")]
    TrainingInfeasible(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, TurnoverError>;

impl TurnoverError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn infeasible(message: impl Into<String>) -> Self {
        Self::TrainingInfeasible(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_message_names_the_cause() {
        let err = TurnoverError::NotReady("scaler missing".to_string());
        let message = err.to_string();
        assert!(message.starts_with("Service unavailable"));
        assert!(message.contains("scaler missing"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TurnoverError = io.into();
        assert!(matches!(err, TurnoverError::Io(_)));
    }
}
