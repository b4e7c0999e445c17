//! Error types for the rungs engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, result validation, trial lifecycle, scheduling,
//! execution, and resource accounting.

use uuid::Uuid;

use crate::resources::Resources;
use crate::trial::TrialStatus;

/// Top-level error type for the rungs engine.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Result error: {0}")]
    Result(#[from] ResultError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("No trainable registered under '{name}'")]
    UnknownTrainable { name: String },

    #[error("Configuration load error: {message}")]
    Load { message: String },
}

/// Errors raised while validating a reported result at the runner boundary.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("Result is missing required field '{field}'")]
    MissingField { field: String },

    #[error("Result field '{field}' is not a finite number")]
    NotNumeric { field: String },
}

/// Errors from the trial state machine.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("Invalid transition for trial {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("Trial {id} reported time {reported} after {previous}")]
    TimeRegression {
        id: Uuid,
        previous: f64,
        reported: f64,
    },
}

/// Errors from scheduler bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Trial {id} is not tracked by the scheduler")]
    UnknownTrial { id: Uuid },

    #[error("Trial {id} reported a result while not active in its bracket")]
    NotActive { id: Uuid },
}

/// Errors surfaced by a trial executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No trainable registered under '{name}'")]
    UnknownTrainable { name: String },

    #[error("Trial {id} failed to start: {message}")]
    Setup { id: Uuid, message: String },

    #[error("Checkpoint for trial {id} failed: {message}")]
    Checkpoint { id: Uuid, message: String },

    #[error("Trial {id} has no live worker")]
    NotRunning { id: Uuid },

    #[error("Worker for trial {id} disconnected")]
    Disconnected { id: Uuid },
}

/// Errors from the resource ledger.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Requested {requested} exceeds available {available}")]
    Exceeds {
        requested: Resources,
        available: Resources,
    },
}

/// Error returned by user trainables.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TrainableError {
    pub message: String,
}

impl TrainableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TrainableError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for TrainableError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A type alias for results using the top-level `TuneError`.
pub type Result<T> = std::result::Result<T, TuneError>;
