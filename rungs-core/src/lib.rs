//! # Rungs Core
//!
//! Trial scheduling and lifecycle engine for iterative training jobs.
//! Provides the trial state machine, HyperBand successive-halving brackets,
//! the executor contract with an in-process implementation, and the runner
//! loop that ties them together under a resource budget.

pub mod config;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod persistence;
pub mod resources;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod trainable;
pub mod trial;

// Re-export commonly used types at the crate root.
pub use config::{SchedulerConfig, SchedulerKind, TuneConfig, load_config};
pub use error::{
    ConfigError, ExecutorError, ResourceError, Result, ResultError, SchedulerError,
    TrainableError, TrialError, TuneError,
};
pub use executor::{ExecutorEvent, LocalExecutor, TrialExecutor};
pub use experiment::{ExperimentSpec, StopCriteria};
pub use resources::{ResourceLedger, Resources};
pub use result::{ResultFields, ResultSchema, TrialResult};
pub use runner::{BestTrial, RunSummary, RunnerOptions, TrialRunner};
pub use scheduler::{
    Bracket, BracketDecision, FifoScheduler, HyperBandScheduler, TrialDecision, TrialScheduler,
};
pub use trainable::{Trainable, TrainableRegistry, TrialActor};
pub use trial::{Trial, TrialConfig, TrialId, TrialStatus};
