//! Scheduling policies.
//!
//! A scheduler sees every trial the runner admits and every validated result,
//! and answers with a [`TrialDecision`]. It never touches trial status itself;
//! the runner applies decisions.

pub mod bracket;
pub mod fifo;
pub mod hyperband;

pub use bracket::{Bracket, BracketDecision, MemberState, Rung};
pub use fifo::FifoScheduler;
pub use hyperband::HyperBandScheduler;

use serde::{Deserialize, Serialize};

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::error::{ConfigError, SchedulerError};
use crate::resources::Resources;
use crate::result::TrialResult;
use crate::trial::{Trial, TrialId};

/// What the runner should do with a trial after a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialDecision {
    Continue,
    Pause,
    Stop,
}

impl std::fmt::Display for TrialDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialDecision::Continue => write!(f, "continue"),
            TrialDecision::Pause => write!(f, "pause"),
            TrialDecision::Stop => write!(f, "stop"),
        }
    }
}

/// A trial scheduling policy driven by the runner.
pub trait TrialScheduler: Send {
    /// A new trial entered the pool.
    fn on_trial_add(&mut self, trial: &Trial);

    /// A validated result arrived for a running trial.
    fn on_trial_result(
        &mut self,
        trial: &Trial,
        result: &TrialResult,
    ) -> Result<TrialDecision, SchedulerError>;

    fn on_trial_error(&mut self, trial: &Trial);

    /// The trial was terminated.
    fn on_trial_complete(&mut self, trial: &Trial);

    /// Pick the next trial to start or resume among pending and paused
    /// `candidates` whose requirements fit in `available`.
    fn choose_trial_to_run(&mut self, candidates: &[&Trial], available: &Resources)
    -> Option<TrialId>;

    /// No more trials will be added.
    fn seal(&mut self) {}

    /// Paused trials the scheduler has given up on, to be terminated.
    fn take_stale(&mut self) -> Vec<TrialId> {
        Vec::new()
    }

    /// Whether a paused trial may run again.
    fn is_resumable(&self, _trial: &TrialId) -> bool {
        true
    }

    /// Human-readable state dump.
    fn summary(&self) -> String;
}

/// Build the scheduler selected by `config.kind`.
pub fn from_config(config: &SchedulerConfig) -> Result<Box<dyn TrialScheduler>, ConfigError> {
    let scheduler: Box<dyn TrialScheduler> = match config.kind {
        SchedulerKind::Hyperband => Box::new(HyperBandScheduler::new(config)?),
        SchedulerKind::Fifo => Box::new(FifoScheduler::new(config)?),
    };
    Ok(scheduler)
}
