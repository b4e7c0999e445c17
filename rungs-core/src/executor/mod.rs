//! Trial execution backends.
//!
//! An executor owns the workers behind running trials. The runner asks it to
//! start, step, checkpoint, and stop trials, and pulls results back one event
//! at a time through [`TrialExecutor::next_event`].

pub mod local;

pub use local::LocalExecutor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::ExecutorError;
use crate::result::ResultFields;
use crate::trial::{Trial, TrialId};

/// Something a running trial produced.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// Raw fields of one training step, not yet validated.
    Result {
        trial_id: TrialId,
        fields: ResultFields,
    },
    /// The trial's worker failed; it produces nothing further.
    Error { trial_id: TrialId, message: String },
}

impl ExecutorEvent {
    pub fn trial_id(&self) -> TrialId {
        match self {
            ExecutorEvent::Result { trial_id, .. } | ExecutorEvent::Error { trial_id, .. } => {
                *trial_id
            }
        }
    }
}

/// Runs trials on behalf of the runner.
///
/// Every started trial has at most one step in flight: `start_trial` and
/// `continue_trial` each request exactly one more result.
#[async_trait]
pub trait TrialExecutor: Send {
    /// Create the trial's worker, restoring from `checkpoint` when given, and
    /// request its first step.
    async fn start_trial(
        &mut self,
        trial: &Trial,
        checkpoint: Option<&Path>,
    ) -> Result<(), ExecutorError>;

    /// Request the next step of a running trial.
    async fn continue_trial(&mut self, id: TrialId) -> Result<(), ExecutorError>;

    /// Checkpoint a running trial under `dir`; returns the checkpoint path.
    async fn save_trial(&mut self, id: TrialId, dir: &Path) -> Result<PathBuf, ExecutorError>;

    /// Tear down the trial's worker. Results it already produced may still
    /// arrive and must be discarded by the caller.
    async fn stop_trial(&mut self, id: TrialId) -> Result<(), ExecutorError>;

    /// Wait for the next event; `None` when nothing can produce one.
    async fn next_event(&mut self) -> Option<ExecutorEvent>;
}
