//! Trials and their lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::TrialError;
use crate::experiment::StopCriteria;
use crate::resources::Resources;
use crate::result::TrialResult;

/// Identifier of a trial.
pub type TrialId = Uuid;

/// Immutable key-value configuration of a trial.
pub type TrialConfig = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Terminated,
    Errored,
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialStatus::Pending => write!(f, "pending"),
            TrialStatus::Running => write!(f, "running"),
            TrialStatus::Paused => write!(f, "paused"),
            TrialStatus::Terminated => write!(f, "terminated"),
            TrialStatus::Errored => write!(f, "errored"),
        }
    }
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Terminated | TrialStatus::Errored)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) | (Running, Terminated) => true,
            (Paused, Running) | (Paused, Terminated) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One configuration under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Name of the registered trainable that runs this trial.
    pub trainable: String,
    config: TrialConfig,
    status: TrialStatus,
    resources: Resources,
    stop: StopCriteria,
    resumable: bool,
    time_total: f64,
    last_result: Option<TrialResult>,
    metric_history: Vec<(f64, f64)>,
    checkpoints: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    /// Create a new pending trial.
    pub fn new(trainable: impl Into<String>, config: TrialConfig, resources: Resources) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trainable: trainable.into(),
            config,
            status: TrialStatus::Pending,
            resources,
            stop: StopCriteria::default(),
            resumable: true,
            time_total: 0.0,
            last_result: None,
            metric_history: Vec::new(),
            checkpoints: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stop(mut self, stop: StopCriteria) -> Self {
        self.stop = stop;
        self
    }

    /// Mark the trial as unable to checkpoint; a PAUSE decision then stops it.
    pub fn with_resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn stop_criteria(&self) -> &StopCriteria {
        &self.stop
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    /// Cumulative progress in `time_attr` units.
    pub fn time_total(&self) -> f64 {
        self.time_total
    }

    pub fn last_result(&self) -> Option<&TrialResult> {
        self.last_result.as_ref()
    }

    pub fn last_reward(&self) -> Option<f64> {
        self.last_result.as_ref().map(|r| r.reward)
    }

    /// Append-only `(time, reward)` history.
    pub fn metric_history(&self) -> &[(f64, f64)] {
        &self.metric_history
    }

    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    pub fn latest_checkpoint(&self) -> Option<&Path> {
        self.checkpoints.last().map(PathBuf::as_path)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<(), TrialError> {
        if self.status != TrialStatus::Pending {
            return Err(self.invalid(TrialStatus::Running));
        }
        self.set_status(TrialStatus::Running);
        Ok(())
    }

    /// `Paused -> Running`.
    pub fn resume(&mut self) -> Result<(), TrialError> {
        if self.status != TrialStatus::Paused {
            return Err(self.invalid(TrialStatus::Running));
        }
        self.set_status(TrialStatus::Running);
        Ok(())
    }

    /// `Running -> Paused`, remembering the checkpoint to resume from.
    pub fn pause(&mut self, checkpoint: PathBuf) -> Result<(), TrialError> {
        self.transition(TrialStatus::Paused)?;
        self.checkpoints.push(checkpoint);
        Ok(())
    }

    /// `Running | Paused -> Terminated`.
    pub fn terminate(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Terminated)
    }

    /// Any non-terminal state `-> Errored`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TrialError> {
        self.transition(TrialStatus::Errored)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Record a result reported while running.
    pub fn record_result(&mut self, result: &TrialResult) -> Result<(), TrialError> {
        if self.status != TrialStatus::Running {
            return Err(self.invalid(TrialStatus::Running));
        }
        if result.time < self.time_total {
            return Err(TrialError::TimeRegression {
                id: self.id,
                previous: self.time_total,
                reported: result.time,
            });
        }
        self.time_total = result.time;
        self.metric_history.push((result.time, result.reward));
        self.last_result = Some(result.clone());
        self.updated_at = Utc::now();
        Ok(())
    }

    fn transition(&mut self, next: TrialStatus) -> Result<(), TrialError> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        self.set_status(next);
        Ok(())
    }

    fn set_status(&mut self, next: TrialStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: TrialStatus) -> TrialError {
        TrialError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}
