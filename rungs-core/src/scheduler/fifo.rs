//! First-in, first-out scheduling with no early stopping.

use std::collections::HashMap;

use super::{TrialDecision, TrialScheduler};
use crate::config::SchedulerConfig;
use crate::error::{ConfigError, SchedulerError};
use crate::resources::Resources;
use crate::result::TrialResult;
use crate::trial::{Trial, TrialId};

/// Runs every trial to completion in admission order.
#[derive(Debug, Default)]
pub struct FifoScheduler {
    admitted: HashMap<TrialId, u64>,
    next_seq: u64,
    completed: usize,
    errored: usize,
}

impl FifoScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::default())
    }
}

impl TrialScheduler for FifoScheduler {
    fn on_trial_add(&mut self, trial: &Trial) {
        self.admitted.insert(trial.id, self.next_seq);
        self.next_seq += 1;
    }

    fn on_trial_result(
        &mut self,
        trial: &Trial,
        _result: &TrialResult,
    ) -> Result<TrialDecision, SchedulerError> {
        if !self.admitted.contains_key(&trial.id) {
            return Err(SchedulerError::UnknownTrial { id: trial.id });
        }
        Ok(TrialDecision::Continue)
    }

    fn on_trial_error(&mut self, _trial: &Trial) {
        self.errored += 1;
    }

    fn on_trial_complete(&mut self, _trial: &Trial) {
        self.completed += 1;
    }

    fn choose_trial_to_run(
        &mut self,
        candidates: &[&Trial],
        available: &Resources,
    ) -> Option<TrialId> {
        candidates
            .iter()
            .filter(|t| t.resources().fits_within(available))
            .min_by_key(|t| self.admitted.get(&t.id).copied().unwrap_or(u64::MAX))
            .map(|t| t.id)
    }

    fn summary(&self) -> String {
        format!(
            "FIFO: {} admitted, {} completed, {} errored",
            self.admitted.len(),
            self.completed,
            self.errored
        )
    }
}
