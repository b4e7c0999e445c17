//! HyperBand: a cycle of successive-halving brackets with different
//! exploration/exploitation trade-offs.
//!
//! Bracket `s` admits `ceil((s_max + 1) / (s + 1) * eta^s)` trials and gives
//! them `s` promotion rungs before the final budget `max_t`. The most
//! aggressive bracket (`s = s_max`) is filled first; each full bracket opens
//! the next shape down to `s = 0` (plain random search), then the cycle
//! repeats.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use super::bracket::{Bracket, BracketDecision};
use super::{TrialDecision, TrialScheduler};
use crate::config::SchedulerConfig;
use crate::error::{ConfigError, SchedulerError};
use crate::resources::Resources;
use crate::result::TrialResult;
use crate::trial::{Trial, TrialId, TrialStatus};

const EPS: f64 = 1e-9;

/// Number of promotion rungs of the most aggressive bracket.
pub fn s_max(max_t: f64, eta: f64) -> usize {
    ((max_t.ln() / eta.ln()) + EPS).floor().max(0.0) as usize
}

/// Admission capacity of bracket `s`.
pub fn bracket_capacity(s_max: usize, s: usize, eta: f64) -> usize {
    ((s_max + 1) as f64 / (s + 1) as f64 * eta.powi(s as i32) - EPS)
        .ceil()
        .max(1.0) as usize
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    bracket: usize,
    seq: u64,
}

/// Bracket-based early stopping.
#[derive(Debug)]
pub struct HyperBandScheduler {
    eta: f64,
    max_t: f64,
    s_max: usize,
    brackets: Vec<Bracket>,
    filling: Option<usize>,
    next_s: usize,
    admissions: HashMap<TrialId, Admission>,
    next_seq: u64,
    stopped: HashSet<TrialId>,
    sealed: bool,
}

impl HyperBandScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let s_max = s_max(config.max_t, config.eta);
        info!(
            max_t = config.max_t,
            eta = config.eta,
            s_max,
            "HyperBand scheduler initialized"
        );
        Ok(Self {
            eta: config.eta,
            max_t: config.max_t,
            s_max,
            brackets: Vec::new(),
            filling: None,
            next_s: s_max,
            admissions: HashMap::new(),
            next_seq: 0,
            stopped: HashSet::new(),
            sealed: false,
        })
    }

    pub fn s_max(&self) -> usize {
        self.s_max
    }

    pub fn brackets(&self) -> &[Bracket] {
        &self.brackets
    }

    pub fn bracket_of(&self, trial: &TrialId) -> Option<&Bracket> {
        self.admissions
            .get(trial)
            .map(|admission| &self.brackets[admission.bracket])
    }

    fn open_bracket(&mut self) -> usize {
        let s = self.next_s;
        self.next_s = if s == 0 { self.s_max } else { s - 1 };
        let index = self.brackets.len();
        let capacity = bracket_capacity(self.s_max, s, self.eta);
        self.brackets
            .push(Bracket::new(index, s, capacity, self.eta, self.max_t));
        self.filling = Some(index);
        debug!(bracket = index, s, capacity, "Opened bracket");
        index
    }

    fn admission_seq(&self, trial: &TrialId) -> u64 {
        self.admissions
            .get(trial)
            .map(|admission| admission.seq)
            .unwrap_or(u64::MAX)
    }

    fn mark_stopped(&mut self, trial: &TrialId) -> Option<usize> {
        self.stopped.insert(*trial);
        self.admissions.get(trial).map(|admission| admission.bracket)
    }
}

impl TrialScheduler for HyperBandScheduler {
    fn on_trial_add(&mut self, trial: &Trial) {
        if self.admissions.contains_key(&trial.id) {
            return;
        }
        let index = match self.filling {
            Some(index) if self.brackets[index].is_admitting() => index,
            _ => self.open_bracket(),
        };
        let bracket = &mut self.brackets[index];
        bracket.add_trial(trial.id);
        if self.sealed {
            bracket.close_admission();
        }
        if !bracket.is_admitting() {
            self.filling = None;
        }
        self.admissions.insert(
            trial.id,
            Admission {
                bracket: index,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        debug!(trial_id = %trial.id, bracket = index, "Trial admitted");
    }

    fn on_trial_result(
        &mut self,
        trial: &Trial,
        result: &TrialResult,
    ) -> Result<TrialDecision, SchedulerError> {
        let admission = *self
            .admissions
            .get(&trial.id)
            .ok_or(SchedulerError::UnknownTrial { id: trial.id })?;
        if self.stopped.contains(&trial.id) {
            debug!(trial_id = %trial.id, time = result.time, "Result for stopped trial discarded");
            return Ok(TrialDecision::Stop);
        }

        let bracket = &mut self.brackets[admission.bracket];
        let decision = match bracket.on_result(trial.id, result.time, result.reward)? {
            BracketDecision::Continue => TrialDecision::Continue,
            BracketDecision::Pause => TrialDecision::Pause,
            BracketDecision::Stop => TrialDecision::Stop,
        };
        let decision = if result.time >= self.max_t {
            TrialDecision::Stop
        } else {
            decision
        };
        if decision == TrialDecision::Stop {
            self.stopped.insert(trial.id);
        }

        debug!(
            trial_id = %trial.id,
            bracket = admission.bracket,
            time = result.time,
            reward = result.reward,
            decision = %decision,
            "HyperBand decision"
        );
        Ok(decision)
    }

    fn on_trial_error(&mut self, trial: &Trial) {
        if let Some(index) = self.mark_stopped(&trial.id) {
            self.brackets[index].on_error(&trial.id);
        }
    }

    fn on_trial_complete(&mut self, trial: &Trial) {
        if let Some(index) = self.mark_stopped(&trial.id) {
            self.brackets[index].on_finished(&trial.id);
        }
    }

    fn choose_trial_to_run(
        &mut self,
        candidates: &[&Trial],
        available: &Resources,
    ) -> Option<TrialId> {
        let fits = |t: &&&Trial| t.resources().fits_within(available);

        let promoted = candidates
            .iter()
            .filter(fits)
            .filter(|t| {
                t.status() == TrialStatus::Paused
                    && t.latest_checkpoint().is_some()
                    && self.is_resumable(&t.id)
            })
            .min_by_key(|t| self.admission_seq(&t.id))
            .map(|t| t.id);
        if let Some(id) = promoted {
            if let Some(admission) = self.admissions.get(&id) {
                self.brackets[admission.bracket].on_resume(&id);
            }
            return Some(id);
        }

        candidates
            .iter()
            .filter(fits)
            .filter(|t| t.status() == TrialStatus::Pending && !self.stopped.contains(&t.id))
            .min_by_key(|t| self.admission_seq(&t.id))
            .map(|t| t.id)
    }

    fn seal(&mut self) {
        self.sealed = true;
        if let Some(index) = self.filling.take() {
            self.brackets[index].close_admission();
        }
    }

    fn take_stale(&mut self) -> Vec<TrialId> {
        let stale: Vec<TrialId> = self
            .brackets
            .iter_mut()
            .flat_map(Bracket::take_culled)
            .collect();
        self.stopped.extend(stale.iter().copied());
        stale
    }

    fn is_resumable(&self, trial: &TrialId) -> bool {
        self.bracket_of(trial)
            .is_some_and(|bracket| bracket.is_resumable(trial))
    }

    fn summary(&self) -> String {
        let mut out = format!(
            "HyperBand(eta={}, max_t={}, s_max={}): {} brackets, {} trials",
            self.eta,
            self.max_t,
            self.s_max,
            self.brackets.len(),
            self.admissions.len()
        );
        for bracket in &self.brackets {
            out.push('\n');
            out.push_str(&bracket.to_string());
        }
        out
    }
}
