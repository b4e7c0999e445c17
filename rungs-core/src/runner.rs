//! The trial runner: the single control loop behind a tuning run.
//!
//! The runner owns the trial table, the scheduler, the executor, and the
//! resource ledger. It is the only place trial status changes. Each loop turn
//! it terminates trials the scheduler gave up on, launches as many trials as
//! the budget and the scheduler allow, then waits for one executor event and
//! applies the resulting decision.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::TuneConfig;
use crate::error::{ExecutorError, ResourceError, TuneError};
use crate::executor::{ExecutorEvent, TrialExecutor};
use crate::persistence::atomic_write_json;
use crate::resources::{ResourceLedger, Resources};
use crate::result::{ResultFields, ResultSchema, TrialResult};
use crate::scheduler::{TrialDecision, TrialScheduler};
use crate::trial::{Trial, TrialId, TrialStatus};

/// Runner settings that do not belong to the scheduler.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Total budget shared by running trials.
    pub resources: Resources,
    /// Checkpoints go under `<checkpoint_dir>/<trial_id>/`.
    pub checkpoint_dir: PathBuf,
    pub schema: ResultSchema,
    pub snapshot_path: Option<PathBuf>,
}

impl RunnerOptions {
    pub fn from_config(config: &TuneConfig) -> Self {
        Self {
            resources: config.resources,
            checkpoint_dir: config.checkpoint_dir.clone(),
            schema: config.scheduler.schema(),
            snapshot_path: config.snapshot_path.clone(),
        }
    }
}

/// Best trial of a run by its last reported reward.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestTrial {
    pub id: TrialId,
    pub reward: f64,
    pub time: f64,
}

/// Outcome counts of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub terminated: usize,
    pub errored: usize,
    pub best: Option<BestTrial>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trials: {} terminated, {} errored",
            self.total, self.terminated, self.errored
        )?;
        if let Some(best) = &self.best {
            write!(
                f,
                "; best trial {} (reward {:.4} at t={})",
                best.id, best.reward, best.time
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RunSnapshot<'a> {
    summary: &'a RunSummary,
    trials: &'a [Trial],
}

/// Drives trials through an executor under a scheduling policy.
pub struct TrialRunner<E: TrialExecutor> {
    trials: Vec<Trial>,
    index: HashMap<TrialId, usize>,
    scheduler: Box<dyn TrialScheduler>,
    executor: E,
    ledger: ResourceLedger,
    options: RunnerOptions,
}

impl<E: TrialExecutor> TrialRunner<E> {
    pub fn new(scheduler: Box<dyn TrialScheduler>, executor: E, options: RunnerOptions) -> Self {
        Self {
            trials: Vec::new(),
            index: HashMap::new(),
            scheduler,
            executor,
            ledger: ResourceLedger::new(options.resources),
            options,
        }
    }

    /// Add a pending trial to the pool.
    pub fn add_trial(&mut self, trial: Trial) -> Result<TrialId, TuneError> {
        if !trial.resources().fits_within(&self.ledger.total()) {
            return Err(ResourceError::Exceeds {
                requested: *trial.resources(),
                available: self.ledger.total(),
            }
            .into());
        }
        let id = trial.id;
        if self.index.contains_key(&id) {
            return Ok(id);
        }
        self.scheduler.on_trial_add(&trial);
        self.index.insert(id, self.trials.len());
        self.trials.push(trial);
        debug!(trial_id = %id, "Trial added");
        Ok(id)
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn trial(&self, id: &TrialId) -> Option<&Trial> {
        self.index.get(id).map(|&idx| &self.trials[idx])
    }

    pub fn scheduler(&self) -> &dyn TrialScheduler {
        self.scheduler.as_ref()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Run until no trial is running and none can be started.
    pub async fn run(&mut self) -> Result<RunSummary, TuneError> {
        self.scheduler.seal();
        info!(
            trials = self.trials.len(),
            budget = %self.ledger.total(),
            "Run started"
        );

        loop {
            self.terminate_stale().await;
            self.launch_trials().await;

            let Some(running) = self.first_running() else {
                break;
            };
            let Some(event) = self.executor.next_event().await else {
                error!("Executor stopped producing events with trials still running");
                self.stop_all_running("executor disconnected").await;
                return Err(ExecutorError::Disconnected { id: running }.into());
            };
            self.handle_event(event).await?;
        }

        self.finish().await
    }

    /// Summary of the trial table as it stands.
    pub fn summary(&self) -> RunSummary {
        let count = |status: TrialStatus| self.trials.iter().filter(|t| t.status() == status).count();
        let best = self
            .trials
            .iter()
            .filter_map(|t| {
                t.last_reward().map(|reward| BestTrial {
                    id: t.id,
                    reward,
                    time: t.time_total(),
                })
            })
            .max_by(|a, b| a.reward.total_cmp(&b.reward));
        RunSummary {
            total: self.trials.len(),
            terminated: count(TrialStatus::Terminated),
            errored: count(TrialStatus::Errored),
            best,
        }
    }

    fn first_running(&self) -> Option<TrialId> {
        self.trials
            .iter()
            .find(|t| t.status() == TrialStatus::Running)
            .map(|t| t.id)
    }

    async fn terminate_stale(&mut self) {
        for id in self.scheduler.take_stale() {
            if let Some(&idx) = self.index.get(&id) {
                self.terminate_trial(idx, "culled").await;
            }
        }
    }

    async fn launch_trials(&mut self) {
        loop {
            let available = self.ledger.available();
            let chosen = {
                let candidates: Vec<&Trial> = self
                    .trials
                    .iter()
                    .filter(|t| matches!(t.status(), TrialStatus::Pending | TrialStatus::Paused))
                    .collect();
                self.scheduler.choose_trial_to_run(&candidates, &available)
            };
            let Some(id) = chosen else {
                break;
            };
            if !self.start_trial(id).await {
                break;
            }
        }
    }

    /// Start or resume a trial; `false` if it could not be launched at all.
    async fn start_trial(&mut self, id: TrialId) -> bool {
        let Some(&idx) = self.index.get(&id) else {
            warn!(trial_id = %id, "Scheduler chose an unknown trial");
            return false;
        };
        let resources = *self.trials[idx].resources();
        if let Err(err) = self.ledger.acquire(&resources) {
            warn!(trial_id = %id, error = %err, "Scheduler chose a trial that does not fit");
            return false;
        }

        let trial = &mut self.trials[idx];
        let resuming = trial.status() == TrialStatus::Paused;
        let transition = if resuming {
            trial.resume()
        } else {
            trial.start()
        };
        if let Err(err) = transition {
            self.ledger.release(&resources);
            warn!(trial_id = %id, error = %err, "Cannot launch trial");
            return false;
        }

        let checkpoint = if resuming {
            self.trials[idx].latest_checkpoint().map(Path::to_path_buf)
        } else {
            None
        };
        let started = self
            .executor
            .start_trial(&self.trials[idx], checkpoint.as_deref())
            .await;
        match started {
            Ok(()) if resuming => info!(trial_id = %id, "Trial resumed"),
            Ok(()) => info!(trial_id = %id, "Trial started"),
            Err(err) => self.fail_trial(idx, err.to_string()).await,
        }
        true
    }

    async fn handle_event(&mut self, event: ExecutorEvent) -> Result<(), TuneError> {
        let id = event.trial_id();
        let Some(&idx) = self.index.get(&id) else {
            debug!(trial_id = %id, "Event for unknown trial discarded");
            return Ok(());
        };
        let status = self.trials[idx].status();
        if status != TrialStatus::Running {
            debug!(trial_id = %id, %status, "Late event discarded");
            return Ok(());
        }

        match event {
            ExecutorEvent::Error { message, .. } => {
                self.fail_trial(idx, message).await;
                Ok(())
            }
            ExecutorEvent::Result { fields, .. } => self.handle_result(idx, fields).await,
        }
    }

    async fn handle_result(&mut self, idx: usize, fields: ResultFields) -> Result<(), TuneError> {
        let id = self.trials[idx].id;
        let result = match TrialResult::from_fields(fields, &self.options.schema) {
            Ok(result) => result,
            Err(err) => {
                error!(trial_id = %id, error = %err, "Invalid result, aborting run");
                self.stop_all_running("run aborted").await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.trials[idx].record_result(&result) {
            self.fail_trial(idx, err.to_string()).await;
            return Ok(());
        }

        let trial = &self.trials[idx];
        let decision = if result.done || trial.stop_criteria().should_stop(&result) {
            TrialDecision::Stop
        } else {
            match self.scheduler.on_trial_result(trial, &result) {
                Ok(decision) => decision,
                Err(err) => {
                    self.fail_trial(idx, err.to_string()).await;
                    return Ok(());
                }
            }
        };
        debug!(
            trial_id = %id,
            time = result.time,
            reward = result.reward,
            decision = %decision,
            "Result handled"
        );

        match decision {
            TrialDecision::Continue => {
                if let Err(err) = self.executor.continue_trial(id).await {
                    self.fail_trial(idx, err.to_string()).await;
                }
            }
            TrialDecision::Pause => self.pause_trial(idx).await,
            TrialDecision::Stop => self.terminate_trial(idx, "stopped").await,
        }
        Ok(())
    }

    async fn pause_trial(&mut self, idx: usize) {
        let id = self.trials[idx].id;
        if !self.trials[idx].is_resumable() {
            debug!(trial_id = %id, "Trial cannot checkpoint, stopping instead of pausing");
            self.terminate_trial(idx, "not resumable").await;
            return;
        }

        let dir = self.options.checkpoint_dir.join(id.to_string());
        let saved = self.executor.save_trial(id, &dir).await;
        let path = match saved {
            Ok(path) => path,
            Err(err) => {
                self.fail_trial(idx, err.to_string()).await;
                return;
            }
        };

        let trial = &mut self.trials[idx];
        if let Err(err) = trial.pause(path) {
            warn!(trial_id = %id, error = %err, "Cannot pause trial");
            return;
        }
        self.ledger.release(trial.resources());
        info!(trial_id = %id, time = trial.time_total(), "Trial paused");

        if let Err(err) = self.executor.stop_trial(id).await {
            warn!(trial_id = %id, error = %err, "Failed to stop paused trial's worker");
        }
    }

    async fn terminate_trial(&mut self, idx: usize, reason: &str) {
        let trial = &mut self.trials[idx];
        let id = trial.id;
        let was_running = trial.status() == TrialStatus::Running;
        if trial.status().is_terminal() {
            return;
        }
        if let Err(err) = trial.terminate() {
            warn!(trial_id = %id, error = %err, "Cannot terminate trial");
            return;
        }
        if was_running {
            self.ledger.release(trial.resources());
        }
        info!(trial_id = %id, reason, time = trial.time_total(), "Trial terminated");
        self.scheduler.on_trial_complete(&self.trials[idx]);

        if was_running && let Err(err) = self.executor.stop_trial(id).await {
            warn!(trial_id = %id, error = %err, "Failed to stop trial's worker");
        }
    }

    async fn fail_trial(&mut self, idx: usize, message: String) {
        let trial = &mut self.trials[idx];
        let id = trial.id;
        let was_running = trial.status() == TrialStatus::Running;
        if let Err(err) = trial.fail(message.clone()) {
            warn!(trial_id = %id, error = %err, "Cannot mark trial errored");
            return;
        }
        if was_running {
            self.ledger.release(trial.resources());
        }
        warn!(trial_id = %id, error = %message, "Trial errored");
        self.scheduler.on_trial_error(&self.trials[idx]);

        // The worker may never have started or may already be gone.
        let _ = self.executor.stop_trial(id).await;
    }

    async fn stop_all_running(&mut self, reason: &str) {
        let running: Vec<usize> = self
            .trials
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status() == TrialStatus::Running)
            .map(|(idx, _)| idx)
            .collect();
        for idx in running {
            self.terminate_trial(idx, reason).await;
        }
    }

    async fn finish(&mut self) -> Result<RunSummary, TuneError> {
        let paused: Vec<usize> = self
            .trials
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status() == TrialStatus::Paused)
            .map(|(idx, _)| idx)
            .collect();
        for idx in paused {
            self.terminate_trial(idx, "never promoted").await;
        }

        let pending = self
            .trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Pending)
            .count();
        if pending > 0 {
            warn!(pending, "Run finished with trials that never started");
        }

        let summary = self.summary();
        if let Some(path) = &self.options.snapshot_path {
            let snapshot = RunSnapshot {
                summary: &summary,
                trials: &self.trials,
            };
            if let Err(err) = atomic_write_json(path, &snapshot) {
                warn!(path = %path.display(), error = %err, "Failed to write run snapshot");
            }
        }
        debug!(scheduler = %self.scheduler.summary(), "Final scheduler state");
        info!(
            total = summary.total,
            terminated = summary.terminated,
            errored = summary.errored,
            best_reward = summary.best.as_ref().map(|b| b.reward),
            "Run finished"
        );
        Ok(summary)
    }
}
