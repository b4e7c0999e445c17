//! Integration tests for the trial runner.
//!
//! These tests drive whole runs through the `LocalExecutor` with a
//! deterministic learning-curve trainable, so checkpoints are real files and
//! every step happens on a worker thread.

use async_trait::async_trait;
use rungs_core::error::{ExecutorError, ResultError, TrainableError, TuneError};
use rungs_core::executor::{ExecutorEvent, LocalExecutor, TrialExecutor};
use rungs_core::result::ResultFields;
use rungs_core::scheduler;
use rungs_core::trainable::{Trainable, TrainableRegistry};
use rungs_core::{
    ExperimentSpec, Resources, RunnerOptions, SchedulerConfig, SchedulerKind, StopCriteria, Trial,
    TrialConfig, TrialId, TrialRunner, TrialStatus, TuneConfig,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type RestoreLog = Arc<Mutex<Vec<(String, PathBuf)>>>;

/// `height * tanh(step / width)`, with failure switches read from the config.
#[derive(Default)]
struct Curve {
    log: RestoreLog,
    name: String,
    step: u64,
    height: f64,
    width: f64,
    fail_save: bool,
    fail_at: Option<u64>,
    panic_at: Option<u64>,
    omit_reward: bool,
}

impl Trainable for Curve {
    fn setup(&mut self, config: &TrialConfig) -> Result<(), TrainableError> {
        self.name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.height = config.get("height").and_then(|v| v.as_f64()).unwrap_or(1.0);
        self.width = config.get("width").and_then(|v| v.as_f64()).unwrap_or(5.0);
        self.fail_save = config.contains_key("fail_save");
        self.fail_at = config.get("fail_at").and_then(|v| v.as_u64());
        self.panic_at = config.get("panic_at").and_then(|v| v.as_u64());
        self.omit_reward = config.contains_key("omit_reward");
        Ok(())
    }

    fn train_step(&mut self) -> Result<ResultFields, TrainableError> {
        self.step += 1;
        if self.fail_at == Some(self.step) {
            return Err(TrainableError::new("diverged"));
        }
        if self.panic_at == Some(self.step) {
            panic!("nan in gradients");
        }
        let mut fields = ResultFields::new();
        if !self.omit_reward {
            let reward = self.height * (self.step as f64 / self.width).tanh();
            fields.insert("episode_reward_mean".into(), json!(reward));
        }
        fields.insert("timesteps_this_iter".into(), json!(1));
        Ok(fields)
    }

    fn save(&mut self, checkpoint_dir: &Path) -> Result<PathBuf, TrainableError> {
        if self.fail_save {
            return Err(TrainableError::new("read-only filesystem"));
        }
        let path = checkpoint_dir.join("curve.json");
        std::fs::write(&path, serde_json::to_string(&json!({ "step": self.step }))?)?;
        Ok(path)
    }

    fn restore(&mut self, checkpoint_path: &Path) -> Result<(), TrainableError> {
        let state: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(checkpoint_path)?)?;
        self.step = state["step"]
            .as_u64()
            .ok_or_else(|| TrainableError::new("checkpoint has no step"))?;
        self.log
            .lock()
            .unwrap()
            .push((self.name.clone(), checkpoint_path.to_path_buf()));
        Ok(())
    }
}

fn registry(log: &RestoreLog) -> TrainableRegistry {
    let mut registry = TrainableRegistry::new();
    let log = log.clone();
    registry.register("curve", move || {
        Box::new(Curve {
            log: log.clone(),
            ..Default::default()
        })
    });
    registry
}

fn curve_trial(name: &str, height: f64) -> Trial {
    let mut config = TrialConfig::new();
    config.insert("name".into(), json!(name));
    config.insert("height".into(), json!(height));
    Trial::new("curve", config, Resources::new(1, 0))
}

fn with_flag(trial: Trial, flag: &str, value: serde_json::Value) -> Trial {
    let mut config = trial.config().clone();
    config.insert(flag.into(), value);
    Trial::new(&trial.trainable, config, *trial.resources())
}

fn tune_config(kind: SchedulerKind, cpu: u32, dir: &TempDir) -> TuneConfig {
    TuneConfig {
        scheduler: SchedulerConfig {
            kind,
            max_t: 9.0,
            eta: 3.0,
            ..Default::default()
        },
        resources: Resources::new(cpu, 0),
        checkpoint_dir: dir.path().join("checkpoints"),
        ..Default::default()
    }
}

fn runner<E: TrialExecutor>(config: &TuneConfig, executor: E) -> TrialRunner<E> {
    TrialRunner::new(
        scheduler::from_config(&config.scheduler).unwrap(),
        executor,
        RunnerOptions::from_config(config),
    )
}

#[tokio::test]
async fn test_hyperband_promotes_top_third_of_first_rung() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 1, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));

    // Best trials are admitted first; one CPU keeps arrivals in admission order.
    let mut ids = Vec::new();
    for k in 0..9 {
        let height = (9 - k) as f64;
        ids.push(runner.add_trial(curve_trial(&format!("t{k}"), height)).unwrap());
    }
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.total, 9);
    assert_eq!(summary.terminated, 9);
    assert_eq!(summary.best.as_ref().map(|b| b.id), Some(ids[0]));

    let times: Vec<f64> = ids
        .iter()
        .map(|id| runner.trial(id).unwrap().time_total())
        .collect();
    assert_eq!(times, vec![9.0, 3.0, 3.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);

    let best = runner.trial(&ids[0]).unwrap();
    let progress: Vec<f64> = best.metric_history().iter().map(|(t, _)| *t).collect();
    assert_eq!(progress, (1..=9).map(|t| t as f64).collect::<Vec<_>>());
    assert_eq!(runner.ledger().in_use(), Resources::zero());
}

#[tokio::test]
async fn test_resume_restores_own_latest_checkpoint() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 1, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    let mut names = HashMap::new();
    for k in 0..9 {
        let name = format!("t{k}");
        let id = runner
            .add_trial(curve_trial(&name, (9 - k) as f64))
            .unwrap();
        names.insert(name, id);
    }
    runner.run().await.unwrap();

    let restores = log.lock().unwrap().clone();
    assert!(!restores.is_empty());
    let mut by_trial: HashMap<TrialId, Vec<PathBuf>> = HashMap::new();
    for (name, path) in restores {
        by_trial.entry(names[&name]).or_default().push(path);
    }
    for (id, paths) in by_trial {
        let trial = runner.trial(&id).unwrap();
        // The i-th resume restores the i-th checkpoint taken by this trial.
        assert_eq!(paths.as_slice(), &trial.checkpoints()[..paths.len()]);
        for path in &paths {
            assert!(path.starts_with(dir.path().join("checkpoints").join(id.to_string())));
        }
    }
}

#[tokio::test]
async fn test_parallel_run_respects_rung_caps() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 3, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    for k in 0..9 {
        runner
            .add_trial(curve_trial(&format!("t{k}"), (k + 1) as f64))
            .unwrap();
    }
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.terminated, 9);
    let reached = |t: f64| {
        runner
            .trials()
            .iter()
            .filter(|trial| trial.time_total() >= t)
            .count()
    };
    assert_eq!(reached(1.0), 9);
    assert!(reached(3.0) <= 3);
    assert_eq!(reached(9.0), 1);
    assert!(runner.trials().iter().all(|t| t.time_total() <= 9.0));
}

#[tokio::test]
async fn test_experiment_spec_drives_fifo_run() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let mut config = tune_config(SchedulerKind::Fifo, 2, &dir);
    let mut spec = ExperimentSpec::new("fifo_test", "curve");
    spec.repeat = 4;
    spec.stop = StopCriteria::new().with("training_iteration", 5.0);
    config.experiments.push(spec);
    config.validate().unwrap();

    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    for trial in config.experiments[0].trials() {
        runner.add_trial(trial).unwrap();
    }
    let summary = runner.run().await.unwrap();
    assert_eq!(summary.terminated, 4);
    for trial in runner.trials() {
        assert_eq!(trial.time_total(), 5.0);
        let result = trial.last_result().unwrap();
        assert_eq!(result.get_f64("timesteps_total"), Some(5.0));
        assert_eq!(result.get("experiment"), None);
        assert_eq!(trial.config()["experiment"], json!("fifo_test"));
    }
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_trial_failure_does_not_abort_siblings() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Fifo, 2, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    let stop = StopCriteria::new().with("training_iteration", 4.0);

    let failing = runner
        .add_trial(with_flag(curve_trial("bad", 1.0), "fail_at", json!(2)).with_stop(stop.clone()))
        .unwrap();
    let panicking = runner
        .add_trial(with_flag(curve_trial("worse", 1.0), "panic_at", json!(3)).with_stop(stop.clone()))
        .unwrap();
    let healthy = runner
        .add_trial(curve_trial("good", 1.0).with_stop(stop))
        .unwrap();
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.errored, 2);
    assert_eq!(summary.terminated, 1);
    let failing = runner.trial(&failing).unwrap();
    assert_eq!(failing.status(), TrialStatus::Errored);
    assert_eq!(failing.error(), Some("diverged"));
    assert!(
        runner
            .trial(&panicking)
            .unwrap()
            .error()
            .unwrap()
            .contains("panicked")
    );
    assert_eq!(runner.trial(&healthy).unwrap().time_total(), 4.0);
}

#[tokio::test]
async fn test_checkpoint_failure_errors_trial() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 1, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    let broken = runner
        .add_trial(with_flag(curve_trial("broken", 2.0), "fail_save", json!(true)))
        .unwrap();
    let survivor = runner.add_trial(curve_trial("survivor", 1.0)).unwrap();
    let summary = runner.run().await.unwrap();

    let broken = runner.trial(&broken).unwrap();
    assert_eq!(broken.status(), TrialStatus::Errored);
    assert!(broken.error().unwrap().contains("read-only filesystem"));
    assert!(broken.checkpoints().is_empty());
    assert_eq!(runner.trial(&survivor).unwrap().time_total(), 9.0);
    assert_eq!(summary.errored, 1);
}

#[tokio::test]
async fn test_missing_reward_aborts_run() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 2, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    runner
        .add_trial(with_flag(curve_trial("silent", 1.0), "omit_reward", json!(true)))
        .unwrap();
    runner.add_trial(curve_trial("fine", 1.0)).unwrap();

    let err = runner.run().await.unwrap_err();
    assert!(matches!(
        err,
        TuneError::Result(ResultError::MissingField { .. })
    ));
    assert!(
        runner
            .trials()
            .iter()
            .all(|t| t.status() != TrialStatus::Running)
    );
}

#[tokio::test]
async fn test_unknown_trainable_errors_trial() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Fifo, 1, &dir);
    let mut runner = runner(&config, LocalExecutor::new(registry(&log)));
    let id = runner
        .add_trial(Trial::new("missing", TrialConfig::new(), Resources::new(1, 0)))
        .unwrap();
    let summary = runner.run().await.unwrap();
    assert_eq!(summary.errored, 1);
    assert!(
        runner
            .trial(&id)
            .unwrap()
            .error()
            .unwrap()
            .contains("missing")
    );
}

/// Tracks the resources held by live workers of the wrapped executor.
struct Metered<E> {
    inner: E,
    held: HashMap<TrialId, Resources>,
    peak_cpu: u32,
}

#[async_trait]
impl<E: TrialExecutor> TrialExecutor for Metered<E> {
    async fn start_trial(
        &mut self,
        trial: &Trial,
        checkpoint: Option<&Path>,
    ) -> Result<(), ExecutorError> {
        self.inner.start_trial(trial, checkpoint).await?;
        self.held.insert(trial.id, *trial.resources());
        let cpu = self.held.values().map(|r| r.cpu).sum();
        self.peak_cpu = self.peak_cpu.max(cpu);
        Ok(())
    }

    async fn continue_trial(&mut self, id: TrialId) -> Result<(), ExecutorError> {
        self.inner.continue_trial(id).await
    }

    async fn save_trial(&mut self, id: TrialId, dir: &Path) -> Result<PathBuf, ExecutorError> {
        self.inner.save_trial(id, dir).await
    }

    async fn stop_trial(&mut self, id: TrialId) -> Result<(), ExecutorError> {
        self.held.remove(&id);
        self.inner.stop_trial(id).await
    }

    async fn next_event(&mut self) -> Option<ExecutorEvent> {
        self.inner.next_event().await
    }
}

#[tokio::test]
async fn test_running_trials_never_exceed_budget() {
    let dir = TempDir::new().unwrap();
    let log = RestoreLog::default();
    let config = tune_config(SchedulerKind::Hyperband, 3, &dir);
    let executor = Metered {
        inner: LocalExecutor::new(registry(&log)),
        held: HashMap::new(),
        peak_cpu: 0,
    };
    let mut runner = runner(&config, executor);
    for k in 0..12 {
        let mut trial = curve_trial(&format!("t{k}"), (k % 5) as f64);
        if k % 4 == 0 {
            trial = Trial::new("curve", trial.config().clone(), Resources::new(2, 0));
        }
        runner.add_trial(trial).unwrap();
    }
    runner.run().await.unwrap();

    let peak = runner.executor().peak_cpu;
    assert!(peak <= 3, "peak usage {peak} CPU over a budget of 3");
    assert!(peak >= 2);
    assert!(runner.trials().iter().all(|t| t.status().is_terminal()));
}
