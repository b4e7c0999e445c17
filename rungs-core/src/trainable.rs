//! The trainable contract, a name registry, and the actor wrapper that keeps
//! the standard progress fields consistent across checkpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::error::TrainableError;
use crate::persistence::{atomic_write_json, load_json};
use crate::result::{
    DONE, ResultFields, TIME_THIS_ITER_S, TIME_TOTAL_S, TIMESTAMP, TIMESTEPS_THIS_ITER,
    TIMESTEPS_TOTAL, TRAINING_ITERATION, TRIAL_ID,
};
use crate::trial::{TrialConfig, TrialId};

const METADATA_FILE: &str = ".tune_metadata.json";

/// User code run by a trial.
///
/// Implementations must be resumable: `restore` followed by further
/// `train_step` calls behaves as if `save` had never interrupted execution.
pub trait Trainable: Send {
    fn setup(&mut self, config: &TrialConfig) -> Result<(), TrainableError>;

    /// One incremental unit of work.
    fn train_step(&mut self) -> Result<ResultFields, TrainableError>;

    /// Persist enough state under `checkpoint_dir` to resume; returns the
    /// path later handed to `restore`.
    fn save(&mut self, checkpoint_dir: &Path) -> Result<PathBuf, TrainableError>;

    fn restore(&mut self, checkpoint_path: &Path) -> Result<(), TrainableError>;
}

/// Builds a fresh trainable instance.
pub type TrainableFactory = Arc<dyn Fn() -> Box<dyn Trainable> + Send + Sync>;

/// Trainables addressable by name from experiment specs.
#[derive(Clone, Default)]
pub struct TrainableRegistry {
    factories: HashMap<String, TrainableFactory>,
}

impl TrainableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Trainable> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Trainable>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TrainableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainableRegistry")
            .field("trainables", &self.names())
            .finish()
    }
}

/// Progress counters saved alongside each checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ActorProgress {
    iteration: u64,
    timesteps_total: f64,
    time_total_s: f64,
}

/// Wraps a [`Trainable`] and fills in the standard result fields.
pub struct TrialActor {
    trial_id: TrialId,
    inner: Box<dyn Trainable>,
    progress: ActorProgress,
}

impl TrialActor {
    pub fn new(trial_id: TrialId, inner: Box<dyn Trainable>) -> Self {
        Self {
            trial_id,
            inner,
            progress: ActorProgress::default(),
        }
    }

    pub fn iteration(&self) -> u64 {
        self.progress.iteration
    }

    pub fn setup(&mut self, config: &TrialConfig) -> Result<(), TrainableError> {
        self.inner.setup(config)
    }

    /// Run one step and annotate its result.
    pub fn step(&mut self) -> Result<ResultFields, TrainableError> {
        let started = Instant::now();
        let mut fields = self.inner.train_step()?;
        let elapsed = started.elapsed().as_secs_f64();

        self.progress.iteration += 1;
        self.progress.time_total_s += elapsed;
        if let Some(steps) = fields.get(TIMESTEPS_THIS_ITER).and_then(|v| v.as_f64()) {
            self.progress.timesteps_total += steps;
        }

        fields.insert(
            TRAINING_ITERATION.into(),
            serde_json::json!(self.progress.iteration),
        );
        fields
            .entry(TIMESTEPS_TOTAL)
            .or_insert_with(|| serde_json::json!(self.progress.timesteps_total));
        fields.insert(TIME_THIS_ITER_S.into(), serde_json::json!(elapsed));
        fields.insert(
            TIME_TOTAL_S.into(),
            serde_json::json!(self.progress.time_total_s),
        );
        fields.entry(DONE).or_insert(serde_json::Value::Bool(false));
        fields.insert(
            TRIAL_ID.into(),
            serde_json::Value::String(self.trial_id.to_string()),
        );
        fields.insert(
            TIMESTAMP.into(),
            serde_json::json!(chrono::Utc::now().timestamp()),
        );
        Ok(fields)
    }

    /// Checkpoint into `<base_dir>/checkpoint_<iteration>/`.
    pub fn save(&mut self, base_dir: &Path) -> Result<PathBuf, TrainableError> {
        let dir = base_dir.join(format!("checkpoint_{}", self.progress.iteration));
        std::fs::create_dir_all(&dir)?;
        let path = self.inner.save(&dir)?;
        atomic_write_json(&dir.join(METADATA_FILE), &self.progress)?;
        Ok(path)
    }

    pub fn restore(&mut self, checkpoint_path: &Path) -> Result<(), TrainableError> {
        let dir = if checkpoint_path.is_dir() {
            checkpoint_path
        } else {
            checkpoint_path.parent().unwrap_or(checkpoint_path)
        };
        let progress: ActorProgress = load_json(&dir.join(METADATA_FILE))?.ok_or_else(|| {
            TrainableError::new(format!(
                "no checkpoint metadata next to {}",
                checkpoint_path.display()
            ))
        })?;
        self.inner.restore(checkpoint_path)?;
        self.progress = progress;
        Ok(())
    }
}
