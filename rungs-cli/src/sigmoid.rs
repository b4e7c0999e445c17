//! Demo trainable: a noiseless sigmoid learning curve.
//!
//! Each step reports `height * tanh(timestep / width)` as the reward and one
//! timestep of progress, so runs finish instantly and rank predictably.

use rand::Rng;
use rungs_core::result::{ResultFields, TIMESTEPS_THIS_ITER};
use rungs_core::{
    ExperimentSpec, Resources, StopCriteria, Trainable, TrainableError, TrainableRegistry,
    TrialConfig,
};
use serde_json::json;
use std::path::{Path, PathBuf};

pub const NAME: &str = "sigmoid";

#[derive(Debug, Default)]
pub struct SigmoidTrainable {
    timestep: u64,
    width: f64,
    height: f64,
}

fn required(config: &TrialConfig, key: &str) -> Result<f64, TrainableError> {
    config
        .get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| TrainableError::new(format!("config key '{key}' must be a number")))
}

impl Trainable for SigmoidTrainable {
    fn setup(&mut self, config: &TrialConfig) -> Result<(), TrainableError> {
        self.timestep = 0;
        self.width = required(config, "width")?;
        self.height = required(config, "height")?;
        if self.width <= 0.0 {
            return Err(TrainableError::new("width must be positive"));
        }
        Ok(())
    }

    fn train_step(&mut self) -> Result<ResultFields, TrainableError> {
        self.timestep += 1;
        let reward = (self.timestep as f64 / self.width).tanh() * self.height;
        let mut fields = ResultFields::new();
        fields.insert("episode_reward_mean".into(), json!(reward));
        fields.insert(TIMESTEPS_THIS_ITER.into(), json!(1));
        Ok(fields)
    }

    fn save(&mut self, checkpoint_dir: &Path) -> Result<PathBuf, TrainableError> {
        let path = checkpoint_dir.join("checkpoint");
        std::fs::write(&path, serde_json::to_vec(&json!({ "timestep": self.timestep }))?)?;
        Ok(path)
    }

    fn restore(&mut self, checkpoint_path: &Path) -> Result<(), TrainableError> {
        let state: serde_json::Value = serde_json::from_slice(&std::fs::read(checkpoint_path)?)?;
        self.timestep = state["timestep"]
            .as_u64()
            .ok_or_else(|| TrainableError::new("checkpoint is missing 'timestep'"))?;
        Ok(())
    }
}

pub fn register(registry: &mut TrainableRegistry) {
    registry.register(NAME, || Box::new(SigmoidTrainable::default()));
}

/// The demo experiment: 100 sigmoid trials, one CPU each.
pub fn demo_experiment() -> ExperimentSpec {
    let mut spec = ExperimentSpec::new("hyperband_test", NAME);
    spec.repeat = 100;
    spec.resources = Resources::new(1, 0);
    spec.stop = StopCriteria::new().with("training_iteration", 99_999.0);
    spec
}

/// Fill in a random curve shape unless the base configuration fixes it.
pub fn sample_config<R: Rng>(rng: &mut R, base: &TrialConfig) -> TrialConfig {
    let mut config = base.clone();
    config
        .entry("width")
        .or_insert_with(|| json!(rng.gen_range(10..=100)));
    config
        .entry("height")
        .or_insert_with(|| json!(rng.gen_range(0..=100)));
    config
}
