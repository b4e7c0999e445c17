//! Experiment specifications and per-trial stop criteria.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resources::Resources;
use crate::result::TrialResult;
use crate::trial::{Trial, TrialConfig};

/// Stop a trial once any listed result field reaches its threshold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopCriteria(BTreeMap<String, f64>);

impl StopCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, threshold: f64) -> Self {
        self.0.insert(field.into(), threshold);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn should_stop(&self, result: &TrialResult) -> bool {
        self.0.iter().any(|(field, threshold)| {
            result
                .get_f64(field)
                .is_some_and(|value| value >= *threshold)
        })
    }
}

/// A named batch of trials sharing a trainable and resource requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    /// Registered trainable name.
    pub run: String,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub config: TrialConfig,
    #[serde(default)]
    pub stop: StopCriteria,
    #[serde(default = "default_true")]
    pub resumable: bool,
}

fn default_repeat() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl ExperimentSpec {
    pub fn new(name: &str, run: &str) -> Self {
        Self {
            name: name.to_string(),
            run: run.to_string(),
            repeat: default_repeat(),
            resources: Resources::default(),
            config: TrialConfig::new(),
            stop: StopCriteria::default(),
            resumable: true,
        }
    }

    /// Expand into `repeat` trials sharing the base configuration.
    pub fn trials(&self) -> Vec<Trial> {
        self.trials_with(|_, base| base.clone())
    }

    /// Expand into `repeat` trials, letting the caller derive each trial's
    /// configuration from its index and the base configuration.
    pub fn trials_with<F>(&self, mut derive: F) -> Vec<Trial>
    where
        F: FnMut(usize, &TrialConfig) -> TrialConfig,
    {
        (0..self.repeat)
            .map(|index| {
                let mut config = derive(index, &self.config);
                config
                    .entry("experiment")
                    .or_insert_with(|| serde_json::Value::String(self.name.clone()));
                Trial::new(&self.run, config, self.resources)
                    .with_stop(self.stop.clone())
                    .with_resumable(self.resumable)
            })
            .collect()
    }
}
