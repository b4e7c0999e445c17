//! Configuration system for rungs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment. The user-level file lives at
//! `~/.config/rungs/config.toml` (platform equivalent via `directories`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::experiment::ExperimentSpec;
use crate::resources::Resources;
use crate::result::ResultSchema;

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Total resource budget shared by all running trials.
    #[serde(default = "default_total_resources")]
    pub resources: Resources,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Where to write the final trial table, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub experiments: Vec<ExperimentSpec>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            resources: default_total_resources(),
            checkpoint_dir: default_checkpoint_dir(),
            snapshot_path: None,
            experiments: Vec::new(),
        }
    }
}

fn default_total_resources() -> Resources {
    let cpu = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    Resources::new(cpu, 0)
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".rungs/checkpoints")
}

impl TuneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.resources.cpu == 0 && self.resources.gpu == 0 {
            return Err(ConfigError::Invalid {
                message: "resource budget must include at least one CPU or GPU".into(),
            });
        }
        for experiment in &self.experiments {
            if !experiment.resources.fits_within(&self.resources) {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "experiment '{}' requires {} per trial but the budget is {}",
                        experiment.name, experiment.resources, self.resources
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Which scheduling policy drives the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Hyperband,
    Fifo,
}

/// Scheduler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,
    /// Result field used as the monotonic progress axis.
    #[serde(default = "default_time_attr")]
    pub time_attr: String,
    /// Result field to rank trials on, higher is better.
    #[serde(default = "default_reward_attr")]
    pub reward_attr: String,
    /// Budget ceiling in `time_attr` units.
    #[serde(default = "default_max_t")]
    pub max_t: f64,
    /// Reduction factor; 1/eta of each rung is promoted.
    #[serde(default = "default_eta")]
    pub eta: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::default(),
            time_attr: default_time_attr(),
            reward_attr: default_reward_attr(),
            max_t: default_max_t(),
            eta: default_eta(),
        }
    }
}

fn default_time_attr() -> String {
    "training_iteration".to_string()
}

fn default_reward_attr() -> String {
    "episode_reward_mean".to_string()
}

fn default_max_t() -> f64 {
    81.0
}

fn default_eta() -> f64 {
    3.0
}

impl SchedulerConfig {
    pub fn schema(&self) -> ResultSchema {
        ResultSchema::new(&self.time_attr, &self.reward_attr)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_attr.trim().is_empty() || self.reward_attr.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "time_attr and reward_attr must be non-empty".into(),
            });
        }
        if !self.max_t.is_finite() || self.max_t < 1.0 {
            return Err(ConfigError::Invalid {
                message: format!("max_t must be a finite number >= 1, got {}", self.max_t),
            });
        }
        // Milestones are floored to whole time units; eta >= 2 keeps them strictly increasing.
        if !self.eta.is_finite() || self.eta < 2.0 {
            return Err(ConfigError::Invalid {
                message: format!("eta must be a finite number >= 2, got {}", self.eta),
            });
        }
        Ok(())
    }
}

/// Load configuration with layered merging.
///
/// Merge order (later wins):
/// 1. Built-in defaults
/// 2. User config (`<config dir>/rungs/config.toml`)
/// 3. `file`, when given
/// 4. Environment variables prefixed with `RUNGS_` (`__` separates nesting,
///    e.g. `RUNGS_SCHEDULER__MAX_T=100`)
pub fn load_config(file: Option<&Path>) -> Result<TuneConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TuneConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "rungs", "rungs") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed("RUNGS_").split("__"));

    figment.extract().map_err(Box::new)
}
