//! CLI subcommand handlers.

use crate::sigmoid;
use crate::{Commands, ConfigAction, RunArgs};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rungs_core::result::TIMESTEPS_TOTAL;
use rungs_core::{
    ConfigError, LocalExecutor, RunnerOptions, SchedulerKind, TrainableRegistry, TrialRunner,
    TuneConfig,
};
use std::path::Path;
use tracing::info;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args, config_path).await,
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn load(config_path: Option<&Path>) -> anyhow::Result<TuneConfig> {
    rungs_core::load_config(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&starter_config())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created starter configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(config_path)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Defaults plus the sigmoid demo experiment.
fn starter_config() -> TuneConfig {
    let mut config = TuneConfig::default();
    use_demo_scheduler(&mut config);
    config.experiments.push(sigmoid::demo_experiment());
    config
}

/// The demo measures progress in timesteps with a budget of 100.
fn use_demo_scheduler(config: &mut TuneConfig) {
    config.scheduler.time_attr = TIMESTEPS_TOTAL.to_string();
    config.scheduler.max_t = 100.0;
}

fn apply_overrides(config: &mut TuneConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(kind) = &args.scheduler {
        config.scheduler.kind = match kind.as_str() {
            "hyperband" => SchedulerKind::Hyperband,
            "fifo" => SchedulerKind::Fifo,
            other => anyhow::bail!("Unknown scheduler '{}': expected hyperband or fifo", other),
        };
    }
    if let Some(max_t) = args.max_t {
        config.scheduler.max_t = max_t;
    }
    if let Some(eta) = args.eta {
        config.scheduler.eta = eta;
    }
    if let Some(cpus) = args.cpus {
        config.resources.cpu = cpus;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    if let Some(path) = &args.snapshot {
        config.snapshot_path = Some(path.clone());
    }
    if let Some(repeat) = args.repeat {
        for experiment in &mut config.experiments {
            experiment.repeat = repeat;
        }
    }
    Ok(())
}

/// Resolve the effective configuration for `rungs run`.
fn run_config(config_path: Option<&Path>, args: &RunArgs) -> anyhow::Result<TuneConfig> {
    let mut config = load(config_path)?;
    if config.experiments.is_empty() {
        info!("No experiments configured, running the sigmoid demo");
        use_demo_scheduler(&mut config);
        config.experiments.push(sigmoid::demo_experiment());
    }
    apply_overrides(&mut config, args)?;
    config.validate()?;
    Ok(config)
}

async fn handle_run(args: RunArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = run_config(config_path, &args)?;

    let mut registry = TrainableRegistry::new();
    sigmoid::register(&mut registry);
    for experiment in &config.experiments {
        if !registry.contains(&experiment.run) {
            return Err(ConfigError::UnknownTrainable {
                name: experiment.run.clone(),
            }
            .into());
        }
    }

    let scheduler = rungs_core::scheduler::from_config(&config.scheduler)?;
    let executor = LocalExecutor::new(registry);
    let mut runner = TrialRunner::new(scheduler, executor, RunnerOptions::from_config(&config));

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    for experiment in &config.experiments {
        let trials = if experiment.run == sigmoid::NAME {
            experiment.trials_with(|_, base| sigmoid::sample_config(&mut rng, base))
        } else {
            experiment.trials()
        };
        info!(
            experiment = %experiment.name,
            trials = trials.len(),
            "Experiment queued"
        );
        for trial in trials {
            runner.add_trial(trial)?;
        }
    }

    let summary = runner.run().await?;
    println!("{}", runner.scheduler().summary());
    println!("{}", summary);
    if let Some(best) = &summary.best
        && let Some(trial) = runner.trial(&best.id)
    {
        println!(
            "Best config: {}",
            serde_json::Value::Object(trial.config().clone())
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_apply() {
        let mut config = starter_config();
        let args = RunArgs {
            repeat: Some(9),
            scheduler: Some("fifo".into()),
            max_t: Some(27.0),
            cpus: Some(2),
            ..Default::default()
        };
        apply_overrides(&mut config, &args).unwrap();
        assert_eq!(config.scheduler.kind, SchedulerKind::Fifo);
        assert_eq!(config.scheduler.max_t, 27.0);
        assert_eq!(config.resources.cpu, 2);
        assert_eq!(config.experiments[0].repeat, 9);
    }

    #[test]
    fn test_unknown_scheduler_rejected() {
        let mut config = TuneConfig::default();
        let args = RunArgs {
            scheduler: Some("asha".into()),
            ..Default::default()
        };
        assert!(apply_overrides(&mut config, &args).is_err());
    }

    #[test]
    fn test_run_config_falls_back_to_demo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "[resources]\ncpu = 4\n").unwrap();
        let config = run_config(Some(&path), &RunArgs::default()).unwrap();
        assert_eq!(config.experiments.len(), 1);
        assert_eq!(config.experiments[0].run, sigmoid::NAME);
        assert_eq!(config.scheduler.time_attr, TIMESTEPS_TOTAL);
        assert_eq!(config.scheduler.max_t, 100.0);
        assert_eq!(config.resources.cpu, 4);
    }

    #[test]
    fn test_starter_config_round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rungs.toml");
        std::fs::write(&path, toml::to_string_pretty(&starter_config()).unwrap()).unwrap();
        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.experiments[0].name, "hyperband_test");
        assert_eq!(loaded.experiments[0].repeat, 100);
        assert_eq!(loaded.scheduler.time_attr, TIMESTEPS_TOTAL);
    }

    #[tokio::test]
    async fn test_small_demo_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rungs.toml");
        std::fs::write(&path, "[resources]\ncpu = 2\n").unwrap();
        let args = RunArgs {
            repeat: Some(6),
            max_t: Some(9.0),
            seed: Some(1),
            checkpoint_dir: Some(dir.path().join("checkpoints")),
            snapshot: Some(dir.path().join("run.json")),
            ..Default::default()
        };
        handle_run(args, Some(&path)).await.unwrap();
        assert!(dir.path().join("run.json").exists());
    }
}
