use clap::Parser;
use stagesweep_runner::{
    artifacts::ArtifactResolver,
    collector::Collector,
    config::{ConfigErrors, SweepConfig},
    distributed::{DistributionError, Runtime, Runtimes},
    executors::Executors,
    sweep::{Sweep, SweepError, SweepResults},
    trainer::{ChainedTrainer, ExternalTrainer},
};
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

/// Staged hyper-parameter sweeps over an external learner
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Arguments {
    /// YAML sweep configuration
    config: PathBuf,
    /// default log filter, RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
    /// validate the configuration and list the stages without training
    #[arg(long)]
    dry_run: bool,
}

#[derive(Error, Debug)]
enum RunnerError {
    #[error("{0}")]
    Config(#[from] ConfigErrors),
    #[error("{0}")]
    Distribution(#[from] DistributionError),
    #[error("{0}")]
    Sweep(#[from] SweepError),
}

fn main() -> ExitCode {
    let arguments = Arguments::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&arguments.log_level)),
        )
        .init();

    match run(&arguments) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(arguments: &Arguments) -> Result<(), RunnerError> {
    let mut config = SweepConfig::load(&arguments.config)?;
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }
    let data = Collector::load(&config.data)?.into_paths();
    let grids = config.grids(&config.namespaces(&data)?)?;

    let runtime = Runtimes::load(&config.runtime)?;
    let span = info_span!("node", id = runtime.node_id());
    let _enter = span.enter();

    if arguments.dry_run {
        for grid in grids.iter() {
            info!(
                promote = grid.promote,
                output = grid.output,
                "Stage {} with {} points",
                grid.name,
                grid.points.len()
            );
        }
        return Ok(());
    }

    let executor = Executors::load(&config.executor)?;
    let trainer =
        ExternalTrainer::load(&config.trainer, ArtifactResolver::new(&config.artifacts.root));
    let base = config.base();

    let sweep = Sweep::new(&runtime, &executor).with_checkpoint(config.checkpoint.clone());
    let caches = sweep.prepare(&trainer, &base, &data)?;
    let results = sweep.run(
        &grids,
        base.generalized(),
        &ChainedTrainer::new(&trainer, caches.clone()),
    )?;

    let predictions = match &config.predict {
        Some(predict) => {
            let overrides = predict.overrides.iter().cloned().collect();
            sweep.predict(&trainer, &caches, &results, &overrides)
        }
        None => SweepResults::new(),
    };
    for (name, result) in predictions.iter() {
        info!(loss = result.loss, "Predicted with {name}: {}", result.configuration);
    }

    if let Some(report) = &config.report {
        sweep.write_report(&results, &predictions, report)?;
    }

    info!("Sweep finished with {} results", results.len());
    Ok(())
}
