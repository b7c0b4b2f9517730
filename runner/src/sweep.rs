use crate::{
    command::{product, CommandError, Configuration, CACHE_FLAG},
    distributed::{DistributionError, Runtime},
    executors::Executors,
    grid::{points_to_file, Grid, GridError},
    trainer::{Evaluator, ExternalTrainer, TrainingResult},
};
use itertools::Itertools;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, info_span, instrument, warn};

/// winners of every stage keyed by `<stage>_<index>`
pub type SweepResults = BTreeMap<String, TrainingResult>;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Stage {0} has no candidate configurations")]
    EmptyGrid(String),
    #[error("{0}")]
    InvalidGrid(#[from] GridError),
    #[error("Failed to combine node results: {0}")]
    Distribution(#[from] DistributionError),
    #[error("Failed to checkpoint candidates: {0}")]
    Checkpoint(#[from] CommandError),
    #[error("No cache partition could be built")]
    NoPartitions,
    #[error("Failed to write report: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Drives the stages of a sweep across the pool of this node and the runtime
#[derive(Debug)]
pub struct Sweep<'a, R: Runtime> {
    runtime: &'a R,
    executor: &'a Executors,
    checkpoint: Option<PathBuf>,
}

impl<'a, R: Runtime> Sweep<'a, R> {
    pub fn new(runtime: &'a R, executor: &'a Executors) -> Self {
        Self {
            runtime,
            executor,
            checkpoint: None,
        }
    }

    /// store the expanded candidates of every stage as `<folder>/<stage>.jsonl`
    pub fn with_checkpoint(mut self, folder: Option<PathBuf>) -> Self {
        self.checkpoint = folder;
        self
    }

    /// Run all stages in order. The promoted configurations of a stage are the
    /// base set of the next one, the first stage starts from `seed` alone.
    #[instrument(skip_all, fields(node = self.runtime.node_id()))]
    pub fn run<E: Evaluator>(
        &self,
        grids: &[Grid],
        seed: Configuration,
        evaluator: &E,
    ) -> Result<SweepResults, SweepError> {
        let mut base = vec![seed];
        let mut results = SweepResults::new();

        for grid in grids {
            let ranked = self.stage(grid, &base, evaluator)?;

            base = winners(&ranked, grid.promote)
                .iter()
                .map(|result| result.configuration.clone())
                .collect();

            for (index, result) in winners(&ranked, grid.output).iter().enumerate() {
                info!(loss = result.loss, "[{}_{index}] {}", grid.name, result.configuration);
                results.insert(format!("{}_{index}", grid.name), result.clone());
            }
        }

        Ok(results)
    }

    /// expand, shard, evaluate, gather and rank a single stage
    fn stage<E: Evaluator>(
        &self,
        grid: &Grid,
        base: &[Configuration],
        evaluator: &E,
    ) -> Result<Vec<TrainingResult>, SweepError> {
        let span = info_span!("stage", name = %grid.name);
        let _enter = span.enter();

        let candidates = product(&[base, grid.points.as_slice()]);
        if candidates.is_empty() {
            return Err(SweepError::EmptyGrid(grid.name.clone()));
        }
        info!("Started with {} candidates", candidates.len());
        self.checkpoint(grid, &candidates)?;

        let shard = self.runtime.map(candidates);
        info!(
            "Evaluating {} candidates on node {}/{}",
            shard.len(),
            self.runtime.node_id(),
            self.runtime.nodes()
        );
        let evaluated = self.executor.map(
            |configuration| evaluator.evaluate(configuration).generalized(),
            shard,
        );

        info!("Local job is finished. Reducing...");
        let mut ranked = self.runtime.reduce(evaluated)?;
        info!("All {} candidates are reduced", ranked.len());
        for result in ranked.iter() {
            debug!(loss = result.loss, "{}", result.configuration);
        }

        rank(&mut ranked);
        if ranked.iter().all(|result| result.loss.is_infinite()) {
            warn!("Every candidate of the stage failed, promoting failed runs");
        }

        Ok(ranked)
    }

    fn checkpoint(&self, grid: &Grid, candidates: &[Configuration]) -> Result<(), SweepError> {
        match &self.checkpoint {
            Some(folder) if self.runtime.is_master() => {
                let path = folder.join(format!("{}.jsonl", grid.name));
                points_to_file(candidates, &path)?;
                debug!(path = ?path, "Checkpointed candidates");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Build the cache of every data partition, split across all nodes.
    /// Every node receives the caches in data order, partitions the learner
    /// failed to cache are left out.
    #[instrument(skip_all, fields(node = self.runtime.node_id()))]
    pub fn prepare(
        &self,
        trainer: &ExternalTrainer,
        base: &Configuration,
        data: &[PathBuf],
    ) -> Result<Vec<PathBuf>, SweepError> {
        info!("Caching {} data partitions", data.len());
        let shard = self.runtime.map(data.iter().cloned().enumerate().collect_vec());

        let built = self.executor.map(
            |(index, path)| {
                let cached = trainer.cache(base, &path);
                let cache = cached
                    .get(CACHE_FLAG)
                    .map(PathBuf::from)
                    .filter(|cache| cache.exists());

                if cache.is_none() {
                    warn!(data = ?path, "Skipping partition without cache");
                }
                (index, cache)
            },
            shard,
        );

        let caches = self
            .runtime
            .reduce(built)?
            .into_iter()
            .sorted_by_key(|(index, _)| *index)
            .filter_map(|(_, cache)| cache)
            .collect_vec();

        if caches.is_empty() {
            return Err(SweepError::NoPartitions);
        }
        info!("{} of {} partitions cached", caches.len(), data.len());

        Ok(caches)
    }

    /// Retrain every winner with predictions enabled, only the master does this.
    /// `overrides` is applied on top of each winner, e.g. to switch to an exploration policy.
    #[instrument(skip_all, fields(node = self.runtime.node_id()))]
    pub fn predict(
        &self,
        trainer: &ExternalTrainer,
        caches: &[PathBuf],
        results: &SweepResults,
        overrides: &Configuration,
    ) -> SweepResults {
        if !self.runtime.is_master() {
            return SweepResults::new();
        }

        let labeled = results
            .iter()
            .map(|(name, result)| (name.clone(), result.configuration.apply(overrides)))
            .collect_vec();
        info!("Predicting with {} policies", labeled.len());

        self.executor
            .map(
                |(name, configuration)| {
                    let result = trainer.predict_chain(caches, &name, configuration);
                    (name, result)
                },
                labeled,
            )
            .into_iter()
            .collect()
    }

    /// write the winners and their predictions as a JSON object, only the master does this
    pub fn write_report(
        &self,
        results: &SweepResults,
        predictions: &SweepResults,
        path: &Path,
    ) -> Result<bool, SweepError> {
        if !self.runtime.is_master() {
            return Ok(false);
        }

        write_report(results, predictions, path)?;
        Ok(true)
    }
}

#[derive(Serialize)]
struct ReportRun<'a> {
    command: String,
    #[serde(flatten)]
    result: &'a TrainingResult,
}

impl<'a> From<&'a TrainingResult> for ReportRun<'a> {
    fn from(result: &'a TrainingResult) -> Self {
        Self {
            command: result.configuration.render(),
            result,
        }
    }
}

#[derive(Serialize)]
struct ReportEntry<'a> {
    #[serde(flatten)]
    winner: ReportRun<'a>,
    // last run of the prediction chain, its command names the predictions file
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<ReportRun<'a>>,
}

pub fn write_report(
    results: &SweepResults,
    predictions: &SweepResults,
    path: &Path,
) -> Result<(), SweepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let report = results
        .iter()
        .map(|(name, result)| {
            (
                name.as_str(),
                ReportEntry {
                    winner: result.into(),
                    prediction: predictions.get(name).map(ReportRun::from),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &report)?;
    writer.flush()?;
    info!(path = ?path, "Wrote report with {} entries", report.len());

    Ok(())
}

/// ascending by loss, ties keep their gathered order
pub fn rank(results: &mut [TrainingResult]) {
    results.sort_by(|left, right| left.loss.total_cmp(&right.loss));
}

/// Best `count` of a ranked stage. Failed runs only count when nothing in the stage succeeded.
pub fn winners(ranked: &[TrainingResult], count: usize) -> &[TrainingResult] {
    let finite = ranked.iter().take_while(|result| result.loss.is_finite()).count();
    let available = if finite == 0 { ranked.len() } else { finite };

    &ranked[..count.min(available)]
}
