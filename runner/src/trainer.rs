use crate::{
    artifacts::ArtifactResolver,
    command::{
        Configuration, CACHE_FLAG, DATA_FLAG, MODEL_INPUT_FLAG, MODEL_OUTPUT_FLAG,
        PREDICTIONS_FLAG,
    },
    config::TrainerConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};
use tracing_unwrap::ResultExt;
use wait_timeout::ChildExt;

pub const DEFAULT_METRIC: &str = "average loss";

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("Failed to spawn learner: {0}")]
    Spawn(io::Error),
    #[error("Failed to wait for learner: {0}")]
    Wait(io::Error),
    #[error("Learner timed out after {0:?}")]
    Timeout(Duration),
}

/// How learner failures are turned into a loss
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// only the metric line counts, everything else is `+inf`
    #[default]
    Absorb,
    /// a failing exit status is `+inf` even when a metric was reported
    Distinguish,
}

/// A configuration together with the loss it reached, lower is better
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TrainingResult {
    pub configuration: Configuration,
    #[serde(with = "loss")]
    pub loss: f64,
}

impl TrainingResult {
    pub fn new(configuration: Configuration, loss: f64) -> Self {
        Self {
            configuration,
            loss,
        }
    }

    pub fn failed(configuration: Configuration) -> Self {
        Self::new(configuration, f64::INFINITY)
    }

    pub fn generalized(mut self) -> Self {
        self.configuration.generalize();
        self
    }
}

// JSON has no infinity, failed runs travel as null
mod loss {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(loss: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if loss.is_finite() {
            serializer.serialize_some(loss)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// Anything that turns a configuration into a scored result
pub trait Evaluator: Sync {
    fn evaluate(&self, configuration: Configuration) -> TrainingResult;
}

impl<F> Evaluator for F
where
    F: Fn(Configuration) -> TrainingResult + Sync,
{
    fn evaluate(&self, configuration: Configuration) -> TrainingResult {
        self(configuration)
    }
}

#[derive(Debug, Clone)]
/// everything captured from a single learner run
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// Adapter around the black-box learner executable
#[derive(Debug)]
pub struct ExternalTrainer {
    exec: PathBuf,
    params: Vec<String>,
    metric: String,
    timeout: Option<Duration>,
    failures: FailurePolicy,
    artifacts: ArtifactResolver,
}

impl ExternalTrainer {
    pub fn new(exec: impl Into<PathBuf>, artifacts: ArtifactResolver) -> Self {
        Self {
            exec: exec.into(),
            params: Vec::new(),
            metric: DEFAULT_METRIC.to_owned(),
            timeout: None,
            failures: FailurePolicy::default(),
            artifacts,
        }
    }

    pub fn load(config: &TrainerConfig, artifacts: ArtifactResolver) -> Self {
        Self::new(&config.exec, artifacts)
            .with_params(config.params.clone())
            .with_metric(&config.metric)
            .with_timeout(config.timeout_ms.map(Duration::from_millis))
            .with_failures(config.failures)
    }

    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_metric(mut self, metric: &str) -> Self {
        self.metric = metric.to_owned();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failures(mut self, failures: FailurePolicy) -> Self {
        self.failures = failures;
        self
    }

    pub fn artifacts(&self) -> &ArtifactResolver {
        &self.artifacts
    }

    /// Build the cache artifact for `data` and return the configuration pointing to it
    #[instrument(level = "debug", skip(self, configuration))]
    pub fn cache(&self, configuration: &Configuration, data: &Path) -> Configuration {
        let mut configuration = configuration.clone();
        configuration.set(DATA_FLAG, data.display());

        match self.artifacts.cache_path(&configuration, data) {
            Ok(path) => {
                configuration.set(CACHE_FLAG, path.display());
            }
            Err(error) => {
                error!(error = ?error, "Failed to resolve cache artifact: {error}");
                return configuration;
            }
        }

        match self.run(&configuration) {
            Ok(output) if output.status.success() => {
                debug!("Cache built in {} ms", output.runtime.as_millis())
            }
            Ok(output) => warn!(status = ?output.status, "Learner failed to build cache"),
            Err(error) => warn!(error = ?error, "Learner failed to build cache: {error}"),
        }

        configuration
    }

    /// Train on one cache partition, never fails, broken runs score `+inf`
    #[instrument(level = "debug", skip(self, configuration))]
    pub fn train(&self, cache: &Path, mut configuration: Configuration) -> TrainingResult {
        configuration.set(CACHE_FLAG, cache.display());

        match self.artifacts.model_path(&configuration, cache) {
            Ok(model) => {
                configuration.set(MODEL_OUTPUT_FLAG, model.display());
            }
            Err(error) => {
                error!(error = ?error, "Failed to resolve model artifact: {error}");
                return TrainingResult::failed(configuration);
            }
        }

        let loss = self.score(self.run(&configuration));
        TrainingResult::new(configuration, loss)
    }

    /// Like `train` but additionally writes predictions for `name`
    #[instrument(level = "debug", skip(self, configuration))]
    pub fn predict(
        &self,
        cache: &Path,
        name: &str,
        mut configuration: Configuration,
    ) -> TrainingResult {
        match self.artifacts.predictions_path(&configuration, cache, name) {
            Ok(predictions) => {
                configuration.set(PREDICTIONS_FLAG, predictions.display());
            }
            Err(error) => {
                error!(error = ?error, "Failed to resolve predictions artifact: {error}");
                return TrainingResult::failed(configuration);
            }
        }

        self.train(cache, configuration)
    }

    /// Train over all partitions in order, warm starting each from the previous model.
    /// Only the result of the last partition is returned.
    pub fn train_chain(&self, caches: &[PathBuf], configuration: Configuration) -> TrainingResult {
        self.chain(caches, configuration, |cache, configuration| {
            self.train(cache, configuration)
        })
    }

    pub fn predict_chain(
        &self,
        caches: &[PathBuf],
        name: &str,
        configuration: Configuration,
    ) -> TrainingResult {
        self.chain(caches, configuration, |cache, configuration| {
            self.predict(cache, name, configuration)
        })
    }

    fn chain<F>(
        &self,
        caches: &[PathBuf],
        mut configuration: Configuration,
        step: F,
    ) -> TrainingResult
    where
        F: Fn(&Path, Configuration) -> TrainingResult,
    {
        let Some((last, chunks)) = caches.split_last() else {
            warn!(command = %configuration, "No cache partitions to train on");
            return TrainingResult::failed(configuration);
        };

        for cache in chunks {
            configuration = warm_start(step(cache.as_path(), configuration).configuration);
        }

        step(last.as_path(), configuration)
    }

    /// Spawn the learner with the rendered configuration and collect its output
    fn run(&self, configuration: &Configuration) -> Result<RunOutput, TrainerError> {
        debug!(command = %configuration, "Running learner");
        let start = Instant::now();

        let mut child = Command::new(&self.exec)
            .args(&self.params)
            .args(configuration.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TrainerError::Spawn)?;

        // drained on the side, a full pipe would otherwise block the learner
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(TrainerError::Wait)? {
                Some(status) => status,
                None => {
                    if let Err(error) = child.kill() {
                        warn!(error = ?error, "Failed to kill learner after timeout");
                    }
                    let _ = child.wait();

                    return Err(TrainerError::Timeout(timeout));
                }
            },
            None => child.wait().map_err(TrainerError::Wait)?,
        };

        let output = RunOutput {
            runtime: start.elapsed(),
            stdout: stdout.join().unwrap_or_log(),
            stderr: stderr.join().unwrap_or_log(),
            status,
        };
        trace!(stderr = %output.stderr, "Learner output");

        Ok(output)
    }

    fn score(&self, output: Result<RunOutput, TrainerError>) -> f64 {
        if let Ok(output) = &output {
            debug!(
                "Finished in {} ms | status: {}",
                output.runtime.as_millis(),
                output.status.success()
            );
        }

        let outcome = RunOutcome::classify(&output, &self.metric);
        match (self.failures, outcome) {
            (_, RunOutcome::Scored(_)) => {}
            (FailurePolicy::Absorb, outcome) => warn!(?outcome, "Learner run failed"),
            (FailurePolicy::Distinguish, RunOutcome::MissingMetric) => {
                warn!(metric = %self.metric, "Learner output contains no usable metric line")
            }
            (FailurePolicy::Distinguish, RunOutcome::TimedOut) => {
                warn!(timeout = ?self.timeout, "Learner timed out")
            }
            (FailurePolicy::Distinguish, outcome) => error!(?outcome, "Learner run failed"),
        }
        if let Err(error) = &output {
            debug!(error = ?error, "{error}");
        }

        self.failures.loss(outcome)
    }
}

/// How a single learner run ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    /// exited successfully and reported the metric
    Scored(f64),
    MissingMetric,
    /// non-zero exit, possibly after reporting the metric
    Crashed { loss: Option<f64> },
    LaunchFailed,
    TimedOut,
}

impl RunOutcome {
    pub fn classify(output: &Result<RunOutput, TrainerError>, metric: &str) -> Self {
        match output {
            Err(TrainerError::Timeout(_)) => Self::TimedOut,
            Err(TrainerError::Spawn(_) | TrainerError::Wait(_)) => Self::LaunchFailed,
            Ok(output) => match (parse_metric(&output.stderr, metric), output.status.success()) {
                (Some(loss), true) => Self::Scored(loss),
                (None, true) => Self::MissingMetric,
                (loss, false) => Self::Crashed { loss },
            },
        }
    }
}

impl FailurePolicy {
    /// loss of a run, `+inf` for everything that does not count as scored
    pub fn loss(&self, outcome: RunOutcome) -> f64 {
        match (self, outcome) {
            (_, RunOutcome::Scored(loss)) => loss,
            (Self::Absorb, RunOutcome::Crashed { loss: Some(loss) }) => loss,
            _ => f64::INFINITY,
        }
    }
}

/// point the model input at the model the previous run produced
fn warm_start(mut configuration: Configuration) -> Configuration {
    if let Some(model) = configuration.get(MODEL_OUTPUT_FLAG).map(str::to_owned) {
        configuration.set(MODEL_INPUT_FLAG, model);
    }
    configuration
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_end(&mut buffer) {
                warn!(error = ?error, "Failed to read learner output");
            }
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Value of the last `key = value` line whose key is `metric`
pub fn parse_metric(text: &str, metric: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| key.trim() == metric)
        .last()
        .and_then(|(_, value)| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Evaluates configurations by chained training over a fixed list of cache partitions
#[derive(Debug)]
pub struct ChainedTrainer<'a> {
    trainer: &'a ExternalTrainer,
    caches: Vec<PathBuf>,
}

impl<'a> ChainedTrainer<'a> {
    pub fn new(trainer: &'a ExternalTrainer, caches: Vec<PathBuf>) -> Self {
        Self { trainer, caches }
    }
}

impl Evaluator for ChainedTrainer<'_> {
    fn evaluate(&self, configuration: Configuration) -> TrainingResult {
        self.trainer.train_chain(&self.caches, configuration)
    }
}
