use crate::{
    command::{dimension, product, raw_dimension, CommandError, Configuration, Entry},
    distributed::SynchronizationTypes,
    executors::ExecutorError,
    grid::{interactions_grid, marginals_grid, points_from_file, Grid, GridError},
    namespaces::{LogType, NamespaceError, Namespaces, DEFAULT_AUTO_LINES},
    trainer::{FailurePolicy, DEFAULT_METRIC},
};
use globset::{GlobBuilder, GlobMatcher};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet, fs, fs::File, io, os::unix::fs::MetadataExt, path::Path, path::PathBuf,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Executor failed to load: {0}")]
    FailedLoadExecutor(#[from] ExecutorError),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found: {0}")]
    MetadataNotFound(io::Error),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to load stage points: {0}")]
    Points(#[from] CommandError),
    #[error("Invalid stage: {0}")]
    InvalidStage(#[from] GridError),
    #[error("Failed to detect namespaces: {0}")]
    Namespaces(#[from] NamespaceError),
    #[error("No data partitions defined")]
    NoData,
    #[error("Configuration failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    // the black-box learner
    pub trainer: TrainerConfig,
    // node-local worker pool
    #[serde(default)]
    pub executor: ExecutorConfig,
    // cross-node distribution, defaults to a single node
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub runtime: SynchronizationTypes,
    pub artifacts: ArtifactsConfig,
    pub data: DataConfig,
    // seed configuration every stage builds on, entries are `- raw: {..}` / `- flag: {..}`
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub base: Vec<Entry>,
    // folder receiving the expanded candidates of every stage
    pub checkpoint: Option<PathBuf>,
    // JSON report of the winners, written by the master
    pub report: Option<PathBuf>,
    pub stages: Vec<StageConfig>,
    pub predict: Option<PredictConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    pub exec: PathBuf,
    // fixed arguments placed before the rendered configuration
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_metric")]
    pub metric: String,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failures: FailurePolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection process
    #[serde(default = "default_executor")]
    pub name: String,
    // defaults to the number of CPUs
    pub threads: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor(),
            threads: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArtifactsConfig {
    pub root: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_glob")]
    pub glob: String,
    // events inspected by namespace detection, read from the first partition
    #[serde(default)]
    pub log_type: LogType,
    #[serde(default = "default_auto_lines")]
    pub auto_lines: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "default_one")]
    pub promote: usize,
    #[serde(default = "default_one")]
    pub output: usize,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    // checkpointed candidates, crossed with the dimensions
    pub points_file: Option<PathBuf>,
    pub limit: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum DimensionConfig {
    Flag {
        flag: String,
        values: Vec<serde_yaml::Value>,
    },
    Raw {
        raw: String,
        values: Vec<String>,
    },
    // `detect: true` adds the namespaces found in the data to the listed ones
    Interactions {
        interactions: String,
        #[serde(default)]
        shared: Vec<String>,
        #[serde(default)]
        actions: Vec<String>,
        #[serde(default)]
        detect: bool,
        limit: Option<usize>,
    },
    Marginals {
        marginals: String,
        #[serde(default)]
        namespaces: Vec<String>,
        #[serde(default)]
        detect: bool,
        limit: Option<usize>,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PredictConfig {
    // entries applied on top of every winner before predicting
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub overrides: Vec<Entry>,
}

impl DimensionConfig {
    pub fn points(&self, detected: &Namespaces) -> Vec<Configuration> {
        match self {
            Self::Flag { flag, values } => dimension(flag, values.iter().map(value_text)),
            Self::Raw { raw, values } => raw_dimension(raw, values.iter().cloned()),
            Self::Interactions {
                interactions,
                shared,
                actions,
                detect,
                limit,
            } => interactions_grid(
                interactions,
                with_detected(shared, *detect, &detected.shared).as_slice(),
                with_detected(actions, *detect, &detected.actions).as_slice(),
                *limit,
            ),
            Self::Marginals {
                marginals,
                namespaces,
                detect,
                limit,
            } => marginals_grid(
                marginals,
                with_detected(namespaces, *detect, &detected.marginals).as_slice(),
                *limit,
            ),
        }
    }

    /// true if the dimension has no points, generators always have the no-op point
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Flag { values, .. } => values.is_empty(),
            Self::Raw { values, .. } => values.is_empty(),
            Self::Interactions { limit, .. } | Self::Marginals { limit, .. } => *limit == Some(0),
        }
    }

    pub fn detects(&self) -> bool {
        match self {
            Self::Interactions { detect, .. } | Self::Marginals { detect, .. } => *detect,
            _ => false,
        }
    }
}

impl DataConfig {
    /// Compile the glob selecting data partitions
    pub fn compile_glob(&self) -> Result<GlobMatcher, globset::Error> {
        GlobBuilder::new(&self.glob)
            .build()
            .map(|glob| glob.compile_matcher())
    }
}

impl StageConfig {
    /// candidates of this stage, the cross product of its dimensions and checkpointed points
    pub fn grid(&self, detected: &Namespaces) -> Result<Grid, ConfigErrors> {
        let mut dimensions = self
            .dimensions
            .iter()
            .map(|dimension| dimension.points(detected))
            .collect_vec();

        if let Some(points_file) = &self.points_file {
            dimensions.push(points_from_file(points_file, self.limit)?);
        }

        Ok(Grid::new(
            &self.name,
            product(&dimensions),
            self.promote,
            self.output,
        )?)
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn grids(&self, detected: &Namespaces) -> Result<Vec<Grid>, ConfigErrors> {
        self.stages.iter().map(|stage| stage.grid(detected)).collect()
    }

    /// true if a dimension wants the namespaces of the data
    pub fn detects_namespaces(&self) -> bool {
        self.stages
            .iter()
            .flat_map(|stage| stage.dimensions.iter())
            .any(DimensionConfig::detects)
    }

    /// namespaces of the first partition, empty if nothing asks for them
    pub fn namespaces(&self, data: &[PathBuf]) -> Result<Namespaces, ConfigErrors> {
        match data.first() {
            Some(first) if self.detects_namespaces() => Ok(Namespaces::detect(
                first,
                self.data.log_type,
                self.data.auto_lines,
            )?),
            None if self.detects_namespaces() => {
                warn!("No data partition to detect namespaces from");
                Ok(Namespaces::default())
            }
            _ => Ok(Namespaces::default()),
        }
    }

    pub fn base(&self) -> Configuration {
        self.base.iter().cloned().collect()
    }

    /// returns true if any problem was found, every problem is logged
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        let exec = &self.trainer.exec;
        if exec.is_file() {
            match check_executable(exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "trainer.exec {} is not executable",
                        exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if trainer.exec ({}) is an executable: {e}",
                        exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        } else if exec.components().count() > 1 {
            error!(
                "Failed to find trainer.exec. Either not a file or not found at {}",
                exec.to_string_lossy()
            );
            contains_error = true;
        } else {
            warn!(
                "trainer.exec {} is not a file, it will be looked up in PATH",
                exec.to_string_lossy()
            );
        }

        if self.trainer.timeout_ms == Some(0) {
            error!("trainer.timeout_ms cannot be 0, omit it to wait for the learner indefinitely");
            contains_error = true;
        }

        match self.executor.name.as_str() {
            "sequential" | "local" => {}
            name => {
                error!("executor.name ({name}) is not supported, please use `local` or `sequential`");
                contains_error = true;
            }
        }
        if self.executor.threads == Some(0) {
            error!("executor.threads cannot be 0");
            contains_error = true;
        }

        if self.data.path.is_none() && self.data.paths.is_empty() {
            error!("data contains neither 'path' nor 'paths', there is nothing to train on");
            contains_error = true;
        } else if let Some(ref path) = self.data.path {
            if !self.data.paths.is_empty() {
                warn!("data contains both 'path' and 'paths'. This will be treated as if 'path' is a member of 'paths'");
            }
            // merge path into paths if neccessary
            if !self.data.paths.contains(path) {
                self.data.paths.push(path.clone());
            }
        }

        if self.data.auto_lines == 0 && self.detects_namespaces() {
            error!("data.auto_lines cannot be 0 when namespaces are detected");
            contains_error = true;
        }

        if let Err(e) = self.data.compile_glob() {
            error!("data.glob ({}) is invalid: {e}", self.data.glob);
            contains_error = true;
        }

        if self.stages.is_empty() {
            error!("No stage was defined, unable to run a sweep");
            contains_error = true;
        }

        let mut names = BTreeSet::new();
        for stage in self.stages.iter() {
            let name = &stage.name;

            if name.is_empty() {
                error!("Stage names cannot be empty");
                contains_error = true;
            } else if !names.insert(name.as_str()) {
                error!("Stage {name} is defined more than once, its outputs would collide");
                contains_error = true;
            }

            if stage.promote == 0 || stage.output == 0 {
                error!("Stage {name} must promote and output at least one configuration");
                contains_error = true;
            }

            if stage.dimensions.is_empty() && stage.points_file.is_none() {
                error!("Stage {name} contains neither 'dimensions' nor 'points_file' a stage can't be a NOP");
                contains_error = true;
            }

            for dimension in stage.dimensions.iter() {
                if dimension.is_empty() {
                    error!("Stage {name} has a dimension without values: {dimension:?}");
                    contains_error = true;
                }
            }

            if let Some(ref points_file) = stage.points_file {
                if !points_file.is_file() {
                    error!(
                        "Stage {name} points_file {} is not a file",
                        points_file.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

/// text of a scalar YAML value as it should appear on the command line
fn value_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(text) => text.clone(),
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        serde_yaml::Value::Number(number) => number.to_string(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_owned())
            .unwrap_or_default(),
    }
}

fn with_detected(listed: &[String], detect: bool, detected: &BTreeSet<String>) -> Vec<String> {
    listed
        .iter()
        .chain(detected.iter().filter(|_| detect))
        .cloned()
        .collect()
}

fn default_metric() -> String {
    DEFAULT_METRIC.to_owned()
}

fn default_executor() -> String {
    String::from("local")
}

fn default_glob() -> String {
    String::from("*.json")
}

fn default_auto_lines() -> usize {
    DEFAULT_AUTO_LINES
}

fn default_one() -> usize {
    1
}
