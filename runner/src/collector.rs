use crate::config::{ConfigErrors, DataConfig};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Ordered list of data partitions selected by the data config
#[derive(Debug, Clone, PartialEq)]
pub struct Collector {
    paths: Vec<PathBuf>,
}

impl Collector {
    /// Walk every configured root and keep the files matching the glob.
    /// Partitions are sorted by path, which is their chronological order for dated layouts.
    pub fn load(config: &DataConfig) -> Result<Self, ConfigErrors> {
        let glob = config.compile_glob()?;
        let roots = config.path.iter().chain(config.paths.iter()).unique().collect_vec();
        let (first, others) = roots.split_first().ok_or(ConfigErrors::NoData)?;

        let mut builder = WalkBuilder::new(first);
        debug!("Filtering with glob: {glob:?}");
        // add other paths
        others.iter().for_each(|path| {
            builder.add(path);
        });

        let paths = builder
            .standard_filters(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(error = ?error, "Failed to walk data folder: {error}");
                    None
                }
            })
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .map(DirEntry::into_path)
            .filter(|path| glob.is_match(path))
            .sorted()
            .dedup()
            .collect_vec();

        info!("Collected {} data partitions", paths.len());
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn into_paths(self) -> Vec<PathBuf> {
        self.paths
    }
}

impl<'a> IntoIterator for &'a Collector {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}
