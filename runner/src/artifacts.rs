use crate::command::Configuration;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    fmt::{self, Display},
    io,
    path::{Component, Path, PathBuf},
};
use tracing::debug;

/// Deterministic identifier of a generalized configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheToken(String);

impl CacheToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// sha256 over the rendering of the generalized configuration
pub fn token(configuration: &Configuration) -> CacheToken {
    let mut hasher = Sha256::new();
    hasher.update(configuration.generalized().render().as_bytes());

    CacheToken(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Cache,
    Model,
    Predictions,
}

impl ArtifactKind {
    pub fn directory(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Model => "model",
            Self::Predictions => "pred",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Model => "model",
            Self::Predictions => "pred",
        }
    }
}

/// Maps (kind, token, stem) to artifact paths below a root directory.
///
/// Directories are created on first use. Writes to the returned paths are not
/// synchronized; two runs deriving the same token overwrite each other.
#[derive(Debug)]
pub struct ArtifactResolver {
    root: PathBuf,
    created: Mutex<HashSet<PathBuf>>,
}

impl ArtifactResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(
        &self,
        kind: ArtifactKind,
        token: &CacheToken,
        stem: &str,
    ) -> io::Result<PathBuf> {
        let folder = self.root.join(kind.directory()).join(token.as_str());

        {
            let mut created = self.created.lock();
            if !created.contains(&folder) {
                std::fs::create_dir_all(&folder)?;
                debug!(folder = ?folder, "Created artifact folder");
                created.insert(folder.clone());
            }
        }

        Ok(folder.join(format!("{stem}.{}", kind.extension())))
    }

    /// cache artifact for `data` built with `configuration`
    pub fn cache_path(&self, configuration: &Configuration, data: &Path) -> io::Result<PathBuf> {
        self.resolve(ArtifactKind::Cache, &token(configuration), &partition(data))
    }

    /// model trained with `configuration` on the `cache` partition
    pub fn model_path(&self, configuration: &Configuration, cache: &Path) -> io::Result<PathBuf> {
        self.resolve(ArtifactKind::Model, &token(configuration), &stem(cache))
    }

    pub fn predictions_path(
        &self,
        configuration: &Configuration,
        cache: &Path,
        name: &str,
    ) -> io::Result<PathBuf> {
        self.resolve(
            ArtifactKind::Predictions,
            &token(configuration),
            &format!("{name}.{}", stem(cache)),
        )
    }
}

/// `2019/01/01_000.json` becomes `2019_01_01_000`, day files repeat across months
fn partition(path: &Path) -> String {
    let components = path
        .with_extension("")
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();

    match components.len() {
        0 => String::from("artifact"),
        len => components[len.saturating_sub(3)..].join("_"),
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("artifact"))
}
