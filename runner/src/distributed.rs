#[cfg(feature = "distributed")]
pub mod fs;
pub mod util;

#[cfg(test)]
mod util_test;

/*
 * Two ways to run a sweep:
 * -> a single node, `map` and `reduce` are identities
 * -> a fixed set of nodes sharing a folder, every node takes a round robin slice of the
 *    candidates and `reduce` gathers the slices of all nodes behind a barrier
 *
 * The node set is assumed fixed for the whole sweep, a node dying before the barrier stalls
 * the others (or fails them once the barrier timeout is hit). Files of an earlier run in
 * the same shared folder are never read, see `fs::FsRuntime`.
 */

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("Failed to exchange results through the shared folder: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize node results: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Nodes {missing:?} did not reach round {round} within {waited:?}")]
    BarrierTimeout {
        round: usize,
        missing: Vec<usize>,
        waited: Duration,
    },
    #[error("Nodes {missing:?} did not join the run within {waited:?}")]
    JoinTimeout { missing: Vec<usize>, waited: Duration },
    #[error("Rank {rank} is invalid for {nodes} nodes")]
    Topology { rank: usize, nodes: usize },
    #[error("Unable to determine the {0} from the configuration or the launcher environment")]
    MissingTopology(&'static str),
    #[error("The file system runtime requires the `distributed` feature")]
    Unsupported,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SynchronizationTypes {
    #[default]
    Local,
    FileSystem {
        path: PathBuf,
        rank: Option<usize>,
        nodes: Option<usize>,
        session: Option<String>,
        #[serde(default = "default_poll_ms")]
        poll_ms: u64,
        timeout_ms: Option<u64>,
    },
}

fn default_poll_ms() -> u64 {
    500
}

/// Cross-node distribution of candidates
pub trait Runtime {
    /// the part of `items` this node is responsible for
    fn map<T>(&self, items: Vec<T>) -> Vec<T>;

    /// combine the items of all nodes, every node receives the same list
    fn reduce<T: Serialize + DeserializeOwned>(
        &self,
        items: Vec<T>,
    ) -> Result<Vec<T>, DistributionError>;

    fn node_id(&self) -> usize;

    fn nodes(&self) -> usize;

    /// only the master performs final side effects
    fn is_master(&self) -> bool {
        self.node_id() == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRuntime;

impl Runtime for LocalRuntime {
    fn map<T>(&self, items: Vec<T>) -> Vec<T> {
        items
    }

    fn reduce<T: Serialize + DeserializeOwned>(
        &self,
        items: Vec<T>,
    ) -> Result<Vec<T>, DistributionError> {
        Ok(items)
    }

    fn node_id(&self) -> usize {
        0
    }

    fn nodes(&self) -> usize {
        1
    }
}

/// Runtime selected once at startup
#[derive(Debug)]
pub enum Runtimes {
    Local(LocalRuntime),
    #[cfg(feature = "distributed")]
    FileSystem(fs::FsRuntime),
}

impl Runtimes {
    pub fn load(config: &SynchronizationTypes) -> Result<Self, DistributionError> {
        match config {
            SynchronizationTypes::Local => Ok(Self::Local(LocalRuntime)),
            #[cfg(feature = "distributed")]
            SynchronizationTypes::FileSystem {
                path,
                rank,
                nodes,
                session,
                poll_ms,
                timeout_ms,
            } => Ok(Self::FileSystem(
                fs::FsRuntime::load(path, *rank, *nodes, session.clone())?
                    .with_poll(Duration::from_millis(*poll_ms))
                    .with_timeout(timeout_ms.map(Duration::from_millis)),
            )),
            #[cfg(not(feature = "distributed"))]
            SynchronizationTypes::FileSystem { .. } => Err(DistributionError::Unsupported),
        }
    }
}

impl Runtime for Runtimes {
    fn map<T>(&self, items: Vec<T>) -> Vec<T> {
        match self {
            Self::Local(runtime) => runtime.map(items),
            #[cfg(feature = "distributed")]
            Self::FileSystem(runtime) => runtime.map(items),
        }
    }

    fn reduce<T: Serialize + DeserializeOwned>(
        &self,
        items: Vec<T>,
    ) -> Result<Vec<T>, DistributionError> {
        match self {
            Self::Local(runtime) => runtime.reduce(items),
            #[cfg(feature = "distributed")]
            Self::FileSystem(runtime) => runtime.reduce(items),
        }
    }

    fn node_id(&self) -> usize {
        match self {
            Self::Local(runtime) => runtime.node_id(),
            #[cfg(feature = "distributed")]
            Self::FileSystem(runtime) => runtime.node_id(),
        }
    }

    fn nodes(&self) -> usize {
        match self {
            Self::Local(runtime) => runtime.nodes(),
            #[cfg(feature = "distributed")]
            Self::FileSystem(runtime) => runtime.nodes(),
        }
    }
}
