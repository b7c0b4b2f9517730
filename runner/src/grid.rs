use crate::command::{deserialize, serialize, CommandError, Configuration, Entry};
use itertools::Itertools;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Stage {0} must promote at least one configuration")]
    Promote(String),
    #[error("Stage {0} must output at least one configuration")]
    Output(String),
}

/// One stage of a sweep: candidate points plus how many winners move on
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub name: String,
    pub points: Vec<Configuration>,
    pub promote: usize,
    pub output: usize,
}

impl Grid {
    pub fn new(
        name: impl Into<String>,
        points: Vec<Configuration>,
        promote: usize,
        output: usize,
    ) -> Result<Self, GridError> {
        let name = name.into();
        if promote == 0 {
            return Err(GridError::Promote(name));
        }
        if output == 0 {
            return Err(GridError::Output(name));
        }

        Ok(Self {
            name,
            points,
            promote,
            output,
        })
    }
}

/// Load one serialized configuration per line, blank lines are skipped
pub fn points_from_file(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<Configuration>, CommandError> {
    let reader = BufReader::new(File::open(path)?);
    let mut points = Vec::new();

    for line in reader.lines() {
        if limit.map_or(false, |limit| points.len() >= limit) {
            break;
        }

        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        points.push(deserialize(&line)?);
    }

    debug!(path = ?path, "Loaded {} points", points.len());
    Ok(points)
}

pub fn points_to_file(points: &[Configuration], path: &Path) -> Result<(), CommandError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for point in points {
        writeln!(writer, "{}", serialize(point)?)?;
    }
    writer.flush()?;

    Ok(())
}

/// every non-empty subset, smaller subsets first, built on demand
pub fn subsets<T: Clone>(items: &[T]) -> impl Iterator<Item = Vec<T>> + '_ {
    (1..=items.len()).flat_map(move |size| items.iter().cloned().combinations(size))
}

/// No-op plus one `--marginal` fragment per subset of the namespaces, at most `limit` points
pub fn marginals_grid<S: AsRef<str>>(
    slot: &str,
    namespaces: &[S],
    limit: Option<usize>,
) -> Vec<Configuration> {
    let namespaces = sorted_unique(
        namespaces
            .iter()
            .map(|namespace| namespace.as_ref().to_owned()),
    );

    fragments(
        slot,
        subsets(&namespaces).map(|subset| format!("--marginal {}", subset.concat())),
        limit,
    )
}

/// No-op plus one `-q` fragment per subset of the shared x action namespace pairs,
/// at most `limit` points
pub fn interactions_grid<S: AsRef<str>>(
    slot: &str,
    shared: &[S],
    actions: &[S],
    limit: Option<usize>,
) -> Vec<Configuration> {
    let interactions = sorted_unique(
        shared
            .iter()
            .cartesian_product(actions.iter())
            .map(|(shared, action)| format!("{}{}", shared.as_ref(), action.as_ref())),
    );

    fragments(
        slot,
        subsets(&interactions).map(|subset| format!("-q {}", subset.join(" -q "))),
        limit,
    )
}

// the subsets grow as 2^n, nothing past the limit is ever built
fn fragments(
    slot: &str,
    texts: impl Iterator<Item = String>,
    limit: Option<usize>,
) -> Vec<Configuration> {
    std::iter::once(String::new())
        .chain(texts)
        .take(limit.unwrap_or(usize::MAX))
        .map(|text| Configuration::new().with(Entry::raw(slot, text)))
        .collect()
}

fn sorted_unique(items: impl Iterator<Item = String>) -> Vec<String> {
    items.sorted().dedup().collect()
}
