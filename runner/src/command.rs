//! Configuration algebra: learner command lines as ordered sets of entries.

use itertools::{iproduct, Itertools};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

pub const DATA_FLAG: &str = "-d";
pub const CACHE_FLAG: &str = "--cache_file";
pub const MODEL_OUTPUT_FLAG: &str = "-f";
pub const MODEL_INPUT_FLAG: &str = "-i";
pub const PREDICTIONS_FLAG: &str = "-p";

/// Flags that only make sense for a single run and are stripped by `generalize`
pub const RUN_SPECIFIC_FLAGS: [&str; 5] = [
    DATA_FLAG,
    CACHE_FLAG,
    MODEL_OUTPUT_FLAG,
    MODEL_INPUT_FLAG,
    PREDICTIONS_FLAG,
];

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to (de)serialize configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to access checkpoint: {0}")]
    Io(#[from] std::io::Error),
}

/// A single piece of a learner command line
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    /// rendered as `name value`, keyed by `name`
    Flag { name: String, value: String },
    /// rendered verbatim, keyed by `slot` which is never rendered
    Raw { slot: String, text: String },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Key<'a> {
    Flag(&'a str),
    Raw(&'a str),
}

impl Entry {
    pub fn flag(name: impl Into<String>, value: impl Display) -> Self {
        Self::Flag {
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn raw(slot: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Raw {
            slot: slot.into(),
            text: text.into(),
        }
    }

    fn key(&self) -> Key<'_> {
        match self {
            Self::Flag { name, .. } => Key::Flag(name),
            Self::Raw { slot, .. } => Key::Raw(slot),
        }
    }

    fn text(&self) -> String {
        match self {
            Self::Flag { name, value } => format!("{name} {value}"),
            Self::Raw { text, .. } => text.clone(),
        }
    }
}

/// Ordered set of entries describing one learner invocation
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Configuration {
    entries: Vec<Entry>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// insert an entry, replacing an entry with the same key in place
    pub fn insert(&mut self, entry: Entry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.key() == entry.key())
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// set the value of flag `name`
    pub fn set(&mut self, name: &str, value: impl Display) -> &mut Self {
        self.insert(Entry::flag(name, value));
        self
    }

    pub fn with(mut self, entry: Entry) -> Self {
        self.insert(entry);
        self
    }

    /// value of flag `name`, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| match entry {
            Entry::Flag { name: key, value } if key == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.key() == Key::Flag(name))?;

        match self.entries.remove(position) {
            Entry::Flag { value, .. } => Some(value),
            Entry::Raw { .. } => None,
        }
    }

    /// merge `other` into a copy of `self`, entries of `other` win on collisions
    pub fn apply(&self, other: &Configuration) -> Configuration {
        let mut merged = self.clone();
        for entry in other.entries.iter().cloned() {
            merged.insert(entry);
        }
        merged
    }

    /// command line text with whitespace runs collapsed
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(Entry::text)
            .join(" ")
            .split_whitespace()
            .join(" ")
    }

    /// rendered text split into process arguments
    pub fn args(&self) -> Vec<String> {
        self.render()
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }

    /// strip every run-specific flag in place
    pub fn generalize(&mut self) {
        self.entries.retain(|entry| match entry {
            Entry::Flag { name, .. } => !RUN_SPECIFIC_FLAGS.contains(&name.as_str()),
            Entry::Raw { .. } => true,
        });
    }

    pub fn generalized(&self) -> Configuration {
        let mut generalized = self.clone();
        generalized.generalize();
        generalized
    }
}

impl Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromIterator<Entry> for Configuration {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut configuration = Configuration::new();
        for entry in iter {
            configuration.insert(entry);
        }
        configuration
    }
}

/// one single-flag configuration per value
pub fn dimension<T: Display>(
    name: &str,
    values: impl IntoIterator<Item = T>,
) -> Vec<Configuration> {
    values
        .into_iter()
        .map(|value| Configuration::new().with(Entry::flag(name, value)))
        .collect()
}

/// one single-fragment configuration per text
pub fn raw_dimension<T: Into<String>>(
    slot: &str,
    texts: impl IntoIterator<Item = T>,
) -> Vec<Configuration> {
    texts
        .into_iter()
        .map(|text| Configuration::new().with(Entry::raw(slot, text)))
        .collect()
}

pub fn apply(first: &Configuration, second: &Configuration) -> Configuration {
    first.apply(second)
}

/// Full cross product of all dimensions, deduplicated by rendered text.
///
/// Later dimensions override earlier ones on key collisions and the first
/// occurrence of every rendering is kept, so the result is fully determined by
/// the input order.
pub fn product<D: AsRef<[Configuration]>>(dimensions: &[D]) -> Vec<Configuration> {
    dimensions
        .iter()
        .fold(vec![Configuration::new()], |crossed, dimension| {
            iproduct!(crossed.iter(), dimension.as_ref().iter())
                .map(|(left, right)| left.apply(right))
                .collect()
        })
        .into_iter()
        .unique_by(Configuration::render)
        .collect()
}

pub fn serialize(configuration: &Configuration) -> Result<String, CommandError> {
    Ok(serde_json::to_string(configuration)?)
}

pub fn deserialize(line: &str) -> Result<Configuration, CommandError> {
    Ok(serde_json::from_str(line)?)
}
