/*
 * Namespace detection over dsjson logs.
 *
 * Inside an event, objects are walked until one holding plain (non object, non list)
 * properties is found; the key of the nearest enclosing object or list names the
 * namespace. Keys starting with `_` are skipped, except `_text`. A namespace whose
 * properties contain `"constant": 1` is also a marginal namespace.
 *
 * The learner only looks at the first character of a namespace, so the detected sets
 * hold first characters.
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_AUTO_LINES: usize = 100;

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Failed to read data partition: {0}")]
    Io(#[from] io::Error),
    #[error("Event {line} is not valid JSON: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Event {0} has no context object 'c'")]
    MissingContext(usize),
}

/// Flavour of the dsjson log, decides which lines are events
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    #[default]
    Cb,
    Ccb,
}

impl LogType {
    fn is_event(self, line: &str) -> bool {
        match self {
            Self::Cb => line.starts_with("{\"_label_cost\""),
            Self::Ccb => line.starts_with("{\"Timestamp\""),
        }
    }
}

/// Namespaces seen in the shared context, in the actions, and marked as marginal
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Namespaces {
    pub shared: BTreeSet<String>,
    pub actions: BTreeSet<String>,
    pub marginals: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Properties {
    None,
    Basic,
    Marginal,
}

impl Namespaces {
    /// Detect from the first `auto_lines` events of a data partition
    pub fn detect(
        path: &Path,
        log_type: LogType,
        auto_lines: usize,
    ) -> Result<Self, NamespaceError> {
        let reader = BufReader::new(File::open(path)?);
        let namespaces = Self::extract(reader.lines(), log_type, auto_lines)?;

        info!(
            path = ?path,
            shared = ?namespaces.shared,
            actions = ?namespaces.actions,
            marginals = ?namespaces.marginals,
            "Detected namespaces"
        );
        Ok(namespaces)
    }

    /// Schemas are assumed consistent, but a namespace may be absent from single events,
    /// so up to `auto_lines` events are inspected
    pub fn extract<L>(
        lines: L,
        log_type: LogType,
        auto_lines: usize,
    ) -> Result<Self, NamespaceError>
    where
        L: IntoIterator<Item = io::Result<String>>,
    {
        let mut namespaces = Self::default();
        let mut events = 0;

        for line in lines {
            if events >= auto_lines {
                break;
            }

            let line = line?;
            if !log_type.is_event(&line) {
                continue;
            }
            events += 1;

            let event: Value = serde_json::from_str(&line).map_err(|source| NamespaceError::Json {
                line: events,
                source,
            })?;
            let context = event
                .get("c")
                .and_then(Value::as_object)
                .ok_or(NamespaceError::MissingContext(events))?;

            // shared features are everything but the action list, which starts with '_'
            visit(context, &mut namespaces.shared, &mut namespaces.marginals);
            for action in context.get("_multi").and_then(Value::as_array).into_iter().flatten() {
                if let Some(action) = action.as_object() {
                    visit(action, &mut namespaces.actions, &mut namespaces.marginals);
                }
            }
        }

        debug!("Inspected {events} events");
        Ok(namespaces)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.actions.is_empty() && self.marginals.is_empty()
    }
}

fn visit(
    object: &Map<String, Value>,
    found: &mut BTreeSet<String>,
    marginals: &mut BTreeSet<String>,
) -> Properties {
    let mut properties = Properties::None;

    for (key, value) in object {
        if key.starts_with('_') && key != "_text" {
            continue;
        }

        let mut nested = |object: &Map<String, Value>| {
            let kind = visit(object, found, marginals);
            if kind != Properties::None {
                found.insert(first_char(key));
            }
            if kind == Properties::Marginal {
                marginals.insert(first_char(key));
            }
        };

        match value {
            Value::Array(items) => items.iter().filter_map(Value::as_object).for_each(&mut nested),
            Value::Object(inner) => nested(inner),
            Value::Null => {}
            _ => properties = Properties::Basic,
        }
    }

    if properties == Properties::Basic && object.get("constant").map_or(false, is_one) {
        Properties::Marginal
    } else {
        properties
    }
}

fn is_one(value: &Value) -> bool {
    value.as_f64() == Some(1.0) || value.as_bool() == Some(true)
}

fn first_char(key: &str) -> String {
    key.chars().take(1).collect()
}
