pub mod local;

use crate::config::{ConfigErrors, ExecutorConfig};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Node-local strategies for running a batch of learner invocations.
/// Both keep the output in input order.
#[derive(Debug)]
pub enum Executors {
    Sequential,
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "sequential" => Ok(Self::Sequential),
            "local" => Ok(Self::Local(local::LocalExecutor::load(
                config.threads.unwrap_or_else(num_cpus::get),
            )?)),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }

    /// apply `task` to every input, blocks until the whole batch is done
    pub fn map<I, O, F>(&self, task: F, inputs: Vec<I>) -> Vec<O>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync + Send,
    {
        match self {
            Self::Sequential => {
                debug!("Processing {} inputs sequentially", inputs.len());
                inputs.into_iter().map(task).collect()
            }
            Self::Local(executor) => executor.map(task, inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn strategies_keep_input_order() {
        let inputs = (0..32u64).collect::<Vec<_>>();
        let task = |value: u64| {
            // later inputs finish first
            thread::sleep(Duration::from_millis(32 - value));
            value * 10
        };
        let expected = inputs.iter().map(|value| value * 10).collect::<Vec<_>>();

        assert_eq!(Executors::Sequential.map(task, inputs.clone()), expected);

        let local = Executors::Local(local::LocalExecutor::load(4).unwrap());
        assert_eq!(local.map(task, inputs), expected);
    }

    #[test]
    fn load_selects_strategy_by_name() {
        let sequential = ExecutorConfig {
            name: String::from("sequential"),
            threads: None,
        };
        assert!(matches!(
            Executors::load(&sequential),
            Ok(Executors::Sequential)
        ));

        let local = ExecutorConfig {
            name: String::from("local"),
            threads: Some(2),
        };
        match Executors::load(&local) {
            Ok(Executors::Local(executor)) => assert_eq!(executor.threads(), 2),
            other => panic!("unexpected executor: {other:?}"),
        }

        let slurm = ExecutorConfig {
            name: String::from("slurm"),
            threads: None,
        };
        assert!(matches!(
            Executors::load(&slurm),
            Err(ConfigErrors::UnsupportedExecutor(_))
        ));
    }
}
