use super::ExecutorError;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// Executor that works on a local thread pool.
/// Every task launches its own learner process, so `threads` bounds the
/// number of learners running at once.
#[derive(Debug)]
pub struct LocalExecutor {
    pool: ThreadPool,
}

impl LocalExecutor {
    pub fn load(threads: usize) -> Result<Self, ExecutorError> {
        debug!("Starting thread pool with {threads} threads");

        Ok(Self {
            pool: ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|index| format!("sweep-worker-{index}"))
                .build()?,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// execute the batch concurrently with the thread pool
    #[instrument(skip_all, level = "debug")]
    pub fn map<I, O, F>(&self, task: F, inputs: Vec<I>) -> Vec<O>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync + Send,
    {
        // general counters to provide progress
        let total = inputs.len() as u64;
        let processed = AtomicU64::new(0);

        let outputs = self.pool.install(|| {
            inputs
                .into_par_iter()
                .map(|input| {
                    let output = task(input);
                    debug!(
                        "Done with {}/{total}",
                        processed.fetch_add(1, Ordering::SeqCst) + 1
                    );
                    output
                })
                .collect()
        });

        info!("Done with processing {total} inputs");

        outputs
    }
}
