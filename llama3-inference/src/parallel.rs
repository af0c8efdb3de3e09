#[cfg(test)]
#[path = "../tests/unit/parallel_test.rs"]
mod parallel_test;

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

enum Pool {
    /// rayon's process-wide pool, created once on first use
    Global,
    Dedicated(ThreadPool),
}

/// Worker pool for the data-parallel parts of a forward pass.
///
/// Work submitted through [`ParallelExecutor::install`] runs every nested rayon iterator
/// (row-parallel matmuls, per-head attention) on this pool, and `install` only returns once
/// all of it has finished. The default executor shares rayon's global pool, sized to the
/// available hardware parallelism; [`ParallelExecutor::with_threads`] builds a dedicated one.
pub struct ParallelExecutor {
    pool: Pool,
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self { pool: Pool::Global }
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            anyhow::bail!("Worker pool needs at least one thread");
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("llama3-worker-{index}"))
            .build()
            .context("Failed to create worker pool")?;

        Ok(Self { pool: Pool::Dedicated(pool) })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Pool::Global => rayon::current_num_threads(),
            Pool::Dedicated(pool) => pool.current_num_threads(),
        }
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self.pool, Pool::Dedicated(_))
    }

    /// Runs `op` inside the pool and waits for it and all work it spawned.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            // parallel iterators started here block until the global pool finishes them
            Pool::Global => op(),
            Pool::Dedicated(pool) => pool.install(op),
        }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("dedicated", &self.is_dedicated())
            .field("threads", &self.threads())
            .finish()
    }
}
