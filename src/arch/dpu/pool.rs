use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{DpuError, Result};

/// Bounded worker pool splitting an output buffer into disjoint chunks.
pub struct WorkerPool {
  pool: ThreadPool,
}

impl WorkerPool {
  /// `threads == 0` lets rayon pick.
  pub fn new(threads: usize) -> Result<Self> {
    let pool = ThreadPoolBuilder::new()
      .num_threads(threads)
      .build()
      .map_err(|e| DpuError::Config(format!("worker pool: {}", e)))?;
    Ok(Self { pool })
  }

  pub fn threads(&self) -> usize {
    self.pool.current_num_threads()
  }

  /// Run `f(chunk_index, chunk)` over `chunk`-sized pieces of `out`, joining
  /// before returning. The first error raised by any chunk is returned.
  pub fn for_each_chunk<T, F>(&self, out: &mut [T], chunk: usize, f: F) -> Result<()>
  where
    T: Send,
    F: Fn(usize, &mut [T]) -> Result<()> + Sync + Send,
  {
    if out.is_empty() {
      return Ok(());
    }
    let chunk = chunk.max(1);
    self
      .pool
      .install(|| out.par_chunks_mut(chunk).enumerate().try_for_each(|(i, c)| f(i, c)))
  }
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool").field("threads", &self.threads()).finish()
  }
}
