//! Explicit compute resources handed to the pipeline.
//!
//! `ComputeLanes` bundles the frame-worker count with a private rayon pool
//! used by the tile-parallel stages (difference, morphology). Nothing in
//! the crate touches rayon's global pool.

use std::sync::Arc;

use crate::error::{InspectError, Result};

#[derive(Clone)]
pub struct ComputeLanes {
    workers: usize,
    tile_threads: usize,
    pool: Arc<rayon::ThreadPool>,
}

impl ComputeLanes {
    /// `workers` frame workers, `tile_threads` threads for intra-frame tiles.
    pub fn new(workers: usize, tile_threads: usize) -> Result<Self> {
        if workers == 0 {
            return Err(InspectError::InvalidConfig(
                "compute lanes need at least one frame worker".to_string(),
            ));
        }
        if tile_threads == 0 {
            return Err(InspectError::InvalidConfig(
                "compute lanes need at least one tile thread".to_string(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(tile_threads)
            .thread_name(|i| format!("inspect-tile-{}", i))
            .build()
            .map_err(|e| InspectError::ThreadSpawn(e.to_string()))?;
        Ok(Self {
            workers,
            tile_threads,
            pool: Arc::new(pool),
        })
    }

    /// One worker and one tile thread per available core.
    pub fn available() -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores, cores)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn tile_threads(&self) -> usize {
        self.tile_threads
    }

    /// Run `op` inside the tile pool; parallel iterators in `op` use it.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Human-readable lane layout for logs and health output.
    pub fn describe(&self) -> String {
        format!(
            "cpu lanes: {} frame workers, {} tile threads",
            self.workers, self.tile_threads
        )
    }
}

impl std::fmt::Debug for ComputeLanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeLanes")
            .field("workers", &self.workers)
            .field("tile_threads", &self.tile_threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn zero_sized_lanes_are_rejected() {
        assert!(matches!(
            ComputeLanes::new(0, 1),
            Err(InspectError::InvalidConfig(_))
        ));
        assert!(ComputeLanes::new(1, 0).is_err());
    }

    #[test]
    fn install_runs_on_private_pool() {
        let lanes = ComputeLanes::new(1, 2).unwrap();
        let threads = lanes.install(rayon::current_num_threads);
        assert_eq!(threads, 2);
        let sum: u64 = lanes.install(|| (1..=100u64).into_par_iter().sum());
        assert_eq!(sum, 5050);
    }

    #[test]
    fn describe_names_both_counts() {
        let lanes = ComputeLanes::new(3, 2).unwrap();
        assert_eq!(lanes.describe(), "cpu lanes: 3 frame workers, 2 tile threads");
    }
}
