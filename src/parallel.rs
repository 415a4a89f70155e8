//! Thread pool configuration for the statistics kernels
//!
//! Workers are separate processes; inside one worker the per-field reductions run on
//! Rayon's global pool, sized here once at startup.

use crate::errors::{DatasetError, Result};
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{debug, info};

/// Size of the global Rayon pool
#[derive(Debug, Clone, Default)]
pub struct ParallelConfig {
    pub num_threads: Option<usize>,
}

impl ParallelConfig {
    pub fn new(num_threads: Option<usize>) -> Self {
        Self { num_threads }
    }

    /// Use every CPU core
    pub fn all_cores() -> Self {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
        }
    }

    /// Build the global pool; can only succeed once per process
    pub fn setup_global_pool(&self) -> Result<()> {
        match self.num_threads {
            Some(0) => Err(DatasetError::ThreadPoolError(
                "Number of threads must be positive".to_string(),
            )),
            Some(num_threads) => {
                ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|i| format!("stats-{i}"))
                    .build_global()
                    .map_err(|e| {
                        DatasetError::ThreadPoolError(format!(
                            "Failed to initialize thread pool with {num_threads} threads: {e}"
                        ))
                    })?;
                info!("Configured parallel processing with {num_threads} threads");
                Ok(())
            }
            None => {
                debug!("Using default thread pool configuration");
                Ok(())
            }
        }
    }
}

/// Information about the parallel processing environment
#[derive(Debug, Clone, Serialize)]
pub struct ParallelInfo {
    pub current_threads: usize,
    pub available_cores: usize,
    pub available_parallelism: usize,
}

impl ParallelInfo {
    pub fn log(&self) {
        info!(
            "Parallel processing: {} threads, {} CPU cores, available parallelism {}",
            self.current_threads, self.available_cores, self.available_parallelism
        );
    }
}

pub fn get_parallel_info() -> ParallelInfo {
    ParallelInfo {
        current_threads: rayon::current_num_threads(),
        available_cores: num_cpus::get(),
        available_parallelism: std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1),
    }
}
