//! dataset_builder: resumable, partitioned construction of chunked datasets
//!
//! A dataset is a 4-D `(date, variable, ensemble, grid)` array in a chunked store,
//! built group by group by any number of independent workers. Each worker writes its
//! groups' data, a per-group completion flag, and a partial statistics record. A final
//! pass merges the records into per-variable statistics.
//!
//! ## Key Features
//!
//! - **Resumable**: built groups are flagged and skipped on re-run
//! - **Partitioned**: `i/n` parts split the work between processes that never talk
//! - **Exact merging**: raw sums and squares are merged in date order, so the result
//!   does not depend on how the work was split
//! - **Additions**: per-date statistics recomputed from the finished data and checked
//!   against the published ones
//!
//! ## Module Organization
//!
//! - [`loaders`]: build driver (initialise, load, statistics, additions)
//! - [`registry`]: completion flags, history and provenance of a build
//! - [`persistent`]: content-addressed store of partial records
//! - [`writer`]: in-memory staging of one group before a bulk write
//! - [`chunks`]: parts parsing and the partition filter
//! - [`statistics`]: per-unit reductions, aggregation and the summary
//! - [`data_source`] / [`zarr_io`]: array store interface and its local implementation
//! - [`input`]: contract with the input provider
//! - [`dates`], [`check`], [`config`]: dates and groups, value checks, configuration
//! - [`parallel`], [`provenance`]: thread pool and environment fingerprint
//! - [`errors`]: centralized error handling
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dataset_builder::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let mut session = BuildSession::open("/data/era5-o96-2020-2020-6h-v1.zarr")?;
//! let summary = StatisticsAdder::new(StatisticsOutput::Log).run(&mut session).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod check;
pub mod chunks;
pub mod cli;
pub mod config;
pub mod data_source;
pub mod dates;
pub mod errors;
pub mod input;
pub mod loaders;
pub mod parallel;
pub mod persistent;
pub mod provenance;
pub mod registry;
pub mod statistics;
pub mod writer;
pub mod zarr_io;

// Internal modules
mod utils;

// High-level convenience API
pub mod prelude {
    //! Commonly used imports for convenience
    pub use crate::chunks::{PartitionFilter, Parts};
    pub use crate::config::LoaderConfig;
    pub use crate::data_source::{ArrayMetadata, DataReader, DataWriter, Dtype, FullDataSource};
    pub use crate::dates::Groups;
    pub use crate::errors::{DatasetError, Result};
    pub use crate::input::{Cube, Cubelet, InputProvider};
    pub use crate::loaders::{
        AdditionsLoader, BuildSession, ContentLoader, DatasetInitialiser, DatasetMetadata, EndBoundSource,
        StatisticsAdder, StatisticsOutput,
    };
    pub use crate::parallel::ParallelConfig;
    pub use crate::persistent::PartialStore;
    pub use crate::registry::CompletionRegistry;
    pub use crate::statistics::{PartialRecord, StatAggregator, Summary};
    pub use crate::zarr_io::ZarrStore;
}
