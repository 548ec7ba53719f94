//! # profiledb
//!
//! Storage engine for continuous profiling data. Profiles arrive in pprof shape, their
//! symbols are deduplicated into per-head tables, their samples become one row per
//! (series, profile type, timestamp) and the rows are cut into immutable row groups. A full
//! head is flushed into a block directory that stays queryable after restarts.
//!
//! Queries fan out over the in-memory head, its row groups and every block, deduplicate
//! replicated rows and merge the survivors into flamegraph trees, time series or a pprof
//! profile.
//!
//! ```no_run
//! use profiledb::{DbConfig, HeadConfig, Labels, ProfileDb, SelectRequest};
//!
//! # fn main() -> Result<(), profiledb::DbError> {
//! let db = ProfileDb::open(DbConfig {
//!     head: HeadConfig {
//!         data_path: "./data".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! })?;
//! let labels = Labels::from_pairs(&[("__name__", "process_cpu"), ("job", "api")]);
//! # let profile = profiledb::Profile::default();
//! db.ingest(&profile, uuid::Uuid::new_v4(), profiledb::DEFAULT_TENANT, &labels)?;
//! let tree = db.merge_by_stacktraces(&SelectRequest::new(r#"{job="api"}"#, 0, i64::MAX))?;
//! println!("{}", tree);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod db;
pub mod dedup;
pub mod delta;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod head;
pub mod labels;
pub mod limits;
pub mod merge;
pub mod partition;
pub mod pprof;
pub mod profile_store;
pub mod querier;
pub mod segment;
pub mod selector;
pub mod series_index;
pub mod symbols;
pub mod telemetry;
pub mod tree;
pub mod types;

/// Flushed, immutable block and its `meta.json` descriptor.
pub use crate::block::{Block, BlockMeta};
/// Main entry point: ingestion, rotation and queries.
pub use crate::db::{DbConfig, ProfileDb, SelectRequest};
pub use crate::delta::DeltaConfig;
pub use crate::engine::MergeHints;
/// Error type for database operations.
pub use crate::error::DbError;
pub use crate::head::{Head, HeadConfig};
pub use crate::labels::{Labels, ProfileType};
pub use crate::limits::{LimitsConfig, DEFAULT_TENANT};
pub use crate::merge::QueryContext;
pub use crate::profile_store::ProfileStoreConfig;
pub use crate::querier::{Point, ProfileEntry, Querier, Series};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
pub use crate::tree::Tree;
/// Profile model accepted by ingestion.
pub use crate::types::{Profile, ProfileId, Timestamp};
