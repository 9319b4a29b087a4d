#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-source snapshot caches.
//!
//! Each source owns one [`SourceCache`]. A build fetches the source's
//! regions in bounded-concurrency batches, retries failures with a longer
//! timeout, assembles a [`CacheSnapshot`], and swaps it in atomically.
//! Snapshots are written through to disk and pushed to an optional remote
//! blob tier; a restarted process warms from disk first, then the remote
//! tier, before falling back to a cold build.

pub mod grade;
pub mod manager;
pub mod orchestrator;
pub mod persistence;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use grade::{Grade, LocationGrade, grade_location};
pub use manager::{
    BuildHandle, CacheRegistry, CacheState, CacheStatus, Lifecycle, LookupResult, SourceCache,
};
pub use orchestrator::{BuildConfig, BuildOrchestrator, BuildPlan, BuildSummary};
pub use persistence::{PersistenceBackend, WarmSource};
pub use snapshot::{CacheSnapshot, SnapshotMeta};
