//! The per-source cache facade.
//!
//! A [`SourceCache`] owns one source's resident snapshot and the machinery
//! behind it. Readers never wait on a build: they get whatever snapshot is
//! resident, and a cold or stale cache starts a background build as a side
//! effect. Builds replace the snapshot pointer in one atomic store, so a
//! reader sees either the old snapshot or the new one.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use compliance_map_grid::GridCell;
use compliance_map_source::OriginFetcher;
use compliance_map_source::progress::{LogProgress, ProgressCallback};
use compliance_map_source::source_def::SourceDefinition;
use compliance_map_source_models::Entity;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::sync::OnceCell;

use crate::orchestrator::{BuildConfig, BuildOrchestrator, BuildOutcome, BuildPlan, BuildSummary};
use crate::persistence::{Persistence, PersistenceBackend, WarmSource};
use crate::snapshot::CacheSnapshot;

/// A build in progress or finished. Every caller that triggers a build
/// while one is running receives a clone of the same handle.
pub type BuildHandle = Shared<BoxFuture<'static, Arc<BuildSummary>>>;

/// Reader-facing cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CacheState {
    /// Nothing resident.
    Cold,
    /// A build is running. Resident data, if any, is still served.
    Building,
    /// Resident and within TTL.
    Ready,
    /// Resident but past TTL.
    Stale,
}

/// Warm-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Lifecycle {
    /// Persistence tiers not consulted yet.
    Uninitialized,
    /// Loading from disk or the remote tier.
    Warming,
    /// Warm-up finished (possibly cold).
    Ready,
}

impl Lifecycle {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Warming,
            _ => Self::Ready,
        }
    }
}

/// Side-effect-free status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Source id.
    pub source: String,
    /// Source display name.
    pub name: String,
    /// Reader-facing state.
    pub state: CacheState,
    /// Warm-up progress.
    pub lifecycle: Lifecycle,
    /// Tier that answered the warm-up.
    pub warmed_from: Option<WarmSource>,
    /// Regions present in the resident snapshot.
    pub loaded_regions: usize,
    /// Regions the source covers.
    pub total_regions: usize,
    /// When the resident snapshot was built.
    pub last_built: Option<DateTime<Utc>>,
    /// Regions missing from the resident snapshot.
    pub missing_regions: Vec<String>,
    /// Entities in the resident snapshot.
    pub entity_count: usize,
    /// Consecutive failed builds per region.
    pub region_failures: BTreeMap<String, u32>,
}

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    /// Nothing resident yet; a build has been started.
    Cold,
    /// Resident, but nothing within the 3×3 window.
    NoData,
    /// Entities near the point.
    Found(GridCell),
}

/// One source's cache.
pub struct SourceCache {
    definition: Arc<SourceDefinition>,
    orchestrator: BuildOrchestrator,
    persistence: Persistence,
    snapshot: ArcSwapOption<CacheSnapshot>,
    building: AtomicBool,
    in_flight: Mutex<Option<BuildHandle>>,
    warm: OnceCell<WarmSource>,
    lifecycle: AtomicU8,
}

impl SourceCache {
    /// Creates a cold cache paced by the source's `[build]` tuning.
    #[must_use]
    pub fn new(
        definition: Arc<SourceDefinition>,
        fetcher: Arc<dyn OriginFetcher>,
        persistence: Persistence,
    ) -> Self {
        let config = BuildConfig::from_tuning(&definition.build);
        Self::with_config(definition, fetcher, persistence, config)
    }

    /// Creates a cold cache with an explicit build configuration.
    #[must_use]
    pub fn with_config(
        definition: Arc<SourceDefinition>,
        fetcher: Arc<dyn OriginFetcher>,
        persistence: Persistence,
        config: BuildConfig,
    ) -> Self {
        Self {
            definition,
            orchestrator: BuildOrchestrator::new(fetcher, config),
            persistence,
            snapshot: ArcSwapOption::empty(),
            building: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            warm: OnceCell::new(),
            lifecycle: AtomicU8::new(0),
        }
    }

    /// Reports build progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.orchestrator = self.orchestrator.with_progress(progress);
        self
    }

    /// Source id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.definition.id()
    }

    /// Source definition.
    #[must_use]
    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    // ── Status ───────────────────────────────────────────────────────

    fn state(&self, snapshot: Option<&CacheSnapshot>, now: DateTime<Utc>) -> CacheState {
        if self.building.load(Ordering::SeqCst) {
            return CacheState::Building;
        }
        match snapshot {
            None => CacheState::Cold,
            Some(s) if s.is_fresh(self.definition.ttl(), now) => CacheState::Ready,
            Some(_) => CacheState::Stale,
        }
    }

    /// Current status. Never triggers work.
    #[must_use]
    pub fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot.load_full();
        let state = self.state(snapshot.as_deref(), Utc::now());
        let meta = snapshot.as_ref().map(|s| &s.meta);

        CacheStatus {
            source: self.definition.id().to_string(),
            name: self.definition.name().to_string(),
            state,
            lifecycle: Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst)),
            warmed_from: self.warm.get().copied(),
            loaded_regions: meta.map_or(0, |m| m.loaded_regions.len()),
            total_regions: meta.map_or_else(
                || self.definition.region_codes().len(),
                |m| m.total_regions,
            ),
            last_built: meta.map(|m| m.built_at),
            missing_regions: meta.map(|m| m.missing_regions.clone()).unwrap_or_default(),
            entity_count: meta.map_or(0, |m| m.entity_count),
            region_failures: meta.map(|m| m.region_failures.clone()).unwrap_or_default(),
        }
    }

    /// The resident snapshot, without warming or triggering anything.
    #[must_use]
    pub fn resident(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot.load_full()
    }

    // ── Warm-up ──────────────────────────────────────────────────────

    /// Consults memory, then disk, then the remote tier, exactly once per
    /// process. Later calls return the tier that answered.
    pub async fn ensure_warm(&self) -> WarmSource {
        *self
            .warm
            .get_or_init(|| async {
                self.lifecycle.store(1, Ordering::SeqCst);
                let tier = if self.snapshot.load().is_some() {
                    WarmSource::Memory
                } else {
                    let warmed = self.persistence.warm().await;
                    if let Some(loaded) = warmed.snapshot.map(Arc::new) {
                        // A build may have finished while warming; never
                        // replace its newer snapshot.
                        self.snapshot
                            .rcu(|current| current.clone().or_else(|| Some(Arc::clone(&loaded))));
                    }
                    warmed.tier
                };
                self.lifecycle.store(2, Ordering::SeqCst);
                tier
            })
            .await
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The best resident snapshot. Starts a background build when the
    /// cache is cold or stale; stale data is still returned.
    pub async fn get(self: &Arc<Self>) -> Option<Arc<CacheSnapshot>> {
        self.ensure_warm().await;
        let snapshot = self.snapshot.load_full();
        match self.state(snapshot.as_deref(), Utc::now()) {
            CacheState::Cold | CacheState::Stale => self.start_build(),
            CacheState::Building | CacheState::Ready => {}
        }
        snapshot
    }

    /// Entities within the 3×3 window around `(lat, lng)`.
    pub async fn lookup(self: &Arc<Self>, lat: f64, lng: f64) -> LookupResult {
        let Some(snapshot) = self.get().await else {
            return LookupResult::Cold;
        };
        let cell = snapshot.grid.lookup(lat, lng);
        if cell.is_empty() {
            LookupResult::NoData
        } else {
            LookupResult::Found(cell)
        }
    }

    /// Entities fetched for region `code`. `None` while cold.
    pub async fn region(self: &Arc<Self>, code: &str) -> Option<Vec<Entity>> {
        let snapshot = self.get().await?;
        Some(snapshot.grid.in_region(code).into_iter().cloned().collect())
    }

    /// The entity with identifier `id`. `None` while cold or when absent.
    pub async fn entity(self: &Arc<Self>, id: &str) -> Option<Entity> {
        let snapshot = self.get().await?;
        snapshot.grid.by_id(id).cloned()
    }

    // ── Builds ───────────────────────────────────────────────────────

    /// Starts a build unless one is running, and returns its handle.
    pub fn trigger_build(self: &Arc<Self>) -> BuildHandle {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.building.load(Ordering::SeqCst)
            && let Some(handle) = in_flight.as_ref()
        {
            log::debug!("{}: build already in progress", self.id());
            return handle.clone();
        }

        self.building.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = async move { this.run_build().await }.boxed().shared();
        *in_flight = Some(handle.clone());
        drop(in_flight);

        tokio::spawn(handle.clone());
        handle
    }

    fn start_build(self: &Arc<Self>) {
        drop(self.trigger_build());
    }

    async fn run_build(self: Arc<Self>) -> Arc<BuildSummary> {
        let _guard = BuildingGuard(&self);
        let started_at = Utc::now();

        // A panic must not escape into the shared handle: every joined
        // caller would re-panic and `building` would never clear.
        let summary = match AssertUnwindSafe(self.build()).catch_unwind().await {
            Ok(summary) => summary,
            Err(_) => {
                log::error!("{}: build panicked, keeping resident state", self.id());
                BuildSummary::aborted(self.id(), started_at)
            }
        };
        Arc::new(summary)
    }

    async fn build(&self) -> BuildSummary {
        let id = self.definition.id();
        self.ensure_warm().await;

        let resident = self.snapshot.load_full();
        let plan = BuildPlan::new(&self.definition, resident.as_deref(), Utc::now());
        let BuildOutcome {
            snapshot,
            mut summary,
        } = self.orchestrator.run(plan).await;

        if snapshot.meta.loaded_regions.is_empty() {
            log::warn!(
                "{id}: build loaded no regions, keeping {}",
                if resident.is_some() {
                    "resident snapshot"
                } else {
                    "cold state"
                }
            );
        } else {
            let snapshot = Arc::new(snapshot);
            self.snapshot.store(Some(Arc::clone(&snapshot)));
            summary.swapped = true;

            let saved = self.persistence.save_through(&snapshot).await;
            match saved.disk {
                Ok(()) => summary.persisted = true,
                Err(e) => log::warn!("{id}: disk snapshot write failed: {e}"),
            }
        }

        summary
    }
}

/// Clears the building flag when a build ends, including by panic or
/// cancellation.
struct BuildingGuard<'a>(&'a SourceCache);

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        // Under the lock so a concurrent trigger never joins a dead handle.
        let mut in_flight = self
            .0
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.0.building.store(false, Ordering::SeqCst);
        let finished = in_flight.take();
        drop(in_flight);
        drop(finished);
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// One [`SourceCache`] per enabled source.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    caches: BTreeMap<String, Arc<SourceCache>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache for every valid definition. Invalid definitions are
    /// logged and skipped.
    #[must_use]
    pub fn from_definitions(
        definitions: Vec<SourceDefinition>,
        backend: &PersistenceBackend,
        fetcher_for: impl Fn(Arc<SourceDefinition>) -> Arc<dyn OriginFetcher>,
    ) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            if let Err(e) = definition.validate() {
                log::error!("Skipping source: {e}");
                continue;
            }
            let definition = Arc::new(definition);
            let fetcher = fetcher_for(Arc::clone(&definition));
            let persistence = backend.for_source(definition.id());
            let progress = Arc::new(LogProgress::new(definition.id()));
            registry.insert(Arc::new(
                SourceCache::new(definition, fetcher, persistence).with_progress(progress),
            ));
        }
        registry
    }

    /// Adds or replaces a cache.
    pub fn insert(&mut self, cache: Arc<SourceCache>) {
        self.caches.insert(cache.id().to_string(), cache);
    }

    /// The cache for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<SourceCache>> {
        self.caches.get(id)
    }

    /// All caches in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SourceCache>> {
        self.caches.values()
    }

    /// Number of sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Returns `true` if no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Status of every source.
    #[must_use]
    pub fn statuses(&self) -> Vec<CacheStatus> {
        self.iter().map(|c| c.status()).collect()
    }

    /// Warms every source concurrently.
    pub async fn warm_all(&self) {
        let tiers = futures::future::join_all(self.iter().map(|c| c.ensure_warm())).await;
        for (cache, tier) in self.iter().zip(tiers) {
            log::info!("{}: warm-up answered by {tier}", cache.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::persistence::{DiskStore, NoopStore, SnapshotStore};
    use crate::test_support::{
        Script, ScriptedFetcher, StalledStore, definition, entity, fast_config, snapshot, strings,
    };

    fn source_cache(
        regions: &[&str],
        priority: &[&str],
        fetcher: &Arc<ScriptedFetcher>,
        backend: &PersistenceBackend,
    ) -> Arc<SourceCache> {
        let def = Arc::new(definition("test", regions, priority, 1));
        let persistence = backend.for_source("test");
        Arc::new(SourceCache::with_config(
            def,
            fetcher.clone(),
            persistence,
            fast_config(),
        ))
    }

    fn ok(id: &str, region: &str, lat: f64) -> Script {
        Script::ok(vec![entity(id, region, lat, -77.0)])
    }

    #[tokio::test]
    async fn status_is_cold_and_side_effect_free() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", ok("a", "A", 38.9))]));
        let cache = source_cache(&["A"], &[], &fetcher, &PersistenceBackend::memory_only());

        let status = cache.status();
        assert_eq!(status.state, CacheState::Cold);
        assert_eq!(status.lifecycle, Lifecycle::Uninitialized);
        assert_eq!(status.total_regions, 1);
        assert!(status.last_built.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_build() {
        let fetcher = Arc::new(ScriptedFetcher::new([
            ("A", Script::delayed(Duration::from_millis(30), vec![entity("a", "A", 38.9, -77.0)])),
            ("B", Script::delayed(Duration::from_millis(30), vec![entity("b", "B", 39.9, -77.0)])),
        ]));
        let cache = source_cache(&["A", "B"], &[], &fetcher, &PersistenceBackend::memory_only());

        let handles: Vec<BuildHandle> = (0..10).map(|_| cache.trigger_build()).collect();
        assert_eq!(cache.status().state, CacheState::Building);
        let summaries = futures::future::join_all(handles).await;

        assert_eq!(fetcher.calls("A"), 1);
        assert_eq!(fetcher.calls("B"), 1);
        assert!(summaries.iter().all(|s| Arc::ptr_eq(s, &summaries[0])));
        assert!(summaries[0].swapped);
        assert_eq!(cache.status().state, CacheState::Ready);
    }

    #[tokio::test]
    async fn get_on_cold_cache_starts_build_without_waiting() {
        let fetcher = Arc::new(ScriptedFetcher::new([(
            "A",
            Script::delayed(Duration::from_millis(50), vec![entity("a", "A", 38.9, -77.0)]),
        )]));
        let cache = source_cache(&["A"], &[], &fetcher, &PersistenceBackend::memory_only());

        assert!(cache.get().await.is_none());
        assert_eq!(cache.status().state, CacheState::Building);
        assert_eq!(cache.status().warmed_from, Some(WarmSource::Cold));

        cache.trigger_build().await;
        assert_eq!(cache.get().await.unwrap().meta.entity_count, 1);
        assert_eq!(fetcher.calls("A"), 1);
    }

    #[tokio::test]
    async fn lookup_distinguishes_cold_from_no_data() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", ok("a", "A", 38.95))]));
        let cache = source_cache(&["A"], &[], &fetcher, &PersistenceBackend::memory_only());

        assert_eq!(cache.lookup(38.95, -77.0).await, LookupResult::Cold);
        cache.trigger_build().await;

        assert_eq!(cache.lookup(45.0, -100.0).await, LookupResult::NoData);
        let LookupResult::Found(cell) = cache.lookup(38.95, -77.0).await else {
            panic!("expected entities near the point");
        };
        assert_eq!(cell.len(), 1);

        assert_eq!(cache.region("a").await.unwrap().len(), 1);
        assert_eq!(cache.entity("a").await.unwrap().region, "A");
        assert!(cache.entity("zzz").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_see_wholly_old_or_wholly_new_snapshots() {
        let regions = ["A", "B", "C", "D"];
        let fetcher = Arc::new(ScriptedFetcher::new(regions.map(|r| {
            (r, Script::ok(vec![entity(&format!("old-{r}"), r, 38.9, -77.0)]))
        })));
        let cache = source_cache(&regions, &[], &fetcher, &PersistenceBackend::memory_only());
        cache.trigger_build().await;

        for r in regions {
            fetcher.set(
                r,
                Script::delayed(
                    Duration::from_millis(20),
                    vec![entity(&format!("new-{r}"), r, 38.9, -77.0)],
                ),
            );
        }

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let mut observed = Vec::new();
                for _ in 0..200 {
                    if let Some(snapshot) = cache.resident() {
                        let ids: Vec<String> =
                            snapshot.grid.entities().map(|e| e.id.clone()).collect();
                        observed.push(ids);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                observed
            })
        };

        cache.trigger_build().await;
        let observed = reader.await.unwrap();

        assert!(!observed.is_empty());
        for ids in observed {
            assert_eq!(ids.len(), 4);
            let old = ids.iter().all(|id| id.starts_with("old-"));
            let new = ids.iter().all(|id| id.starts_with("new-"));
            assert!(old || new, "mixed snapshot observed: {ids:?}");
        }
    }

    #[tokio::test]
    async fn build_that_loads_nothing_keeps_resident_snapshot() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", ok("a", "A", 38.9))]));
        let cache = source_cache(&["A"], &[], &fetcher, &PersistenceBackend::memory_only());
        cache.trigger_build().await;
        let before = cache.resident().unwrap();

        fetcher.set("A", Script::fail());
        let summary = cache.trigger_build().await;

        assert!(!summary.swapped);
        assert_eq!(summary.missing, strings(&["A"]));
        assert!(Arc::ptr_eq(&before, &cache.resident().unwrap()));
    }

    #[tokio::test]
    async fn end_to_end_priority_regions_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PersistenceBackend::new(Arc::new(DiskStore::new(dir.path())), None);
        let fetcher = Arc::new(ScriptedFetcher::new([
            ("A", ok("a", "A", 38.9)),
            ("B", ok("b", "B", 39.9)),
            (
                "C",
                Script::delayed(Duration::from_millis(300), vec![entity("c", "C", 40.9, -77.0)]),
            ),
        ]));
        let cache = source_cache(&["C", "A", "B"], &["A", "B"], &fetcher, &backend);

        let summary = cache.trigger_build().await;
        let status = cache.status();

        assert_eq!(status.state, CacheState::Ready);
        assert_eq!(status.loaded_regions, 3);
        assert!(status.missing_regions.is_empty());
        assert_eq!(
            cache.resident().unwrap().meta.loaded_regions,
            strings(&["A", "B", "C"])
        );
        assert_eq!(summary.recovered, strings(&["C"]));
        assert_eq!(fetcher.timeouts("C"), [fast_config().main_timeout, fast_config().retry_timeout]);
        assert!(status.last_built.unwrap() >= fetcher.last_completion("C").unwrap());
        assert!(summary.persisted);

        // A fresh process warms from the disk snapshot without fetching.
        let restarted = Arc::new(ScriptedFetcher::new([]));
        let cache = source_cache(&["C", "A", "B"], &["A", "B"], &restarted, &backend);
        assert_eq!(cache.ensure_warm().await, WarmSource::Disk);
        assert_eq!(cache.status().state, CacheState::Ready);
        assert!(cache.get().await.is_some());
        assert_eq!(restarted.total_calls(), 0);
    }

    #[tokio::test]
    async fn stale_snapshot_is_served_while_rebuilding() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskStore::new(dir.path()));
        let mut stale = snapshot("test", vec![entity("old", "A", 38.9, -77.0)], &["A"], &[]);
        stale.meta.built_at = Utc::now() - chrono::Duration::hours(3);
        disk.save("test", &stale).await.unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new([(
            "A",
            Script::delayed(Duration::from_millis(50), vec![entity("new", "A", 38.9, -77.0)]),
        )]));
        let backend = PersistenceBackend::new(disk, None);
        let cache = source_cache(&["A"], &[], &fetcher, &backend);

        let served = cache.get().await.unwrap();
        assert!(served.grid.by_id("old").is_some());
        assert_eq!(cache.status().state, CacheState::Building);

        cache.trigger_build().await;
        assert!(cache.resident().unwrap().grid.by_id("new").is_some());
        assert_eq!(cache.status().state, CacheState::Ready);
    }

    #[tokio::test]
    async fn warm_reports_memory_after_an_early_build() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", ok("a", "A", 38.9))]));
        let backend = PersistenceBackend::new(Arc::new(NoopStore) as Arc<dyn SnapshotStore>, None);
        let def = Arc::new(definition("test", &["A"], &[], 1));
        let cache = Arc::new(SourceCache::with_config(
            def,
            fetcher.clone(),
            backend.for_source("test"),
            fast_config(),
        ));

        // The build warms first, so the tier is whatever the stores said.
        cache.trigger_build().await;
        assert_eq!(cache.ensure_warm().await, WarmSource::Cold);
        assert_eq!(cache.status().lifecycle, Lifecycle::Ready);
    }

    #[tokio::test]
    async fn stalled_remote_tier_does_not_hang_lookups() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", ok("a", "A", 38.9))]));
        let backend = PersistenceBackend::new(Arc::new(NoopStore), Some(Arc::new(StalledStore)))
            .with_warm_timeout(Duration::from_millis(50));
        let cache = source_cache(&["A"], &[], &fetcher, &backend);

        let result = tokio::time::timeout(Duration::from_secs(2), cache.lookup(38.9, -77.0))
            .await
            .expect("lookup must not wait on a stalled remote tier");
        assert_eq!(result, LookupResult::Cold);
        assert_eq!(cache.status().warmed_from, Some(WarmSource::Cold));

        let summary = tokio::time::timeout(Duration::from_secs(2), cache.trigger_build())
            .await
            .unwrap();
        assert!(summary.swapped);
        assert_eq!(fetcher.calls("A"), 1);
    }

    #[tokio::test]
    async fn panicking_build_clears_building_and_allows_a_rebuild() {
        let fetcher = Arc::new(ScriptedFetcher::new([("A", Script::panics())]));
        let cache = source_cache(&["A"], &[], &fetcher, &PersistenceBackend::memory_only());

        let summary = cache.trigger_build().await;
        assert!(!summary.swapped);
        assert_ne!(cache.status().state, CacheState::Building);
        assert!(cache.resident().is_none());

        fetcher.set("A", ok("a", "A", 38.9));
        let rebuilt = cache.trigger_build().await;
        assert!(rebuilt.swapped);
        assert_eq!(cache.status().state, CacheState::Ready);
        assert_eq!(fetcher.calls("A"), 2);
    }

    #[test]
    fn registry_skips_invalid_definitions() {
        let mut bad = definition("bad", &["A"], &[], 1);
        bad.max_entities_per_region = 0;
        let good = definition("good", &["MD"], &[], 1);
        let registry = CacheRegistry::from_definitions(
            vec![bad, good],
            &PersistenceBackend::memory_only(),
            |_| Arc::new(ScriptedFetcher::new([])) as Arc<dyn OriginFetcher>,
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("good").is_some());
        assert_eq!(registry.statuses()[0].state, CacheState::Cold);
    }
}
