//! Builds one complete [`CacheSnapshot`] for one source.
//!
//! Regions are fetched in priority order, a few at a time, with a pause
//! between batches. Regions that fail the main pass are retried once,
//! sequentially, with a longer timeout. Whatever still fails is recorded
//! as missing and retried on the next build, never in a loop within this
//! one.
//!
//! The result is a brand-new grid; nothing here touches the resident
//! snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use compliance_map_grid::GridIndex;
use compliance_map_source::progress::{ProgressCallback, null_progress};
use compliance_map_source::source_def::{BuildTuning, SourceDefinition};
use compliance_map_source::{OriginFetcher, SourceError};
use compliance_map_source_models::{Entity, RegionSummary};
use futures::future::join_all;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::snapshot::{CacheSnapshot, RegionStats, SnapshotMeta};

// ── Configuration ────────────────────────────────────────────────────────

/// Pacing and timeouts for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// Concurrent fetches per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Per-fetch timeout on the main pass.
    pub main_timeout: Duration,
    /// Per-fetch timeout on the retry pass. Strictly longer than
    /// `main_timeout`.
    pub retry_timeout: Duration,
    /// Pause between sequential retries.
    pub retry_delay: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            batch_delay: Duration::from_secs(2),
            main_timeout: Duration::from_secs(5 * 60),
            retry_timeout: Duration::from_secs(8 * 60),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl BuildConfig {
    /// Defaults overridden by a source's `[build]` table.
    #[must_use]
    pub fn from_tuning(tuning: &BuildTuning) -> Self {
        let defaults = Self::default();
        Self {
            batch_size: tuning.batch_size.unwrap_or(defaults.batch_size),
            batch_delay: tuning
                .batch_delay_secs
                .map_or(defaults.batch_delay, Duration::from_secs),
            main_timeout: tuning
                .main_timeout_secs
                .map_or(defaults.main_timeout, Duration::from_secs),
            retry_timeout: tuning
                .retry_timeout_secs
                .map_or(defaults.retry_timeout, Duration::from_secs),
            retry_delay: tuning
                .retry_delay_secs
                .map_or(defaults.retry_delay, Duration::from_secs),
        }
        .validated()
    }

    /// Forces a positive batch size and a retry timeout longer than the
    /// main timeout.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.batch_size == 0 {
            log::warn!("batch_size 0 is not usable, using 1");
            self.batch_size = 1;
        }
        if self.retry_timeout <= self.main_timeout {
            let bumped = (self.main_timeout.saturating_mul(8) / 5)
                .max(self.main_timeout.saturating_add(Duration::from_millis(1)));
            log::warn!(
                "retry_timeout {:?} must exceed main_timeout {:?}, using {bumped:?}",
                self.retry_timeout,
                self.main_timeout
            );
            self.retry_timeout = bumped;
        }
        self
    }
}

// ── Worklist ─────────────────────────────────────────────────────────────

/// Scheduling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    /// Fetched first.
    Priority,
    /// Everything else.
    Standard,
}

/// Progress of one region within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Not attempted yet.
    Pending,
    /// Loaded.
    Done,
    /// Last attempt failed.
    Failed,
}

/// One region to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTask {
    /// Region code.
    pub region: String,
    /// Scheduling tier.
    pub tier: Tier,
    /// Current status.
    pub status: TaskStatus,
    /// Attempts so far.
    pub attempts: u32,
    /// Message from the last failure.
    pub last_error: Option<String>,
}

impl RegionTask {
    fn new(region: String, tier: Tier) -> Self {
        Self {
            region,
            tier,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Everything a build needs to know before it starts.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Source id.
    pub source: String,
    /// Every region the source covers, priority tier first.
    pub region_order: Vec<String>,
    /// Regions to fetch in this build.
    pub tasks: Vec<RegionTask>,
    /// Entities carried forward from the resident snapshot.
    pub carried: Vec<Entity>,
    /// Regions whose resident data is carried forward.
    pub carried_regions: BTreeSet<String>,
    /// Stats for the carried regions.
    pub carried_stats: BTreeMap<String, RegionStats>,
    /// Consecutive failure counts from the resident snapshot.
    pub previous_failures: BTreeMap<String, u32>,
    /// Whether only the resident snapshot's missing regions are fetched.
    pub incremental: bool,
    /// When the carried data was fetched. An incremental snapshot keeps
    /// this as its `built_at` so carried regions still age out.
    pub carried_built_at: Option<DateTime<Utc>>,
}

impl BuildPlan {
    /// Plans a build for `definition` against the resident snapshot.
    #[must_use]
    pub fn new(
        definition: &SourceDefinition,
        resident: Option<&CacheSnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::from_regions(
            definition.id(),
            &definition.region_codes(),
            &definition.priority_regions,
            definition.ttl(),
            resident,
            now,
        )
    }

    /// Plans a build over explicit region lists.
    ///
    /// A resident snapshot that is still fresh but has missing regions
    /// makes the build incremental: only regions it lacks are fetched and
    /// its loaded regions are carried forward unchanged. Otherwise every
    /// region is fetched.
    #[must_use]
    pub fn from_regions(
        source: &str,
        regions: &[String],
        priority: &[String],
        ttl: Duration,
        resident: Option<&CacheSnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        let ordered = order_regions(regions, priority);
        let region_order: Vec<String> = ordered.iter().map(|(r, _)| r.clone()).collect();

        let previous_failures = resident
            .map(|s| s.meta.region_failures.clone())
            .unwrap_or_default();

        let incremental_base = resident.filter(|s| {
            s.is_fresh(ttl, now) && !s.is_complete() && !s.meta.loaded_regions.is_empty()
        });

        let Some(base) = incremental_base else {
            return Self {
                source: source.to_string(),
                region_order,
                tasks: ordered
                    .into_iter()
                    .map(|(region, tier)| RegionTask::new(region, tier))
                    .collect(),
                carried: Vec::new(),
                carried_regions: BTreeSet::new(),
                carried_stats: BTreeMap::new(),
                previous_failures,
                incremental: false,
                carried_built_at: None,
            };
        };

        let carried_regions: BTreeSet<String> = region_order
            .iter()
            .filter(|r| base.meta.loaded_regions.contains(*r))
            .cloned()
            .collect();
        let carried: Vec<Entity> = base
            .grid
            .entities()
            .filter(|e| carried_regions.contains(&e.region))
            .cloned()
            .collect();
        let carried_stats = base
            .meta
            .region_stats
            .iter()
            .filter(|(r, _)| carried_regions.contains(*r))
            .map(|(r, s)| (r.clone(), s.clone()))
            .collect();
        let tasks = ordered
            .into_iter()
            .filter(|(r, _)| !carried_regions.contains(r))
            .map(|(region, tier)| RegionTask::new(region, tier))
            .collect();

        Self {
            source: source.to_string(),
            region_order,
            tasks,
            carried,
            carried_regions,
            carried_stats,
            previous_failures,
            incremental: true,
            carried_built_at: Some(base.meta.built_at),
        }
    }
}

/// Priority regions (in priority order) then the rest (in source order).
fn order_regions(regions: &[String], priority: &[String]) -> Vec<(String, Tier)> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::with_capacity(regions.len());
    for region in priority {
        if regions.contains(region) && seen.insert(region.clone()) {
            ordered.push((region.clone(), Tier::Priority));
        }
    }
    for region in regions {
        if seen.insert(region.clone()) {
            ordered.push((region.clone(), Tier::Standard));
        }
    }
    ordered
}

// ── Build ────────────────────────────────────────────────────────────────

/// What a build did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    /// Source id.
    pub source: String,
    /// Whether only missing regions were fetched.
    pub incremental: bool,
    /// Regions attempted.
    pub attempted: usize,
    /// Regions loaded by this build.
    pub loaded: Vec<String>,
    /// Regions that failed the main pass and loaded on retry.
    pub recovered: Vec<String>,
    /// Regions that failed both passes.
    pub missing: Vec<String>,
    /// Entities in the new snapshot.
    pub entity_count: usize,
    /// Build start.
    pub started_at: DateTime<Utc>,
    /// End of the retry pass.
    pub finished_at: DateTime<Utc>,
    /// Whether the new snapshot replaced the resident one.
    pub swapped: bool,
    /// Whether the disk write succeeded.
    pub persisted: bool,
}

impl BuildSummary {
    /// A build that ended without producing a snapshot.
    pub(crate) fn aborted(source: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            incremental: false,
            attempted: 0,
            loaded: Vec::new(),
            recovered: Vec::new(),
            missing: Vec::new(),
            entity_count: 0,
            started_at,
            finished_at: Utc::now(),
            swapped: false,
            persisted: false,
        }
    }
}

/// A finished build.
#[derive(Debug)]
pub struct BuildOutcome {
    /// The new snapshot.
    pub snapshot: CacheSnapshot,
    /// What happened.
    pub summary: BuildSummary,
}

/// Runs builds for one source.
pub struct BuildOrchestrator {
    fetcher: Arc<dyn OriginFetcher>,
    config: BuildConfig,
    progress: Arc<dyn ProgressCallback>,
}

impl BuildOrchestrator {
    /// Creates an orchestrator with silent progress.
    #[must_use]
    pub fn new(fetcher: Arc<dyn OriginFetcher>, config: BuildConfig) -> Self {
        Self {
            fetcher,
            config: config.validated(),
            progress: null_progress(),
        }
    }

    /// Reports region progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Runs both passes and assembles a new snapshot. Never fails; regions
    /// that could not be fetched are listed in the snapshot metadata.
    pub async fn run(&self, mut plan: BuildPlan) -> BuildOutcome {
        let source = plan.source.clone();
        let started_at = Utc::now();
        let mut fetched: BTreeMap<usize, RegionSummary> = BTreeMap::new();

        log::info!(
            "{source}: building {} regions{} (batch {}, timeout {:?})",
            plan.tasks.len(),
            if plan.incremental {
                format!(", {} carried forward", plan.carried_regions.len())
            } else {
                String::new()
            },
            self.config.batch_size,
            self.config.main_timeout
        );
        self.progress.set_total(plan.tasks.len() as u64);

        // Main pass.
        let indices: Vec<usize> = (0..plan.tasks.len()).collect();
        for (batch_no, batch) in indices.chunks(self.config.batch_size).enumerate() {
            if batch_no > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|&i| self.fetch(&plan.tasks[i].region, self.config.main_timeout)),
            )
            .await;
            for (&i, result) in batch.iter().zip(results) {
                record(&source, &mut plan.tasks[i], result, i, &mut fetched);
                self.progress.inc(1);
            }
        }

        // Retry pass.
        let failed: Vec<usize> = plan
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Failed)
            .map(|(i, _)| i)
            .collect();
        let mut recovered = Vec::new();
        if !failed.is_empty() {
            log::info!(
                "{source}: retrying {} regions with {:?} timeout",
                failed.len(),
                self.config.retry_timeout
            );
            self.progress
                .set_message(format!("retrying {} regions", failed.len()));
        }
        for (n, &i) in failed.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let result = self
                .fetch(&plan.tasks[i].region, self.config.retry_timeout)
                .await;
            if result.is_ok() {
                log::info!("{source}/{}: recovered on retry", plan.tasks[i].region);
                recovered.push(plan.tasks[i].region.clone());
            }
            record(&source, &mut plan.tasks[i], result, i, &mut fetched);
        }
        let finished_at = Utc::now();

        let outcome = assemble(plan, fetched, recovered, started_at, finished_at);
        self.progress.finish(format!(
            "{} loaded, {} missing",
            outcome.snapshot.meta.loaded_regions.len(),
            outcome.snapshot.meta.missing_regions.len()
        ));
        outcome
    }

    async fn fetch(&self, region: &str, timeout: Duration) -> Result<RegionSummary, SourceError> {
        // The fetcher bounds its own I/O; this bounds a fetcher that does not.
        tokio::time::timeout(timeout, self.fetcher.fetch_region(region, timeout))
            .await
            .unwrap_or_else(|_| {
                Err(SourceError::Timeout {
                    region: region.to_string(),
                    timeout,
                })
            })
    }
}

fn record(
    source: &str,
    task: &mut RegionTask,
    result: Result<RegionSummary, SourceError>,
    index: usize,
    fetched: &mut BTreeMap<usize, RegionSummary>,
) {
    task.attempts += 1;
    match result {
        Ok(summary) => {
            task.status = TaskStatus::Done;
            task.last_error = None;
            fetched.insert(index, summary);
        }
        Err(e) => {
            log::warn!("{source}/{}: fetch failed: {e}", task.region);
            task.status = TaskStatus::Failed;
            task.last_error = Some(e.to_string());
        }
    }
}

fn assemble(
    plan: BuildPlan,
    fetched: BTreeMap<usize, RegionSummary>,
    recovered: Vec<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> BuildOutcome {
    let BuildPlan {
        source,
        region_order,
        tasks,
        mut carried,
        carried_regions,
        carried_stats: mut region_stats,
        previous_failures,
        incremental,
        carried_built_at,
    } = plan;

    let mut loaded_now = Vec::with_capacity(fetched.len());
    for summary in fetched.into_values() {
        region_stats.insert(summary.region.clone(), RegionStats::from(&summary));
        loaded_now.push(summary.region);
        carried.extend(summary.entities);
    }

    let loaded_regions: Vec<String> = region_order
        .iter()
        .filter(|r| carried_regions.contains(*r) || loaded_now.contains(*r))
        .cloned()
        .collect();
    let missing_regions: Vec<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| t.region.clone())
        .collect();

    let mut region_failures: BTreeMap<String, u32> = previous_failures
        .into_iter()
        .filter(|(r, _)| region_order.contains(r) && !loaded_regions.contains(r))
        .collect();
    for region in &missing_regions {
        *region_failures.entry(region.clone()).or_default() += 1;
    }

    if !missing_regions.is_empty() {
        log::warn!(
            "{source}: {} regions missing after retry, next build will retry them: {}",
            missing_regions.len(),
            missing_regions
                .iter()
                .map(|r| format!("{r} ({}x)", region_failures.get(r).copied().unwrap_or(1)))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let grid = GridIndex::build(carried);
    let meta = SnapshotMeta {
        source: source.clone(),
        built_at: carried_built_at.map_or(finished_at, |carried| carried.min(finished_at)),
        total_regions: region_order.len(),
        entity_count: grid.entity_count(),
        located_count: grid.located_count(),
        cell_count: grid.cell_count(),
        loaded_regions,
        missing_regions: missing_regions.clone(),
        region_stats,
        region_failures,
    };

    log::info!(
        "{source}: built {}/{} regions, {} entities in {} cells",
        meta.loaded_regions.len(),
        meta.total_regions,
        meta.entity_count,
        meta.cell_count
    );

    let summary = BuildSummary {
        source,
        incremental,
        attempted: tasks.len(),
        loaded: loaded_now,
        recovered,
        missing: missing_regions,
        entity_count: meta.entity_count,
        started_at,
        finished_at,
        swapped: false,
        persisted: false,
    };

    BuildOutcome {
        snapshot: CacheSnapshot { meta, grid },
        summary,
    }
}
