//! Scripted fetchers and fixtures for cache tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compliance_map_grid::GridIndex;
use compliance_map_source::capacity::summarize;
use compliance_map_source::source_def::{SourceDefinition, parse_source_toml};
use compliance_map_source::{OriginFetcher, SourceError};
use compliance_map_source_models::{Bucket, Entity, EntityKind, FetchPath, RegionSummary};

use crate::orchestrator::BuildConfig;
use crate::persistence::{PersistError, SnapshotStore};
use crate::snapshot::{CacheSnapshot, SnapshotMeta};

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

pub fn entity(id: &str, region: &str, lat: f64, lng: f64) -> Entity {
    Entity {
        id: id.to_string(),
        name: format!("Entity {id}"),
        region: region.to_string(),
        kind: EntityKind::Permit,
        lat: Some(lat),
        lng: Some(lng),
        bucket: Bucket::Good,
        attributes: BTreeMap::new(),
    }
}

pub fn flagged(mut entity: Entity) -> Entity {
    entity.bucket = Bucket::Violation;
    entity
}

pub fn snapshot(source: &str, entities: Vec<Entity>, loaded: &[&str], missing: &[&str]) -> CacheSnapshot {
    let grid = GridIndex::build(entities);
    CacheSnapshot {
        meta: SnapshotMeta {
            source: source.to_string(),
            built_at: Utc::now(),
            loaded_regions: strings(loaded),
            missing_regions: strings(missing),
            total_regions: loaded.len() + missing.len(),
            entity_count: grid.entity_count(),
            located_count: grid.located_count(),
            cell_count: grid.cell_count(),
            region_stats: BTreeMap::new(),
            region_failures: BTreeMap::new(),
        },
        grid,
    }
}

/// A source definition over arbitrary region codes.
pub fn definition(id: &str, regions: &[&str], priority: &[&str], ttl_hours: u64) -> SourceDefinition {
    let quote = |values: &[&str]| {
        values
            .iter()
            .map(|v| format!("\"{v}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    parse_source_toml(&format!(
        r#"
        id = "{id}"
        name = "Test {id}"
        kind = "permit"
        ttl_hours = {ttl_hours}
        regions = [{}]
        priority_regions = [{}]

        [fetcher]
        type = "nwis_groundwater"
        base_url = "http://localhost"

        [fields]
        id = ["id"]
        "#,
        quote(regions),
        quote(priority),
    ))
    .unwrap()
}

pub fn fast_config() -> BuildConfig {
    BuildConfig {
        batch_size: 2,
        batch_delay: Duration::from_millis(1),
        main_timeout: Duration::from_millis(100),
        retry_timeout: Duration::from_millis(1000),
        retry_delay: Duration::from_millis(1),
    }
}

/// How a scripted region responds.
#[derive(Clone)]
pub struct Script {
    delay: Duration,
    fail: bool,
    panic: bool,
    entities: Vec<Entity>,
}

impl Script {
    pub const fn ok(entities: Vec<Entity>) -> Self {
        Self {
            delay: Duration::from_millis(5),
            fail: false,
            panic: false,
            entities,
        }
    }

    pub const fn delayed(delay: Duration, entities: Vec<Entity>) -> Self {
        Self {
            delay,
            fail: false,
            panic: false,
            entities,
        }
    }

    pub const fn fail() -> Self {
        Self {
            delay: Duration::from_millis(1),
            fail: true,
            panic: false,
            entities: Vec::new(),
        }
    }

    /// Panics inside the fetch, as a buggy fetcher would.
    pub const fn panics() -> Self {
        Self {
            delay: Duration::from_millis(1),
            fail: false,
            panic: true,
            entities: Vec::new(),
        }
    }
}

#[derive(Default)]
struct CallLog {
    timeouts: BTreeMap<String, Vec<Duration>>,
    completions: BTreeMap<String, DateTime<Utc>>,
}

/// An [`OriginFetcher`] answering from per-region scripts and recording
/// every call.
pub struct ScriptedFetcher {
    scripts: Mutex<BTreeMap<String, Script>>,
    log: Mutex<CallLog>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedFetcher {
    pub fn new<'a>(scripts: impl IntoIterator<Item = (&'a str, Script)>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(region, script)| (region.to_string(), script))
                    .collect(),
            ),
            log: Mutex::new(CallLog::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Replaces a region's script for subsequent calls.
    pub fn set(&self, region: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(region.to_string(), script);
    }

    pub fn timeouts(&self, region: &str) -> Vec<Duration> {
        self.log
            .lock()
            .unwrap()
            .timeouts
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self, region: &str) -> usize {
        self.timeouts(region).len()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().timeouts.values().map(Vec::len).sum()
    }

    pub fn last_completion(&self, region: &str) -> Option<DateTime<Utc>> {
        self.log.lock().unwrap().completions.get(region).copied()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for ScriptedFetcher {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn fetch_region(
        &self,
        region: &str,
        timeout: Duration,
    ) -> Result<RegionSummary, SourceError> {
        self.log
            .lock()
            .unwrap()
            .timeouts
            .entry(region.to_string())
            .or_default()
            .push(timeout);

        let script = self.scripts.lock().unwrap().get(region).cloned();
        let Some(script) = script else {
            return Err(SourceError::normalization(format!("no script for {region}")));
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        tokio::time::sleep(script.delay).await;

        assert!(!script.panic, "scripted panic for {region}");
        if script.fail {
            return Err(SourceError::normalization(format!("scripted failure for {region}")));
        }

        self.log
            .lock()
            .unwrap()
            .completions
            .insert(region.to_string(), Utc::now());
        Ok(summarize(region, script.entities, 2000, FetchPath::Standard))
    }
}

/// A persistence tier whose load never answers.
pub struct StalledStore;

#[async_trait]
impl SnapshotStore for StalledStore {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn load(&self, _source: &str) -> Result<Option<CacheSnapshot>, PersistError> {
        std::future::pending().await
    }

    async fn save(&self, _source: &str, _snapshot: &CacheSnapshot) -> Result<(), PersistError> {
        Ok(())
    }
}
