//! Snapshot persistence across restarts and instances.
//!
//! Two tiers sit behind [`SnapshotStore`]: a local disk directory (or a
//! no-op when the environment has no writable disk) and an optional remote
//! blob store. The tiers are chosen once at startup by
//! [`PersistenceBackend::from_env`].
//!
//! Writes go to disk first and are awaited; the remote push is spawned and
//! never blocks the caller. Reads follow disk, then remote at most once per
//! process, then cold.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use compliance_map_r2::{BlobClient, BlobError};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::task::JoinHandle;

use crate::snapshot::CacheSnapshot;

/// Default local snapshot directory.
pub const DEFAULT_CACHE_DIR: &str = "data/cache";

/// Default budget for one tier's load during warm-up.
pub const DEFAULT_WARM_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a persistence tier.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote store failure.
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    /// The tier did not answer within the warm budget.
    #[error("{tier} load timed out after {after:?}")]
    Timeout {
        /// Tier name.
        tier: &'static str,
        /// Budget that was exceeded.
        after: Duration,
    },
}

/// One persistence tier.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Loads the snapshot for `source`. `Ok(None)` means nothing stored.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the stored snapshot is unreadable.
    async fn load(&self, source: &str) -> Result<Option<CacheSnapshot>, PersistError>;

    /// Stores `snapshot` for `source`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the write fails.
    async fn save(&self, source: &str, snapshot: &CacheSnapshot) -> Result<(), PersistError>;
}

// ── Disk ─────────────────────────────────────────────────────────────────

/// One `{source}.json` file per source under a directory.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot path for `source`.
    #[must_use]
    pub fn path_for(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{source}.json"))
    }
}

#[async_trait]
impl SnapshotStore for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn load(&self, source: &str) -> Result<Option<CacheSnapshot>, PersistError> {
        let bytes = match tokio::fs::read(self.path_for(source)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CacheSnapshot::from_json(&bytes)?))
    }

    async fn save(&self, source: &str, snapshot: &CacheSnapshot) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(source);
        let tmp = self.dir.join(format!("{source}.json.tmp"));

        // Write-then-rename so a crash never leaves a truncated snapshot.
        tokio::fs::write(&tmp, snapshot.to_json()?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!("{source}: wrote snapshot to {}", path.display());
        Ok(())
    }
}

// ── No-op ────────────────────────────────────────────────────────────────

/// Stores nothing. Used where the process has no writable disk.
pub struct NoopStore;

#[async_trait]
impl SnapshotStore for NoopStore {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn load(&self, _source: &str) -> Result<Option<CacheSnapshot>, PersistError> {
        Ok(None)
    }

    async fn save(&self, _source: &str, _snapshot: &CacheSnapshot) -> Result<(), PersistError> {
        Ok(())
    }
}

// ── Remote blob ──────────────────────────────────────────────────────────

/// Fixed remote key for a source's snapshot.
#[must_use]
pub fn snapshot_key(source: &str) -> String {
    format!("cache/{source}.json")
}

/// Snapshots in a remote [`BlobClient`] under [`snapshot_key`].
pub struct BlobStore {
    client: Arc<dyn BlobClient>,
}

impl BlobStore {
    /// Wraps a blob client.
    #[must_use]
    pub fn new(client: Arc<dyn BlobClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotStore for BlobStore {
    fn name(&self) -> &'static str {
        self.client.name()
    }

    async fn load(&self, source: &str) -> Result<Option<CacheSnapshot>, PersistError> {
        let key = snapshot_key(source);
        let listed = self.client.list(&key).await?;
        let Some(object) = listed.first() else {
            return Ok(None);
        };
        let bytes = self.client.get(object).await?;
        Ok(Some(CacheSnapshot::from_json(&bytes)?))
    }

    async fn save(&self, source: &str, snapshot: &CacheSnapshot) -> Result<(), PersistError> {
        self.client
            .put(&snapshot_key(source), snapshot.to_json()?)
            .await?;
        Ok(())
    }
}

// ── Backend selection ────────────────────────────────────────────────────

/// The tiers available to this process.
#[derive(Clone)]
pub struct PersistenceBackend {
    disk: Arc<dyn SnapshotStore>,
    remote: Option<Arc<dyn SnapshotStore>>,
    warm_timeout: Duration,
}

impl PersistenceBackend {
    /// Creates a backend from explicit tiers.
    #[must_use]
    pub fn new(disk: Arc<dyn SnapshotStore>, remote: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            disk,
            remote,
            warm_timeout: DEFAULT_WARM_TIMEOUT,
        }
    }

    /// Overrides how long each tier may take to answer during warm-up.
    #[must_use]
    pub fn with_warm_timeout(mut self, warm_timeout: Duration) -> Self {
        self.warm_timeout = warm_timeout;
        self
    }

    /// No disk and no remote tier.
    #[must_use]
    pub fn memory_only() -> Self {
        Self::new(Arc::new(NoopStore), None)
    }

    /// Selects tiers from the environment.
    ///
    /// `COMPLIANCE_MAP_DISK_CACHE=0` disables the disk tier; otherwise
    /// snapshots live in `COMPLIANCE_MAP_CACHE_DIR` (default
    /// [`DEFAULT_CACHE_DIR`]). The remote tier is whatever
    /// [`compliance_map_r2::from_env`] finds. `COMPLIANCE_MAP_WARM_TIMEOUT_SECS`
    /// overrides [`DEFAULT_WARM_TIMEOUT`].
    #[must_use]
    pub fn from_env() -> Self {
        let disk_enabled = std::env::var("COMPLIANCE_MAP_DISK_CACHE").map_or(true, |v| v != "0");
        let disk: Arc<dyn SnapshotStore> = if disk_enabled {
            let dir = std::env::var("COMPLIANCE_MAP_CACHE_DIR")
                .unwrap_or_else(|_| DEFAULT_CACHE_DIR.to_string());
            log::info!("Snapshot directory: {dir}");
            Arc::new(DiskStore::new(dir))
        } else {
            log::info!("Disk snapshots disabled");
            Arc::new(NoopStore)
        };

        let remote = compliance_map_r2::from_env()
            .map(|client| Arc::new(BlobStore::new(client)) as Arc<dyn SnapshotStore>);

        let warm_timeout = std::env::var("COMPLIANCE_MAP_WARM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(DEFAULT_WARM_TIMEOUT, Duration::from_secs);

        Self::new(disk, remote).with_warm_timeout(warm_timeout)
    }

    /// Per-source persistence handle.
    #[must_use]
    pub fn for_source(&self, source: &str) -> Persistence {
        Persistence {
            source: source.to_string(),
            disk: Arc::clone(&self.disk),
            remote: self.remote.clone(),
            blob_checked: AtomicBool::new(false),
            warm_timeout: self.warm_timeout,
        }
    }
}

// ── Per-source persistence ───────────────────────────────────────────────

/// Which tier produced the resident snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WarmSource {
    /// Already resident in process memory.
    Memory,
    /// Loaded from the local disk snapshot.
    Disk,
    /// Loaded from the remote blob store.
    Blob,
    /// Nothing available; waiting for a build.
    Cold,
}

/// Result of the warm path.
#[derive(Debug)]
pub struct Warmed {
    /// Tier that answered.
    pub tier: WarmSource,
    /// The loaded snapshot, unless cold.
    pub snapshot: Option<CacheSnapshot>,
}

/// Result of [`Persistence::save_through`].
#[derive(Debug)]
pub struct SaveThrough {
    /// Disk write result.
    pub disk: Result<(), PersistError>,
    /// Background remote push, if a remote tier exists.
    pub remote: Option<JoinHandle<()>>,
}

/// Persistence for one source.
pub struct Persistence {
    source: String,
    disk: Arc<dyn SnapshotStore>,
    remote: Option<Arc<dyn SnapshotStore>>,
    blob_checked: AtomicBool,
    warm_timeout: Duration,
}

impl Persistence {
    /// Returns `true` once the remote tier has been consulted.
    #[must_use]
    pub fn blob_checked(&self) -> bool {
        self.blob_checked.load(Ordering::SeqCst)
    }

    /// Loads from disk, then from the remote tier (once per process).
    ///
    /// Unreadable snapshots and tiers that exceed the warm budget are
    /// logged and treated as misses. A remote hit is written back to disk
    /// so the next start warms locally.
    pub async fn warm(&self) -> Warmed {
        let source = &self.source;

        match self.load_within(self.disk.as_ref()).await {
            Ok(Some(snapshot)) => {
                log::info!(
                    "{source}: warmed from {} ({} regions, built {})",
                    self.disk.name(),
                    snapshot.meta.loaded_regions.len(),
                    snapshot.meta.built_at
                );
                return Warmed {
                    tier: WarmSource::Disk,
                    snapshot: Some(snapshot),
                };
            }
            Ok(None) => log::debug!("{source}: no {} snapshot", self.disk.name()),
            Err(e) => log::warn!("{source}: {} snapshot unreadable, ignoring: {e}", self.disk.name()),
        }

        if let Some(remote) = &self.remote
            && !self.blob_checked.swap(true, Ordering::SeqCst)
        {
            match self.load_within(remote.as_ref()).await {
                Ok(Some(snapshot)) => {
                    log::info!(
                        "{source}: warmed from {} ({} regions, built {})",
                        remote.name(),
                        snapshot.meta.loaded_regions.len(),
                        snapshot.meta.built_at
                    );
                    if let Err(e) = self.disk.save(source, &snapshot).await {
                        log::warn!("{source}: failed to cache remote snapshot locally: {e}");
                    }
                    return Warmed {
                        tier: WarmSource::Blob,
                        snapshot: Some(snapshot),
                    };
                }
                Ok(None) => log::info!("{source}: no {} snapshot", remote.name()),
                Err(e) => log::warn!("{source}: {} snapshot unavailable: {e}", remote.name()),
            }
        }

        Warmed {
            tier: WarmSource::Cold,
            snapshot: None,
        }
    }

    async fn load_within(
        &self,
        store: &dyn SnapshotStore,
    ) -> Result<Option<CacheSnapshot>, PersistError> {
        tokio::time::timeout(self.warm_timeout, store.load(&self.source))
            .await
            .map_err(|_| PersistError::Timeout {
                tier: store.name(),
                after: self.warm_timeout,
            })?
    }

    /// Writes `snapshot` to disk, then spawns the remote push.
    ///
    /// The disk result is returned for the caller to log. The remote push
    /// logs its own failure; its handle is returned so callers may await it.
    pub async fn save_through(&self, snapshot: &Arc<CacheSnapshot>) -> SaveThrough {
        let disk = self.disk.save(&self.source, snapshot).await;

        let remote = self.remote.as_ref().map(|remote| {
            let remote = Arc::clone(remote);
            let snapshot = Arc::clone(snapshot);
            let source = self.source.clone();
            tokio::spawn(async move {
                match remote.save(&source, &snapshot).await {
                    Ok(()) => log::info!("{source}: pushed snapshot to {}", remote.name()),
                    Err(e) => log::warn!("{source}: {} push failed: {e}", remote.name()),
                }
            })
        });

        SaveThrough { disk, remote }
    }
}
