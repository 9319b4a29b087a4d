//! In-process blob store for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{BlobClient, BlobError, BlobObject};

/// A [`BlobClient`] backed by a map. Counts calls so callers can assert
/// how often the remote tier was touched.
#[derive(Default)]
pub struct MemoryBlobClient {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    lists: AtomicUsize,
}

impl MemoryBlobClient {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes at `key`.
    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    /// Number of `put` calls so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `list` calls so far.
    #[must_use]
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobClient for MemoryBlobClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| BlobObject {
                key: key.clone(),
                url: None,
                size: body.len() as u64,
            })
            .collect())
    }

    async fn get(&self, object: &BlobObject) -> Result<Vec<u8>, BlobError> {
        self.object(&object.key)
            .await
            .ok_or_else(|| BlobError::Status {
                key: object.key.clone(),
                status: 404,
            })
    }
}
