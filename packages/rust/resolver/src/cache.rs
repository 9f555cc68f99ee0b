//! Tier 2: the persistent location cache seam.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use leadenrich_shared::{LocationCacheEntry, LocationTier, Result};
use leadenrich_storage::Storage;

/// Read-through cache of location resolutions.
#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Most recent entry for `key`, expired or not.
    async fn get(&self, key: &str) -> Result<Option<LocationCacheEntry>>;

    async fn put(&self, entry: &LocationCacheEntry) -> Result<()>;
}

#[async_trait]
impl LocationCache for Storage {
    async fn get(&self, key: &str) -> Result<Option<LocationCacheEntry>> {
        self.get_location(key).await
    }

    async fn put(&self, entry: &LocationCacheEntry) -> Result<()> {
        self.put_location(entry).await
    }
}

/// Process-local cache, for tests and one-off CLI runs without a database.
#[derive(Default)]
pub struct InMemoryLocationCache {
    entries: Mutex<HashMap<(String, LocationTier), LocationCacheEntry>>,
}

impl InMemoryLocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl LocationCache for InMemoryLocationCache {
    async fn get(&self, key: &str) -> Result<Option<LocationCacheEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|e| e.key == key)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn put(&self, entry: &LocationCacheEntry) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert((entry.key.clone(), entry.tier), entry.clone());
        Ok(())
    }
}
