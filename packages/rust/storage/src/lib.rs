//! Persistence for leadenrich.
//!
//! Two surfaces live here:
//! - [`Storage`]: a libSQL database holding the location cache (tier 2 of
//!   the location cascade)
//! - [`ResultStore`]: per-run result artifacts over a narrow [`BlobStore`]
//!   get/put/append/lock interface, with stale-aware locks

mod migrations;
pub mod results;

use std::path::Path;

use chrono::{DateTime, Utc};
use leadenrich_shared::{EnrichError, LocationCacheEntry, LocationTier, Result};
use libsql::{Connection, Database, params};

pub use results::{BlobLock, BlobStore, FsBlobStore, ResultStore, dedupe, dedupe_all};

/// Location cache handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EnrichError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| EnrichError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a throwaway in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;
        let conn = db.connect().map_err(|e| EnrichError::Storage(e.to_string()))?;
        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    EnrichError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Location cache
    // -----------------------------------------------------------------------

    /// Most recent entry for `key`, expired or not. Callers check expiry.
    pub async fn get_location(&self, key: &str) -> Result<Option<LocationCacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT query_key, tier, location_id, full_id, created_at_ms, ttl_secs
                 FROM location_cache WHERE query_key = ?1
                 ORDER BY created_at_ms DESC LIMIT 1",
                params![key],
            )
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(EnrichError::Storage(e.to_string())),
        }
    }

    /// Insert or replace the entry for `(key, tier)`.
    pub async fn put_location(&self, entry: &LocationCacheEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO location_cache (query_key, tier, location_id, full_id, created_at_ms, ttl_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(query_key, tier) DO UPDATE SET
                   location_id = excluded.location_id,
                   full_id = excluded.full_id,
                   created_at_ms = excluded.created_at_ms,
                   ttl_secs = excluded.ttl_secs",
                params![
                    entry.key.as_str(),
                    entry.tier.as_str(),
                    entry.id.as_deref(),
                    entry.full_id.as_deref(),
                    entry.created_at.timestamp_millis(),
                    entry.ttl_secs,
                ],
            )
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;
        tracing::debug!(key = %entry.key, tier = %entry.tier, negative = entry.is_negative(), "location cached");
        Ok(())
    }

    /// Delete entries whose TTL has elapsed as of `now`. Returns rows removed.
    pub async fn purge_expired_locations(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM location_cache WHERE created_at_ms + ttl_secs * 1000 <= ?1",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;
        if removed > 0 {
            tracing::info!(removed, "purged expired location cache entries");
        }
        Ok(removed)
    }

    /// Number of cached entries, positive and negative.
    pub async fn count_locations(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM location_cache", params![])
            .await
            .map_err(|e| EnrichError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(|e| EnrichError::Storage(e.to_string()))? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(EnrichError::Storage(e.to_string())),
        }
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<LocationCacheEntry> {
    let created_ms = row.get::<i64>(4).map_err(|e| EnrichError::Storage(e.to_string()))?;
    Ok(LocationCacheEntry {
        key: row.get::<String>(0).map_err(|e| EnrichError::Storage(e.to_string()))?,
        tier: row
            .get::<String>(1)
            .map_err(|e| EnrichError::Storage(e.to_string()))?
            .parse::<LocationTier>()?,
        id: row.get::<String>(2).ok(),
        full_id: row.get::<String>(3).ok(),
        created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_default(),
        ttl_secs: row.get::<i64>(5).map_err(|e| EnrichError::Storage(e.to_string()))?,
    })
}
