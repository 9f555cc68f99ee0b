//! Result persistence over a narrow blob interface.
//!
//! Layout under the blob root:
//!
//! ```text
//! runs/<run_id>.jsonl           one PersistedResult per line, appended per record
//! summaries/<ts>-<run_id>.json  periodic full snapshots (JSON array)
//! ```
//!
//! Every write happens under a path-scoped lock file. A lock older than the
//! staleness timeout is treated as abandoned and reclaimed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use leadenrich_shared::{
    ContactRecord, EnrichError, INPUT_SOURCE, PersistedResult, Result, RunId, StoreSettings,
};

const RUNS_PREFIX: &str = "runs";
const SUMMARIES_PREFIX: &str = "summaries";
const LOCK_SUFFIX: &str = ".lock";

/// Interval between attempts to take a held lock.
const LOCK_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Blob surface
// ---------------------------------------------------------------------------

/// A held lock. Released when dropped, on every exit path.
pub struct BlobLock {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BlobLock {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for BlobLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Opaque get/put/append/lock storage. Keys are `/`-separated.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the blob at `key` in one step.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Keys directly under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Take the lock scoped to `key`, waiting for (or reclaiming) a holder.
    async fn lock(&self, key: &str) -> Result<BlobLock>;
}

/// [`BlobStore`] on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
    settings: StoreSettings,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, settings: StoreSettings) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EnrichError::io(parent, e))?;
        }
        Ok(())
    }

    /// Contents of the lock at `path` if it was last touched longer ago
    /// than the staleness timeout.
    async fn stale_contents(&self, path: &Path) -> Option<Vec<u8>> {
        let modified = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age <= self.settings.lock_stale {
            return None;
        }
        tokio::fs::read(path).await.ok()
    }

    /// Move the lock at `path` out of the way, but only if it is still the
    /// one observed as stale. A lock taken over by another writer in the
    /// meantime is put back.
    async fn reclaim(&self, path: &Path, observed: &[u8]) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tombstone = path.with_file_name(format!(".{name}.{}.reclaimed", Uuid::now_v7()));

        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EnrichError::io(path, e)),
        }

        let moved = tokio::fs::read(&tombstone)
            .await
            .map_err(|e| EnrichError::io(&tombstone, e))?;
        if moved == observed {
            warn!(path = %path.display(), "reclaimed stale lock");
        } else {
            debug!(path = %path.display(), "lock changed hands before reclaim; restoring");
            if let Err(e) = tokio::fs::hard_link(&tombstone, path).await {
                warn!(path = %path.display(), error = %e, "failed to restore live lock");
            }
        }
        tokio::fs::remove_file(&tombstone)
            .await
            .map_err(|e| EnrichError::io(&tombstone, e))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EnrichError::io(&path, e)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path(key);
        Self::ensure_parent(&target).await?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| EnrichError::io(&temp, e))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| EnrichError::io(&target, e))?;
        Ok(())
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        Self::ensure_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EnrichError::io(&path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| EnrichError::io(&path, e))?;
        file.flush().await.map_err(|e| EnrichError::io(&path, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path(prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EnrichError::io(&dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EnrichError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                keys.push(format!("{prefix}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn lock(&self, key: &str) -> Result<BlobLock> {
        let path = PathBuf::from(format!("{}{LOCK_SUFFIX}", self.path(key).display()));
        Self::ensure_parent(&path).await?;
        let started = Instant::now();

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let owner = format!(
                        "{} {} {}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339(),
                        Uuid::now_v7()
                    );
                    file.write_all(owner.as_bytes())
                        .await
                        .map_err(|e| EnrichError::io(&path, e))?;
                    file.flush().await.map_err(|e| EnrichError::io(&path, e))?;
                    let release_path = path.clone();
                    return Ok(BlobLock::new(move || release(&release_path, owner.as_bytes())));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = self.stale_contents(&path).await {
                        self.reclaim(&path, &observed).await?;
                        continue;
                    }
                    if started.elapsed() >= self.settings.lock_wait {
                        return Err(EnrichError::Storage(format!(
                            "timed out after {}ms waiting for lock {}",
                            self.settings.lock_wait.as_millis(),
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(EnrichError::io(&path, e)),
            }
        }
    }
}

/// Remove the lock at `path` if it still carries `owner`.
fn release(path: &Path, owner: &[u8]) {
    match std::fs::read(path) {
        Ok(contents) if contents == owner => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to release lock");
            }
        }
        Ok(_) => warn!(path = %path.display(), "lock was taken over; leaving it in place"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to release lock"),
    }
}

// ---------------------------------------------------------------------------
// ResultStore
// ---------------------------------------------------------------------------

/// Per-run result persistence and cross-run aggregation.
#[derive(Clone)]
pub struct ResultStore {
    blobs: Arc<dyn BlobStore>,
    run_id: RunId,
}

impl ResultStore {
    pub fn new(blobs: Arc<dyn BlobStore>, run_id: RunId) -> Self {
        Self { blobs, run_id }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Key of this run's JSON-lines artifact.
    pub fn run_artifact(&self) -> String {
        format!("{RUNS_PREFIX}/{}.jsonl", self.run_id)
    }

    /// Append `record` to this run's artifact under the artifact lock.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn save_incremental(&self, record: &ContactRecord) -> Result<PersistedResult> {
        let key = record
            .identity_key()
            .ok_or_else(|| EnrichError::validation("record has no identity key"))?;
        let result = PersistedResult {
            key,
            record: record.clone(),
            run_id: self.run_id.clone(),
            saved_at: Utc::now(),
        };

        let mut line =
            serde_json::to_vec(&result).map_err(|e| EnrichError::Storage(e.to_string()))?;
        line.push(b'\n');

        let artifact = self.run_artifact();
        let _lock = self.blobs.lock(&artifact).await?;
        self.blobs.append(&artifact, &line).await?;
        debug!(key = %result.key, fields = record.populated_count(), "record saved");
        Ok(result)
    }

    /// Write a full snapshot of `results` under `summaries/`. Returns its key.
    #[instrument(skip_all, fields(run_id = %self.run_id, count = results.len()))]
    pub async fn write_summary(&self, results: &[PersistedResult]) -> Result<String> {
        let key = format!(
            "{SUMMARIES_PREFIX}/{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            self.run_id
        );
        let bytes =
            serde_json::to_vec_pretty(results).map_err(|e| EnrichError::Storage(e.to_string()))?;

        let _lock = self.blobs.lock(&key).await?;
        self.blobs.put(&key, &bytes).await?;
        info!(%key, "summary written");
        Ok(key)
    }

    /// Read every run artifact and summary, then deduplicate by identity key.
    #[instrument(skip_all)]
    pub async fn load_aggregate(&self) -> Result<Vec<PersistedResult>> {
        let mut all = Vec::new();

        for key in self.blobs.list(RUNS_PREFIX).await? {
            let Some(bytes) = self.blobs.get(&key).await? else {
                continue;
            };
            for (n, line) in String::from_utf8_lossy(&bytes).lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PersistedResult>(line) {
                    Ok(result) => all.push(result),
                    Err(e) => warn!(%key, line = n + 1, error = %e, "skipping unreadable result line"),
                }
            }
        }

        for key in self.blobs.list(SUMMARIES_PREFIX).await? {
            let Some(bytes) = self.blobs.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<Vec<PersistedResult>>(&bytes) {
                Ok(results) => all.extend(results),
                Err(e) => warn!(%key, error = %e, "skipping unreadable summary"),
            }
        }

        let read = all.len();
        let merged = dedupe_all(all);
        info!(read, unique = merged.len(), "aggregate loaded");
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Dedupe
// ---------------------------------------------------------------------------

/// Merge two results sharing an identity key.
///
/// The entry with strictly more populated fields wins; a tie goes to the more
/// recent `saved_at`. Fields the winner lacks are then filled from the loser,
/// so the merge never empties a field.
pub fn dedupe(a: &PersistedResult, b: &PersistedResult) -> PersistedResult {
    let (a_count, b_count) = (a.record.populated_count(), b.record.populated_count());
    let a_wins = match a_count.cmp(&b_count) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.saved_at >= b.saved_at,
    };
    let (winner, loser) = if a_wins { (a, b) } else { (b, a) };

    let mut merged = winner.clone();
    for (field, value) in loser.record.populated() {
        let source = loser.record.source_of(field).unwrap_or(INPUT_SOURCE);
        merged.record.set_if_empty(field, value, source);
    }
    merged
}

/// Collapse a list to one entry per identity key, keeping first-seen order.
pub fn dedupe_all(results: impl IntoIterator<Item = PersistedResult>) -> Vec<PersistedResult> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<PersistedResult> = Vec::new();
    for result in results {
        match index.get(&result.key) {
            Some(&i) => out[i] = dedupe(&out[i], &result),
            None => {
                index.insert(result.key.clone(), out.len());
                out.push(result);
            }
        }
    }
    out
}
