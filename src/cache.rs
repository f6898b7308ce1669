//! On-disk snapshot store, one JSON file per repository.
//!
//! Entries are immutable once written: a refresh builds a new [`CacheEntry`] and
//! swaps it in whole, both in memory and on disk (temp file + rename), so readers
//! only ever see a complete snapshot.

use crate::{
    error::{RepoError, RepoResult},
    package::Package,
    utils::{calculate_checksum, format_size, sanitize_filename},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

const ENTRIES_DIR: &str = "repositories";
const COUNTERS_FILE: &str = "stats.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub repository_name: String,
    /// parse order of the source document
    pub packages: Vec<Package>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// last time the package content actually changed
    pub changed_at: DateTime<Utc>,
    pub content_checksum: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or_default()
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            repository_name: self.repository_name.clone(),
            package_count: self.packages.len(),
            fetched_at: self.fetched_at,
            expires_at: self.expires_at,
            changed_at: self.changed_at,
            fresh: !self.is_expired(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Summary of one cached snapshot, without the packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub repository_name: String,
    pub package_count: usize,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub fresh: bool,
    pub metadata: BTreeMap<String, String>,
}

// Enough of an entry to decide on expiry without keeping the package list.
#[derive(Debug, Deserialize)]
struct EntryHeader {
    repository_name: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size: u64,
    /// hit rate of this process, 0.0 when nothing was looked up yet
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub lifetime_hits: u64,
    pub lifetime_misses: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PersistedCounters {
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    entries: DashMap<String, Arc<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    baseline: Mutex<PersistedCounters>,
}

impl CacheStore {
    pub async fn open(cache_dir: impl AsRef<Path>) -> RepoResult<Self> {
        let root = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(root.join(ENTRIES_DIR)).await?;

        let baseline = match fs::read(root.join(COUNTERS_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable cache counters: {}", e);
                PersistedCounters::default()
            }),
            Err(_) => PersistedCounters::default(),
        };

        debug!("Opened cache store at {}", root.display());
        Ok(Self {
            root,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            baseline: Mutex::new(baseline),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root
            .join(ENTRIES_DIR)
            .join(format!("{}.json", sanitize_filename(name)))
    }

    /// Fresh entry for `name`, or `None` when absent, expired, or older than `max_age`.
    pub async fn get(&self, name: &str, max_age: Option<Duration>) -> Option<Arc<CacheEntry>> {
        let found = self.peek(name).await.filter(|entry| {
            if entry.is_expired() {
                return false;
            }
            match max_age {
                Some(max_age) => entry.age() <= max_age,
                None => true,
            }
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}", name);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for {}", name);
        }
        found
    }

    /// Entry for `name` regardless of expiry. Does not touch hit/miss counters.
    pub async fn peek(&self, name: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.entries.get(name) {
            return Some(entry.value().clone());
        }

        let path = self.entry_path(name);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.repository_name == name => {
                let entry = Arc::new(entry);
                // a concurrent put may have landed while we were reading
                let stored = self
                    .entries
                    .entry(name.to_string())
                    .or_insert(entry)
                    .value()
                    .clone();
                Some(stored)
            }
            Ok(entry) => {
                warn!(
                    "Cache file {} belongs to '{}', not '{}'; ignoring",
                    path.display(),
                    entry.repository_name,
                    name
                );
                None
            }
            Err(e) => {
                warn!("Corrupt cache file {}: {}; discarding", path.display(), e);
                let _ = fs::remove_file(&path).await;
                None
            }
        }
    }

    pub async fn put(
        &self,
        name: &str,
        packages: Vec<Package>,
        ttl: Duration,
    ) -> RepoResult<Arc<CacheEntry>> {
        self.put_with_metadata(name, packages, ttl, BTreeMap::new())
            .await
    }

    /// Stores a new snapshot. When the package content is identical to the
    /// previous one only the timestamps move forward.
    pub async fn put_with_metadata(
        &self,
        name: &str,
        packages: Vec<Package>,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> RepoResult<Arc<CacheEntry>> {
        let serialized = serde_json::to_vec(&packages)
            .map_err(|e| RepoError::CacheError(format!("cannot serialize packages: {}", e)))?;
        let checksum = calculate_checksum(&serialized);

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl.max(Duration::from_millis(1)))
            .map_err(|e| RepoError::CacheError(format!("invalid ttl: {}", e)))?;

        let previous = self.peek(name).await;
        let entry = match previous {
            Some(prev) if prev.content_checksum == checksum => {
                debug!("Content for {} unchanged, extending expiry", name);
                CacheEntry {
                    repository_name: name.to_string(),
                    packages: prev.packages.clone(),
                    fetched_at: now,
                    expires_at: now + ttl,
                    changed_at: prev.changed_at,
                    content_checksum: checksum,
                    metadata: if metadata.is_empty() {
                        prev.metadata.clone()
                    } else {
                        metadata
                    },
                }
            }
            _ => CacheEntry {
                repository_name: name.to_string(),
                packages,
                fetched_at: now,
                expires_at: now + ttl,
                changed_at: now,
                content_checksum: checksum,
                metadata,
            },
        };

        let entry = Arc::new(entry);
        self.write_entry(&entry).await?;
        self.entries.insert(name.to_string(), entry.clone());
        debug!(
            "Cached {} packages for {} until {}",
            entry.packages.len(),
            name,
            entry.expires_at
        );
        Ok(entry)
    }

    async fn write_entry(&self, entry: &CacheEntry) -> RepoResult<()> {
        let content = serde_json::to_vec(entry)
            .map_err(|e| RepoError::CacheError(format!("cannot serialize entry: {}", e)))?;
        let path = self.entry_path(&entry.repository_name);
        let dir = self.root.join(ENTRIES_DIR);
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &content)).await??;
        Ok(())
    }

    pub async fn invalidate(&self, name: &str) -> RepoResult<bool> {
        let in_memory = self.entries.remove(name).is_some();
        let on_disk = match fs::remove_file(self.entry_path(name)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if in_memory || on_disk {
            debug!("Invalidated cache for {}", name);
        }
        Ok(in_memory || on_disk)
    }

    pub async fn clear_all(&self) -> RepoResult<usize> {
        let mut removed: HashSet<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.entries.clear();

        for (path, header) in self.scan().await? {
            if let Some(header) = header {
                removed.insert(header.repository_name);
            } else {
                removed.insert(path.display().to_string());
            }
            fs::remove_file(&path).await?;
        }

        info!("Cleared {} cache entries", removed.len());
        Ok(removed.len())
    }

    pub async fn cleanup_expired(&self) -> RepoResult<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for (path, header) in self.scan().await? {
            match header {
                Some(header) if header.expires_at < now => {
                    self.entries.remove(&header.repository_name);
                    fs::remove_file(&path).await?;
                    removed += 1;
                }
                Some(_) => {}
                None => {
                    // unreadable files are as good as expired
                    fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        self.entries.retain(|_, entry| !entry.is_expired_at(now));

        if removed > 0 {
            info!("Removed {} expired cache entries", removed);
        }
        Ok(removed)
    }

    async fn scan(&self) -> RepoResult<Vec<(PathBuf, Option<EntryHeader>)>> {
        let mut found = Vec::new();
        let mut dir = match fs::read_dir(self.root.join(ENTRIES_DIR)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let header = fs::read(&path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<EntryHeader>(&bytes).ok());
            found.push((path, header));
        }
        Ok(found)
    }

    pub async fn stats(&self) -> RepoResult<CacheStats> {
        let mut total_entries = 0;
        let mut total_size = 0;
        let mut dir = fs::read_dir(self.root.join(ENTRIES_DIR)).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.path().extension().and_then(|e| e.to_str()) == Some("json") {
                total_entries += 1;
                total_size += item.metadata().await?.len();
            }
        }

        debug!(
            "Cache holds {} entries ({})",
            total_entries,
            format_size(total_size)
        );

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let baseline = *self.baseline.lock();
        Ok(CacheStats {
            total_entries,
            total_size,
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            hits,
            misses,
            lifetime_hits: baseline.hits + hits,
            lifetime_misses: baseline.misses + misses,
        })
    }

    /// Writes the aggregate hit/miss counters next to the entries.
    pub async fn flush_counters(&self) -> RepoResult<()> {
        let counters = {
            let baseline = self.baseline.lock();
            PersistedCounters {
                hits: baseline.hits + self.hits.load(Ordering::Relaxed),
                misses: baseline.misses + self.misses.load(Ordering::Relaxed),
            }
        };
        let content = serde_json::to_vec_pretty(&counters)
            .map_err(|e| RepoError::CacheError(e.to_string()))?;
        let dir = self.root.clone();
        let path = self.root.join(COUNTERS_FILE);
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &content)).await??;
        Ok(())
    }
}

fn write_atomically(dir: &Path, path: &Path, content: &[u8]) -> RepoResult<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
