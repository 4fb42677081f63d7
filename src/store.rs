//! Instance store tying an index file and a data file together.

use crate::compactor::{CompactionStats, Compactor};
use crate::error::{Result, StoreError};
use crate::instances::{DataStore, IndexStore};
use crate::types::{EntryList, InstanceKey, StoreStats};
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the instance files.
    pub dir: PathBuf,

    /// Collection name; files are `<collection>.idx` and `<collection>.instances`.
    pub collection: String,

    /// Reclaim once this many index entries are free (0 disables).
    pub max_free_count: u32,

    /// Reclaim once orphaned data exceeds this many bytes (0 disables).
    pub max_orphaned_bytes: u64,

    /// Instance cache size (number of instances).
    pub cache_size: usize,

    /// Sync each file every N writes.
    pub sync_interval: u64,

    /// Whether to create `dir` if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./repository"),
            collection: "instances".to_string(),
            max_free_count: 16,
            max_orphaned_bytes: 1024 * 1024,
            cache_size: 256,
            sync_interval: IndexStore::DEFAULT_SYNC_INTERVAL,
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Config for `collection` under `dir`, defaults elsewhere.
    pub fn new(dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.idx", self.collection))
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("{}.instances", self.collection))
    }

    fn validate(&self) -> Result<()> {
        let valid = !self.collection.is_empty()
            && self
                .collection
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
            && self.collection != "."
            && self.collection != "..";
        if !valid {
            return Err(StoreError::Config(format!(
                "Invalid collection name: {:?}",
                self.collection
            )));
        }
        Ok(())
    }
}

/// The file pair plus everything derived from it.
struct Inner {
    index: IndexStore,
    data: DataStore,

    /// Recently read or written instance bytes.
    cache: LruCache<InstanceKey, Vec<u8>>,
}

/// Persistent instance collection.
///
/// One index file and one data file, guarded by a single mutex so every
/// operation sees and leaves the pair consistent. Space is reclaimed
/// automatically once the free-entry or orphaned-byte thresholds in
/// [`StoreConfig`] are crossed, or on demand via [`reclaim`](Self::reclaim).
pub struct InstanceStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

impl InstanceStore {
    /// Open the collection described by `config`, creating empty files if needed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        if !config.dir.exists() {
            if !config.create_if_missing {
                return Err(StoreError::Config(format!(
                    "Repository directory {} does not exist",
                    config.dir.display()
                )));
            }
            fs::create_dir_all(&config.dir)?;
        }

        let index = IndexStore::open_with_sync_interval(config.index_path(), config.sync_interval)?;
        let data = DataStore::open_with_sync_interval(config.data_path(), config.sync_interval)?;

        let dangling = index
            .enumerate_entries(false)
            .iter()
            .filter(|entry| entry.end() > data.len())
            .count();
        if dangling > 0 {
            warn!(
                collection = %config.collection,
                dangling,
                data_len = data.len(),
                "index entries point past end of data file"
            );
        }

        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        info!(
            collection = %config.collection,
            entries = index.live_count(),
            free = index.free_count(),
            data_bytes = data.len(),
            "opened instance store"
        );

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                index,
                data,
                cache: LruCache::new(cache_size),
            }),
        })
    }

    // --- Instance Operations ---

    /// Store a new instance.
    ///
    /// Fails with `DuplicateKey` if `key` already names a live instance.
    pub fn put(&self, key: &InstanceKey, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { index, data, cache } = &mut *inner;

        if index.lookup_entry(key).is_some() {
            return Err(StoreError::DuplicateKey(key.clone()));
        }

        data.begin_transaction()?;
        let result = data
            .append_instance(bytes)
            .and_then(|offset| index.create_entry(key, offset, bytes.len() as u64));
        finish_transaction(data, result)?;

        cache.put(key.clone(), bytes.to_vec());
        Ok(())
    }

    /// Read an instance.
    pub fn get(&self, key: &InstanceKey) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let Inner { index, data, cache } = &mut *inner;

        if let Some(bytes) = cache.get(key) {
            return Ok(bytes.clone());
        }

        let (offset, size) = index
            .lookup_entry(key)
            .map(|entry| (entry.offset, entry.size))
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let bytes = data.load_instance(offset, size)?;
        cache.put(key.clone(), bytes.clone());
        Ok(bytes)
    }

    /// Whether `key` names a live instance.
    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.inner.lock().index.lookup_entry(key).is_some()
    }

    /// Replace an instance's bytes.
    ///
    /// The new bytes are appended; the old range is left orphaned until the
    /// next reclaim. A failed automatic reclaim does not fail the call.
    pub fn modify(&self, key: &InstanceKey, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        {
            let Inner { index, data, cache } = &mut *inner;

            if index.lookup_entry(key).is_none() {
                return Err(StoreError::NotFound(key.clone()));
            }

            data.begin_transaction()?;
            let result = data.append_instance(bytes).and_then(|offset| {
                index
                    .modify_entry(key, offset, bytes.len() as u64)
                    .map(|_| ())
            });
            finish_transaction(data, result)?;

            cache.put(key.clone(), bytes.to_vec());
        }

        self.reclaim_if_needed(&mut inner);
        Ok(())
    }

    /// Delete an instance.
    ///
    /// A failed automatic reclaim does not fail the call.
    pub fn remove(&self, key: &InstanceKey) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.cache.pop(key);
        let free_count = inner.index.delete_entry(key)?;
        debug!(key = %key, free_count, "removed instance");

        self.reclaim_if_needed(&mut inner);
        Ok(())
    }

    /// Enumerate index entries in file order.
    pub fn list_all(&self, include_free: bool) -> EntryList {
        self.inner.lock().index.enumerate_entries(include_free)
    }

    /// Read every live instance with one pass over the data file.
    pub fn get_all(&self) -> Result<Vec<(InstanceKey, Vec<u8>)>> {
        let mut inner = self.inner.lock();

        let entries = inner.index.enumerate_entries(false);
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let heap = inner.data.load_all_instances()?;
        let heap_len = heap.len() as u64;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            if entry.end() > heap_len {
                return Err(StoreError::Range {
                    offset: entry.offset,
                    size: entry.size,
                    len: heap_len,
                });
            }
            let bytes = heap[entry.offset as usize..entry.end() as usize].to_vec();
            instances.push((entry.key, bytes));
        }
        Ok(instances)
    }

    // --- Typed Operations ---

    /// Serialize `value` with MessagePack and store it.
    pub fn put_object<T: Serialize>(&self, key: &InstanceKey, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.put(key, &bytes)
    }

    /// Read and deserialize an instance stored with [`put_object`](Self::put_object).
    pub fn get_object<T: DeserializeOwned>(&self, key: &InstanceKey) -> Result<T> {
        let bytes = self.get(key)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Store several new instances, all or none.
    ///
    /// Every value is serialized and every key checked before anything is
    /// written. A failure while writing rolls back the appended bytes and
    /// frees any index entries already created for the batch.
    pub fn put_batch<T: Serialize>(&self, items: &[(InstanceKey, T)]) -> Result<()> {
        let mut seen = HashSet::with_capacity(items.len());
        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            if !seen.insert(key) {
                return Err(StoreError::DuplicateKey(key.clone()));
            }
            encoded.push(rmp_serde::to_vec_named(value)?);
        }

        let mut inner = self.inner.lock();
        let Inner { index, data, cache } = &mut *inner;

        if let Some((key, _)) = items.iter().find(|(key, _)| index.lookup_entry(key).is_some()) {
            return Err(StoreError::DuplicateKey(key.clone()));
        }

        data.begin_transaction()?;

        let mut created = 0;
        let result = append_batch(index, data, items, &encoded, &mut created);
        if result.is_err() {
            for (key, _) in &items[..created] {
                if let Err(e) = index.delete_entry(key) {
                    warn!(key = %key, error = %e, "failed to free entry from aborted batch");
                }
            }
        }
        finish_transaction(data, result)?;

        for ((key, _), bytes) in items.iter().zip(encoded) {
            cache.put(key.clone(), bytes);
        }
        debug!(count = items.len(), "stored instance batch");
        Ok(())
    }

    // --- Store Operations ---

    /// Compact both files now.
    pub fn reclaim(&self) -> Result<CompactionStats> {
        let mut inner = self.inner.lock();
        Self::reclaim_locked(&mut inner)
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let live_bytes = inner.index.live_bytes();
        let data_bytes = inner.data.len();

        StoreStats {
            live_entries: inner.index.live_count() as u64,
            free_entries: inner.index.free_count() as u64,
            data_bytes,
            live_bytes,
            orphaned_bytes: data_bytes.saturating_sub(live_bytes),
        }
    }

    /// Sync both files to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.index.sync()?;
        inner.data.sync()?;
        Ok(())
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reclaim once a threshold is crossed. Runs after a change has been
    /// written, so a failure is logged rather than returned.
    fn reclaim_if_needed(&self, inner: &mut Inner) {
        let free_count = inner.index.free_count();
        let orphaned = inner.data.len().saturating_sub(inner.index.live_bytes());

        let too_many_free = self.config.max_free_count > 0 && free_count >= self.config.max_free_count;
        let too_many_orphans =
            self.config.max_orphaned_bytes > 0 && orphaned > self.config.max_orphaned_bytes;

        if !too_many_free && !too_many_orphans {
            return;
        }

        debug!(
            collection = %self.config.collection,
            free_count,
            orphaned,
            "reclaim threshold reached"
        );
        if let Err(e) = Self::reclaim_locked(inner) {
            warn!(
                collection = %self.config.collection,
                error = %e,
                "automatic reclaim failed"
            );
        }
    }

    fn reclaim_locked(inner: &mut Inner) -> Result<CompactionStats> {
        let Inner { index, data, cache } = inner;
        let result = Compactor::new(index, data).run();
        cache.clear();
        result
    }
}

impl Drop for InstanceStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Append every encoded item and index it, counting index entries created.
fn append_batch<T>(
    index: &mut IndexStore,
    data: &mut DataStore,
    items: &[(InstanceKey, T)],
    encoded: &[Vec<u8>],
    created: &mut usize,
) -> Result<()> {
    for ((key, _), bytes) in items.iter().zip(encoded) {
        let offset = data.append_instance(bytes)?;
        index.create_entry(key, offset, bytes.len() as u64)?;
        *created += 1;
    }
    Ok(())
}

/// Commit on success, roll back on failure, and hand back `result`.
fn finish_transaction(data: &mut DataStore, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => data.commit_transaction(),
        Err(e) => {
            if let Err(rollback) = data.rollback_transaction() {
                warn!(
                    path = %data.path().display(),
                    error = %rollback,
                    "failed to roll back data file"
                );
            }
            Err(e)
        }
    }
}
