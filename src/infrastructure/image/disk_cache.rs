//! Disk-based cache of raw source bytes, persisted across sessions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::disk_journal::{JOURNAL_FILE_NAME, Journal, JournalOp, JournalRecord, JournalWriter};
use crate::domain::entities::RequestKey;
use crate::domain::errors::{CacheError, CacheResult};

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "img";
const TEMP_EXTENSION: &str = "tmp";

/// The journal is compacted once it holds more than this many records per
/// live entry.
const COMPACT_RATIO: usize = 4;
/// Records allowed on top of the ratio before compacting.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Clone)]
struct IndexEntry {
    file: String,
    len: u64,
    last_access: DateTime<Utc>,
    seq: u64,
    pins: usize,
    doomed: bool,
    // False while the file is still being renamed into place.
    committed: bool,
}

struct IndexState {
    entries: HashMap<String, IndexEntry>,
    // Access sequence -> key, least recently used first.
    order: BTreeMap<u64, String>,
    total_bytes: u64,
    next_seq: u64,
    journal_records: usize,
    writer: JournalWriter,
}

impl IndexState {
    fn new(writer: JournalWriter) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            total_bytes: 0,
            next_seq: 0,
            journal_records: 0,
            writer,
        }
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Insert { key, file, len, at } => self.insert(key, file, len, at),
            JournalRecord::Touch { key, at } => {
                self.touch(&key, at);
            }
            JournalRecord::Remove { key } => {
                self.forget(&key);
            }
        }
    }

    fn insert(&mut self, key: String, file: String, len: u64, at: DateTime<Utc>) {
        let pins = self.forget(&key).map_or(0, |old| old.pins);
        let seq = self.bump();
        self.order.insert(seq, key.clone());
        self.total_bytes += len;
        self.entries.insert(
            key,
            IndexEntry {
                file,
                len,
                last_access: at,
                seq,
                pins,
                doomed: false,
                committed: true,
            },
        );
    }

    fn touch(&mut self, key: &str, at: DateTime<Utc>) -> bool {
        let seq = self.bump();
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        self.order.remove(&entry.seq);
        entry.seq = seq;
        entry.last_access = at;
        self.order.insert(seq, key.to_string());
        true
    }

    fn forget(&mut self, key: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.total_bytes -= entry.len;
        Some(entry)
    }

    fn snapshot(&self) -> Vec<JournalRecord> {
        self.order
            .values()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                Some(JournalRecord::Insert {
                    key: key.clone(),
                    file: entry.file.clone(),
                    len: entry.len,
                    at: entry.last_access,
                })
            })
            .collect()
    }

    fn log(&mut self, record: JournalRecord) {
        self.journal_records += 1;
        self.writer.send(JournalOp::Append(record));
    }

    fn rewrite_journal(&mut self) {
        let snapshot = self.snapshot();
        self.journal_records = snapshot.len();
        self.writer.send(JournalOp::Rewrite(snapshot));
    }

    fn compact_if_needed(&mut self) {
        if self.journal_records > self.entries.len() * COMPACT_RATIO + COMPACT_SLACK {
            self.rewrite_journal();
        }
    }

    /// Forgets `key` and schedules its file for deletion.
    fn drop_entry(&mut self, key: &str, cache_dir: &Path) -> Option<IndexEntry> {
        let entry = self.forget(key)?;
        self.writer
            .send(JournalOp::RemoveFile(cache_dir.join(&entry.file)));
        self.log(JournalRecord::Remove {
            key: key.to_string(),
        });
        Some(entry)
    }
}

struct Inner {
    cache_dir: PathBuf,
    max_size: u64,
    state: Mutex<IndexState>,
}

impl Inner {
    fn path_for(&self, file: &str) -> PathBuf {
        self.cache_dir.join(file)
    }

    /// Drops entries until the store fits the budget, least recently used
    /// first, skipping entries with an open read pin.
    fn evict_if_needed(&self, state: &mut IndexState) {
        if state.total_bytes <= self.max_size {
            return;
        }

        debug!(
            current_size = state.total_bytes,
            max_size = self.max_size,
            "Disk cache over limit, cleaning up"
        );

        let candidates: Vec<String> = state.order.values().cloned().collect();
        let mut freed_size = 0u64;
        let mut freed_count = 0usize;
        for key in candidates {
            if state.total_bytes <= self.max_size {
                break;
            }
            let pinned = state.entries.get(&key).is_some_and(|e| e.pins > 0);
            if pinned {
                continue;
            }
            if let Some(entry) = state.drop_entry(&key, &self.cache_dir) {
                freed_size += entry.len;
                freed_count += 1;
            }
        }

        debug!(freed_size, freed_count, "Disk cache cleanup complete");
    }

    fn unpin(&self, key: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 && entry.doomed {
            if state.drop_entry(key, &self.cache_dir).is_some() {
                trace!(key, "Removed doomed disk cache entry");
            }
        } else if entry.pins == 0 {
            self.evict_if_needed(&mut state);
        }
    }
}

/// A committed disk cache entry.
///
/// Holding the entry pins it: eviction and removal leave its file alone
/// until the entry is dropped.
pub struct DiskEntry {
    key: String,
    byte_length: u64,
    path: PathBuf,
    last_access: DateTime<Utc>,
    inner: Arc<Inner>,
}

impl DiskEntry {
    /// The cache key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size of the stored bytes.
    #[must_use]
    pub const fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Location of the entry's file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the entry was last read or written.
    #[must_use]
    pub const fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    /// Reads the stored bytes.
    ///
    /// # Errors
    /// Returns error if the file cannot be read.
    pub async fn read(&self) -> CacheResult<Bytes> {
        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache file: {e}")))?;
        Ok(Bytes::from(bytes))
    }
}

impl Drop for DiskEntry {
    fn drop(&mut self) {
        self.inner.unpin(&self.key);
    }
}

impl std::fmt::Debug for DiskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskEntry")
            .field("key", &self.key)
            .field("byte_length", &self.byte_length)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Byte-budgeted LRU store of raw source bytes.
///
/// One file per entry, named by a digest of its key, plus a journal that
/// records sizes and access order. Writes land in a temp file first and are
/// renamed into place, so readers never observe partial files. Journal
/// updates, renames and deletions run on a background writer, never under
/// the index lock.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    /// Opens (or creates) a disk cache in the specified directory.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn new(cache_dir: PathBuf, max_size: u64) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let journal = Journal::new(&cache_dir);
        let (journal, replayed) = tokio::task::spawn_blocking(move || {
            let replayed = journal.replay();
            (journal, replayed)
        })
        .await
        .map_err(|e| CacheError::JournalError(format!("Journal replay task failed: {e}")))?;

        let mut state = IndexState::new(JournalWriter::spawn(journal));
        let needs_rewrite = match replayed {
            Ok(Some(records)) => {
                state.journal_records = records.len();
                for record in records {
                    state.apply(record);
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Disk cache journal unreadable, starting empty");
                true
            }
        };

        let inner = Arc::new(Inner {
            cache_dir,
            max_size,
            state: Mutex::new(state),
        });
        let cache = Self { inner };
        cache.reconcile(needs_rewrite).await?;
        cache.flush().await;
        Ok(cache)
    }

    /// Opens a cache in the default location (~/.cache/pixload/images/).
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn default_location() -> CacheResult<Self> {
        Self::new(dirs_cache_path(), DEFAULT_MAX_CACHE_SIZE).await
    }

    /// Drops index entries whose files vanished or changed size, and files
    /// nobody indexes (stale temp files, entries from a lost journal).
    async fn reconcile(&self, rewrite: bool) -> CacheResult<()> {
        let mut on_disk: HashMap<String, u64> = HashMap::new();
        let mut entries = fs::read_dir(&self.inner.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if name == JOURNAL_FILE_NAME {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some(ENTRY_EXTENSION) => {
                    if let Ok(meta) = entry.metadata().await {
                        on_disk.insert(name, meta.len());
                    }
                }
                Some(TEMP_EXTENSION) => {
                    let _ = fs::remove_file(&path).await;
                }
                _ => {}
            }
        }

        let mut state = self.inner.state.lock();
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| on_disk.get(&e.file) != Some(&e.len))
            .map(|(k, _)| k.clone())
            .collect();
        let dirty = rewrite || !stale.is_empty();
        for key in stale {
            state.forget(&key);
        }

        let indexed: Vec<&str> = state.entries.values().map(|e| e.file.as_str()).collect();
        let orphans: Vec<String> = on_disk
            .keys()
            .filter(|name| !indexed.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in orphans {
            state
                .writer
                .send(JournalOp::RemoveFile(self.inner.path_for(&name)));
        }

        if dirty {
            state.rewrite_journal();
        }

        self.inner.evict_if_needed(&mut state);
        debug!(
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "Opened disk cache"
        );
        Ok(())
    }

    fn file_name(key: &str) -> String {
        format!("{}.{ENTRY_EXTENSION}", RequestKey::from(key).digest())
    }

    /// Looks up `key`, pinning and touching the entry.
    pub fn get(&self, key: &str) -> Option<DiskEntry> {
        let mut state = self.inner.state.lock();
        let now = Utc::now();

        let (file, len) = match state.entries.get_mut(key) {
            Some(entry) if entry.committed && !entry.doomed => {
                entry.pins += 1;
                (entry.file.clone(), entry.len)
            }
            _ => {
                trace!(key, "Disk cache miss");
                return None;
            }
        };
        state.touch(key, now);
        state.log(JournalRecord::Touch {
            key: key.to_string(),
            at: now,
        });
        state.compact_if_needed();

        trace!(key, "Disk cache hit");
        Some(DiskEntry {
            key: key.to_string(),
            byte_length: len,
            path: self.inner.path_for(&file),
            last_access: now,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Reads the bytes for `key`, treating any I/O failure as a miss.
    pub async fn get_bytes(&self, key: &str) -> Option<Bytes> {
        let entry = self.get(key)?;
        match entry.read().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(key, error = %e, "Disk cache entry unreadable, dropping it");
                drop(entry);
                self.remove(key);
                None
            }
        }
    }

    /// Stores bytes under `key`.
    ///
    /// # Errors
    /// Returns error if the entry exceeds the whole budget or the file
    /// cannot be written.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<DiskEntry> {
        let len = bytes.len() as u64;
        if len > self.inner.max_size {
            return Err(CacheError::TooLarge {
                size: len,
                budget: self.inner.max_size,
            });
        }

        let file = Self::file_name(key);
        let path = self.inner.path_for(&file);
        let tmp = self
            .inner
            .cache_dir
            .join(format!("{file}.{}.{TEMP_EXTENSION}", uuid::Uuid::new_v4().simple()));

        if let Err(e) = write_file(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        // The rename goes through the writer so it stays ordered after any
        // deletion of an older file under the same name.
        let now = Utc::now();
        let (done, committed) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            state.insert(key.to_string(), file.clone(), len, now);
            if let Some(entry) = state.entries.get_mut(key) {
                entry.pins += 1;
                entry.committed = false;
            }
            state.writer.send(JournalOp::Commit {
                from: tmp,
                to: path.clone(),
                done,
            });
            state.log(JournalRecord::Insert {
                key: key.to_string(),
                file,
                len,
                at: now,
            });
            self.inner.evict_if_needed(&mut state);
            state.compact_if_needed();
        }

        let result = match committed.await {
            Ok(result) => result.map_err(|e| format!("Failed to commit cache file: {e}")),
            Err(_) => Err("Disk cache writer stopped".to_string()),
        };
        let entry = DiskEntry {
            key: key.to_string(),
            byte_length: len,
            path,
            last_access: now,
            inner: Arc::clone(&self.inner),
        };

        if let Err(message) = result {
            self.remove(key);
            drop(entry);
            return Err(CacheError::IoError(message));
        }
        if let Some(indexed) = self.inner.state.lock().entries.get_mut(key) {
            indexed.committed = true;
        }

        debug!(key, path = %entry.path.display(), size = len, "Stored bytes in disk cache");
        Ok(entry)
    }

    /// Checks if `key` is cached.
    pub fn exists(&self, key: &str) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.committed && !e.doomed)
    }

    /// Removes `key`. An entry that is being read is hidden right away and
    /// deleted when its last reader finishes.
    pub fn remove(&self, key: &str) {
        let mut state = self.inner.state.lock();
        let pinned = match state.entries.get_mut(key) {
            Some(entry) if entry.pins > 0 => {
                entry.doomed = true;
                true
            }
            Some(_) => false,
            None => return,
        };
        if pinned {
            debug!(key, "Disk cache entry busy, removal deferred");
            return;
        }
        if state.drop_entry(key, &self.inner.cache_dir).is_some() {
            debug!(key, "Evicted from disk cache");
        }
    }

    /// Clears every entry that is not being read.
    pub fn clear(&self) {
        let keys: Vec<String> = self.inner.state.lock().entries.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
        debug!("Cleared disk cache");
    }

    /// Waits until every queued journal update, rename and deletion has
    /// reached the file system.
    pub async fn flush(&self) {
        let writer = self.inner.state.lock().writer.clone();
        writer.flush().await;
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.inner.state.lock().total_bytes
    }

    /// Returns the number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.cache_dir
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to create cache file: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to write cache file: {e}")))?;
    file.flush()
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to flush cache file: {e}")))?;
    Ok(())
}

/// Returns the default cache directory path.
#[must_use]
pub fn dirs_cache_path() -> PathBuf {
    directories::ProjectDirs::from("com", "pixload", "pixload").map_or_else(
        || std::env::temp_dir().join("pixload").join("cache").join("images"),
        |dirs| dirs.cache_dir().join("images"),
    )
}
