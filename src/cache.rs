//! Persistent key → artifact cache with schema versioning
//!
//! A single JSON document (`index.json`) maps opaque string keys to
//! `{data: <absolute path>, time: <unix seconds>}` entries alongside a
//! reserved `cache_version` tag. Cached blobs live in a `files/`
//! subdirectory owned by the cache. The index self-heals: a version mismatch
//! or parse failure resets it to an empty, freshly-versioned document (the
//! referenced files become orphans, never merged back), and entries whose
//! backing file vanished are pruned on lookup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Current index schema version. A mismatch on load resets the index.
pub const CACHE_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    cache_version: u32,
    #[serde(flatten)]
    entries: HashMap<String, CacheEntry>,
}

impl IndexDocument {
    fn empty() -> Self {
        Self {
            cache_version: CACHE_VERSION,
            entries: HashMap::new(),
        }
    }
}

/// Stored metadata for one cached key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Absolute path of the backing artifact on disk.
    pub data: PathBuf,
    /// Unix timestamp (seconds) of the last write for this key.
    pub time: f64,
}

/// JSON-backed key → artifact index.
///
/// Every read-modify-write is whole-document and serialized by an in-process
/// mutex; cross-process writers still need external coordination.
pub struct CacheIndex {
    index_path: PathBuf,
    files_dir: PathBuf,
    lock: Mutex<()>,
}

impl CacheIndex {
    /// Open (or create) a cache rooted at `root`, which will contain
    /// `index.json` and a `files/` blob directory.
    pub fn new(root: &Path) -> Result<Self> {
        let files_dir = root.join("files");
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("failed to create cache directory {}", root.display()))?;
        Ok(Self {
            index_path: root.join("index.json"),
            files_dir,
            lock: Mutex::new(()),
        })
    }

    /// Whether the backing file exists, parses, and carries the current
    /// schema version.
    pub fn is_valid(&self) -> bool {
        let _guard = self.lock.lock().unwrap();
        self.load().is_some()
    }

    /// Rewrite the index as an empty, freshly-versioned document.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.write(&IndexDocument::empty())
    }

    /// Look up a key. Resets an invalid index first; prunes (and persists the
    /// removal of) an entry whose backing file no longer exists.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.load_or_reset().ok()?;
        let entry = doc.entries.get(key)?.clone();
        if !entry.data.is_file() {
            debug!("pruning cache entry '{}': backing file is gone", key);
            doc.entries.remove(key);
            if let Err(e) = self.write(&doc) {
                warn!("failed to persist pruned cache index: {:#}", e);
            }
            return None;
        }
        Some(entry)
    }

    /// Insert or overwrite a key pointing at `artifact_path`, stamped with
    /// the current time.
    pub fn put(&self, key: &str, artifact_path: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.load_or_reset()?;
        doc.entries.insert(
            key.to_string(),
            CacheEntry {
                data: artifact_path.to_path_buf(),
                time: now(),
            },
        );
        self.write(&doc)
    }

    /// Remove a key, optionally deleting its backing file.
    pub fn remove(&self, key: &str, delete_backing_file: bool) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.load_or_reset()?;
        if let Some(entry) = doc.entries.remove(key) {
            if delete_backing_file && entry.data.is_file() {
                if let Err(e) = fs::remove_file(&entry.data) {
                    warn!(
                        "failed to delete cached file {}: {}",
                        entry.data.display(),
                        e
                    );
                }
            }
            self.write(&doc)?;
        }
        Ok(())
    }

    /// Serialize `value` to `files/<key>.json` and index it under `key`.
    /// Returns the path of the written blob.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<PathBuf> {
        let path = self.files_dir.join(format!("{}.json", key));
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize cache value for '{}'", key))?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write cache blob {}", path.display()))?;
        self.put(key, &path)?;
        Ok(path)
    }

    /// Fetch and deserialize the JSON blob stored under `key`, together with
    /// its write timestamp.
    pub fn get_json(&self, key: &str) -> Option<(Value, f64)> {
        let entry = self.lookup(key)?;
        let content = match fs::read_to_string(&entry.data) {
            Ok(content) => content,
            Err(e) => {
                warn!("failed to read cache blob for '{}': {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some((value, entry.time)),
            Err(e) => {
                warn!("cache blob for '{}' is not valid JSON: {}", key, e);
                None
            }
        }
    }

    /// Move (not copy) an existing file into the cache's `files/` directory,
    /// overwriting any same-named blob, and index it under `key`. Returns the
    /// file's new path.
    pub fn put_file(&self, key: &str, existing_file: &Path) -> Result<PathBuf> {
        let name = existing_file
            .file_name()
            .with_context(|| format!("cache file has no name: {}", existing_file.display()))?;
        let dest = self.files_dir.join(name);
        if dest != existing_file {
            if dest.exists() {
                fs::remove_file(&dest)
                    .with_context(|| format!("failed to replace cached file {}", dest.display()))?;
            }
            move_file(existing_file, &dest)?;
        }
        self.put(key, &dest)?;
        Ok(dest)
    }

    /// Directory where this cache stores its blobs.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    // Lock must be held by the caller for everything below.

    fn load(&self) -> Option<IndexDocument> {
        let content = fs::read_to_string(&self.index_path).ok()?;
        let doc: IndexDocument = serde_json::from_str(&content).ok()?;
        if doc.cache_version != CACHE_VERSION {
            return None;
        }
        Some(doc)
    }

    fn load_or_reset(&self) -> Result<IndexDocument> {
        if let Some(doc) = self.load() {
            return Ok(doc);
        }
        warn!(
            "cache index {} is missing, corrupt, or outdated; resetting",
            self.index_path.display()
        );
        let doc = IndexDocument::empty();
        self.write(&doc)?;
        Ok(doc)
    }

    fn write(&self, doc: &IndexDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&self.index_path, content)
            .with_context(|| format!("failed to write cache index {}", self.index_path.display()))
    }
}

/// Rename, falling back to copy + remove for cross-filesystem moves.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| format!("failed to move {} into cache", from.display()))?;
    fs::remove_file(from)
        .with_context(|| format!("failed to remove original {}", from.display()))?;
    Ok(())
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
