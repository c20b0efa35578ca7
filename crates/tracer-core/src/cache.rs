//! Cache substrate.
//!
//! A cache must never fail a build: reads that miss or error return `None`,
//! writes that fail are logged and swallowed. Backed by an in-memory
//! write-through layer so a `set` is visible to a same-process `get` before
//! (or regardless of whether) the durable write has landed, and a durable
//! JSON-file-per-key store underneath, matching
//! `fastnode-daemon::cache::DaemonBuildCache`'s RwLock-guarded map plus
//! `tracer_util::fs::atomic_write` for crash-safe persistence.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// An ordered tuple cache key, e.g. `[path, mtime, hash]`. Rendered to a
/// deterministic string (JSON array, insertion order preserved) for the
/// on-disk representation.
pub type CacheKey = Vec<String>;

fn render_key(key: &CacheKey) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

fn key_filename(key: &CacheKey) -> String {
    format!("{:016x}.json", tracer_util::hash::fx_hash32_text(&render_key(key)))
}

/// Contract shared by every cache implementation: bytes/JSON in, bytes/JSON
/// out, never a hard failure.
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// Returns `None` on miss, and on any read/deserialize error (logged,
    /// never surfaced — "a cache must never fail a build").
    fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Persists `value` under `key`. Errors are logged, not surfaced.
    fn set(&self, key: &CacheKey, value: Value);
}

/// Durable JSON-file-per-key cache, with an in-memory write-through layer.
///
/// A `set` updates the in-memory map synchronously, so a subsequent `get`
/// in the same process always observes it, and persists to disk through an
/// atomic write; disk I/O failures are logged and do not propagate.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    memory: RwLock<HashMap<String, Value>>,
}

impl DiskCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key_filename(key))
    }

    fn load_from_disk(&self, key: &CacheKey) -> Option<Value> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache entry corrupt, treating as miss");
                None
            }
        }
    }
}

impl Cache for DiskCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        let rendered = render_key(key);
        if let Some(value) = self.memory.read().unwrap().get(&rendered) {
            return Some(value.clone());
        }

        let value = self.load_from_disk(key)?;
        self.memory
            .write()
            .unwrap()
            .insert(rendered, value.clone());
        Some(value)
    }

    fn set(&self, key: &CacheKey, value: Value) {
        let rendered = render_key(key);
        self.memory
            .write()
            .unwrap()
            .insert(rendered, value.clone());

        let path = self.path_for(key);
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(err) = tracer_util::fs::atomic_write(&path, &bytes) {
                    warn!(path = %path.display(), error = %err, "cache write failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "cache value not serializable, skipping write");
            }
        }
    }
}

/// In-memory-only cache with the identical contract, used for tests and
/// profiling runs where persistence is unwanted.
#[derive(Debug, Default)]
pub struct MockCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MockCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently cached (for test assertions).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MockCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.read().unwrap().get(&render_key(key)).cloned()
    }

    fn set(&self, key: &CacheKey, value: Value) {
        self.entries
            .write()
            .unwrap()
            .insert(render_key(key), value);
    }
}

/// The four persisted cache directories, rooted under a single cache root.
/// `package_resolver_cache` and `module_resolver_cache` are namespaced by
/// the module dependency tree hash so that a lockfile upgrade invalidates
/// them automatically.
#[derive(Debug, Clone)]
pub struct CacheDirs {
    pub ast_cache: PathBuf,
    pub dependency_cache: PathBuf,
    pub package_resolver_cache: PathBuf,
    pub module_resolver_cache: PathBuf,
}

impl CacheDirs {
    #[must_use]
    pub fn new(root: &Path, dependency_tree_hash: &str) -> Self {
        Self {
            ast_cache: root.join("ast_cache"),
            dependency_cache: root.join("dependency_cache"),
            package_resolver_cache: root
                .join("package_resolver_cache")
                .join(dependency_tree_hash),
            module_resolver_cache: root
                .join("module_resolver_cache")
                .join(dependency_tree_hash),
        }
    }
}
