use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CacheError;

/// Key to bytes store backing the cache.
///
/// Writes are last-writer-wins per key; there is no atomicity across keys.
pub trait ByteStore: Send + Sync {
    /// Returns the bytes stored under `key`, or `None` if absent or unreadable.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stores `bytes` under `key`, overwriting any previous entry.
    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;
}

/// Longest escaped key used verbatim as a file stem. Leaves room for the
/// `.json.tmp` suffix under the common 255-byte file name limit.
const MAX_ESCAPED_STEM_LEN: usize = 200;

/// Prefix of digest-named files. Never produced by `escape_key`.
const DIGEST_PREFIX: &str = "~sha256-";

/// One file per key under a cache directory.
pub struct DiskByteStore {
    cache_dir: PathBuf,
}

impl DiskByteStore {
    pub fn new(cache_dir: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", file_stem(key)))
    }
}

impl ByteStore for DiskByteStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.cache_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(key = key, error = %e, "Failed to read cache file");
                None
            }
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.cache_path(key);
        // Write then rename so readers never see a partial entry
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// File stem for a key: the escaped key when short enough, otherwise a
/// digest of the full key.
fn file_stem(key: &str) -> String {
    let escaped = escape_key(key);
    if escaped.len() <= MAX_ESCAPED_STEM_LEN {
        return escaped;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
}

/// Maps a cache key onto a file name. Distinct keys give distinct names.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Process-local store, mostly for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryByteStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteStore for MemoryByteStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
