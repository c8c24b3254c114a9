//! Storage for raw query results, so the database only has to be queried once per variable.
use crate::{util, CohortError, Result};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Whether extraction should query the database (and refresh the cache) or read the cache.
///
/// There is no automatic fallback from one to the other.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Live,
    Cached,
}

/// A key/value store of opaque blobs.
///
/// `get` must fail with [`CohortError::CacheMissing`] when nothing was stored under `key`.
pub trait CacheStore {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result;
}

/// Stores each entry as `<dir>/<key>.bin`.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Note: keys are checked so they can't escape the cache directory.
    pub fn path(&self, key: &str) -> Result<PathBuf> {
        ensure!(
            !key.is_empty()
                && key
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')),
            "invalid cache key \"{}\"",
            key
        );
        Ok(self.dir.join(format!("{}.bin", key)))
    }
}

impl CacheStore for DirCache {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {
                Err(CohortError::CacheMissing { key: key.into() })
                    .with_context(|| format!("reading cache file \"{}\"", path.display()))
            }
            Err(e) => Err(Error::from(e))
                .with_context(|| format!("reading cache file \"{}\"", path.display())),
        }
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result {
        fn inner(path: &Path, bytes: &[u8]) -> Result {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("could not create cache directory")?;
            }
            if util::path_exists(path)? {
                event!(
                    Level::WARN,
                    "overwriting existing cache file at \"{}\"",
                    path.display()
                );
            }
            fs::write(path, bytes)?;
            Ok(())
        }
        let path = self.path(key)?;
        inner(&path, bytes)
            .with_context(|| format!("unable to write cache file \"{}\"", path.display()))
    }
}

/// Keeps entries in memory. Useful in tests and notebooks.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.entries.get(key) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(CohortError::CacheMissing { key: key.into() }.into()),
        }
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result {
        self.entries.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{CacheStore, DirCache, MemoryCache};
    use crate::CohortError;

    #[test]
    fn dir_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DirCache::new(dir.path().join("nested"));
        cache.put("heart_rate", b"abc").unwrap();
        assert!(dir.path().join("nested/heart_rate.bin").exists());
        assert_eq!(cache.get("heart_rate").unwrap(), b"abc");
        cache.put("heart_rate", b"def").unwrap();
        assert_eq!(cache.get("heart_rate").unwrap(), b"def");
    }

    #[test]
    fn dir_cache_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path());
        let err = cache.get("wbc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::CacheMissing { key }) if key == "wbc"
        ));
    }

    #[test]
    fn dir_cache_rejects_path_keys() {
        let cache = DirCache::new("cache");
        assert!(cache.path("../etc/passwd").is_err());
        assert!(cache.path("").is_err());
        assert!(cache.path("resp_rate").is_ok());
    }

    #[test]
    fn memory_cache() {
        let mut cache = MemoryCache::new();
        assert!(cache.is_empty());
        assert!(cache.get("paco2").is_err());
        cache.put("paco2", &[1, 2, 3]).unwrap();
        assert!(cache.contains("paco2"));
        assert_eq!(cache.get("paco2").unwrap(), vec![1, 2, 3]);
    }
}
