//! Two-area file store with LRU eviction over the cache area.

use super::StoreError;
use std::collections::HashMap;
use std::fs::{self, File, Metadata, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Access order of cached files. The entry with the smallest tick is
/// the least recently used.
#[derive(Debug, Default)]
struct LruIndex {
    tick: u64,
    entries: HashMap<String, u64>,
}

impl LruIndex {
    fn touch(&mut self, name: &str) {
        self.tick += 1;
        self.entries.insert(name.to_string(), self.tick);
    }

    fn oldest_except(&self, keep: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|(name, _)| name.as_str() != keep)
            .min_by_key(|(_, tick)| **tick)
            .map(|(name, _)| name.clone())
    }
}

/// Files are written under `download/`, then moved atomically into
/// `cache/` once complete. Only `cache/` survives restarts.
#[derive(Debug)]
pub struct FileStore {
    download_dir: PathBuf,
    cache_dir: PathBuf,
    capacity: usize,
    index: Mutex<LruIndex>,
}

impl FileStore {
    /// Open a store rooted at `root`. The download area is wiped; existing
    /// cache files are reloaded oldest-first so eviction order survives
    /// restarts.
    pub fn new(root: &Path, capacity: usize) -> Result<Self, StoreError> {
        let download_dir = root.join("download");
        let cache_dir = root.join("cache");

        if download_dir.exists() {
            fs::remove_dir_all(&download_dir).map_err(|e| StoreError::io(&download_dir, e))?;
        }
        fs::create_dir_all(&download_dir).map_err(|e| StoreError::io(&download_dir, e))?;
        fs::create_dir_all(&cache_dir).map_err(|e| StoreError::io(&cache_dir, e))?;

        let mut existing = Vec::new();
        for entry in fs::read_dir(&cache_dir).map_err(|e| StoreError::io(&cache_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&cache_dir, e))?;
            let modified = entry.metadata().and_then(|md| md.modified()).ok();
            existing.push((modified, entry.file_name().to_string_lossy().into_owned()));
        }
        existing.sort();

        let store = Self {
            download_dir,
            cache_dir,
            capacity: capacity.max(1),
            index: Mutex::new(LruIndex::default()),
        };
        {
            let mut index = store.lock();
            for (_, name) in &existing {
                index.touch(name);
            }
        }
        debug!(dir = %store.cache_dir.display(), files = existing.len(), "Reloaded file store");
        store.evict("");
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, LruIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_name(name: &str) -> Result<(), StoreError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(StoreError::InvalidName { name: name.to_string() });
        }
        Ok(())
    }

    pub fn download_path(&self, name: &str) -> PathBuf {
        self.download_dir.join(name)
    }

    pub fn store_file_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    /// Create an empty file in the download area, failing if it exists.
    pub fn create_download_file(&self, name: &str) -> Result<File, StoreError> {
        Self::check_name(name)?;
        let path = self.download_path(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    StoreError::AlreadyExists { name: name.to_string() }
                }
                _ => StoreError::io(&path, e),
            })
    }

    /// Open an existing download file for writing, truncating it.
    pub fn download_file_writer(&self, name: &str) -> Result<File, StoreError> {
        Self::check_name(name)?;
        let path = self.download_path(name);
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| not_found_or_io(name, &path, e))
    }

    /// Move a finished download into the cache area.
    pub fn move_download_file_to_store(&self, name: &str) -> Result<(), StoreError> {
        Self::check_name(name)?;
        let src = self.download_path(name);
        if !src.exists() {
            return Err(StoreError::NotFound { name: name.to_string() });
        }
        self.link_store_file_from(name, &src)
    }

    /// Rename `src` into the cache area under `name`.
    ///
    /// Returns [`StoreError::AlreadyExists`] if the name is taken; `src` is
    /// left in place in that case.
    pub fn link_store_file_from(&self, name: &str, src: &Path) -> Result<(), StoreError> {
        Self::check_name(name)?;
        let dst = self.store_file_path(name);
        {
            let mut index = self.lock();
            if dst.exists() {
                index.touch(name);
                return Err(StoreError::AlreadyExists { name: name.to_string() });
            }
            fs::rename(src, &dst).map_err(|e| StoreError::io(src, e))?;
            index.touch(name);
        }
        self.evict(name);
        Ok(())
    }

    /// Hard-link a cached file to `target`.
    pub fn link_store_file_to(&self, name: &str, target: &Path) -> Result<(), StoreError> {
        let path = self.existing_store_path(name)?;
        fs::hard_link(&path, target).map_err(|e| StoreError::io(target, e))
    }

    pub fn store_file_reader(&self, name: &str) -> Result<File, StoreError> {
        let path = self.existing_store_path(name)?;
        File::open(&path).map_err(|e| not_found_or_io(name, &path, e))
    }

    pub fn store_file_stat(&self, name: &str) -> Result<Metadata, StoreError> {
        let path = self.existing_store_path(name)?;
        fs::metadata(&path).map_err(|e| not_found_or_io(name, &path, e))
    }

    /// Stat a file in either area, preferring the cache.
    pub fn download_or_store_stat(&self, name: &str) -> Result<Metadata, StoreError> {
        self.store_file_stat(name).or_else(|_| {
            let path = self.download_path(name);
            fs::metadata(&path).map_err(|e| not_found_or_io(name, &path, e))
        })
    }

    pub fn remove_store_file(&self, name: &str) -> Result<(), StoreError> {
        Self::check_name(name)?;
        let path = self.store_file_path(name);
        let mut index = self.lock();
        index.entries.remove(name);
        fs::remove_file(&path).map_err(|e| not_found_or_io(name, &path, e))
    }

    /// Names currently in the cache area.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    fn existing_store_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        Self::check_name(name)?;
        let path = self.store_file_path(name);
        let mut index = self.lock();
        if !path.exists() {
            index.entries.remove(name);
            return Err(StoreError::NotFound { name: name.to_string() });
        }
        index.touch(name);
        Ok(path)
    }

    /// Drop least recently used files until the store fits its capacity.
    fn evict(&self, keep: &str) {
        let mut index = self.lock();
        while index.entries.len() > self.capacity {
            let Some(victim) = index.oldest_except(keep) else {
                break;
            };
            index.entries.remove(&victim);
            let path = self.cache_dir.join(&victim);
            match fs::remove_file(&path) {
                Ok(()) => debug!(name = %victim, "Evicted cached file"),
                Err(e) => warn!(name = %victim, error = %e, "Failed to evict cached file"),
            }
        }
    }
}

fn not_found_or_io(name: &str, path: &Path, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound { name: name.to_string() }
    } else {
        StoreError::io(path, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn put(store: &FileStore, name: &str, content: &str) {
        let mut f = store.create_download_file(name).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        drop(f);
        store.move_download_file_to_store(name).unwrap();
    }

    #[test]
    fn test_download_then_move() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();

        put(&store, "blob", "hello");
        assert!(!store.download_path("blob").exists());

        let mut content = String::new();
        store.store_file_reader("blob").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(store.store_file_stat("blob").unwrap().len(), 5);
    }

    #[test]
    fn test_partial_download_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();

        store.create_download_file("partial").unwrap();
        assert!(matches!(
            store.store_file_reader("partial"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.download_or_store_stat("partial").is_ok());
    }

    #[test]
    fn test_link_existing_name_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();
        put(&store, "a", "one");

        let src = dir.path().join("other");
        fs::write(&src, "two").unwrap();
        assert!(matches!(
            store.link_store_file_from("a", &src),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(src.exists());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_read() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 2).unwrap();

        put(&store, "a", "1");
        put(&store, "b", "2");
        store.store_file_stat("a").unwrap();
        put(&store, "c", "3");

        assert_eq!(store.names(), vec!["a".to_string(), "c".to_string()]);
        assert!(!store.store_file_path("b").exists());
    }

    #[test]
    fn test_restart_clears_downloads_and_reloads_cache() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::new(dir.path(), 4).unwrap();
            put(&store, "kept", "x");
            store.create_download_file("stale").unwrap();
        }

        let store = FileStore::new(dir.path(), 4).unwrap();
        assert!(store.contains("kept"));
        assert!(!store.download_path("stale").exists());
    }

    #[test]
    fn test_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();
        assert!(matches!(
            store.create_download_file("../escape"),
            Err(StoreError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_remove_store_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();
        put(&store, "gone", "x");
        store.remove_store_file("gone").unwrap();
        assert!(!store.contains("gone"));
        assert!(matches!(store.store_file_stat("gone"), Err(StoreError::NotFound { .. })));
    }
}
