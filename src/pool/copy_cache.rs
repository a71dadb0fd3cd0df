//! File-copy cache. Generalizes the copy-aside-before-touching pattern
//! used before decrypting a locked source file into a standing cache
//! keyed by (tenant, source path), so repeat reads of a locked/in-use
//! source file don't re-copy it. `tempfile` backs the atomic
//! write-to-tmp/fsync/rename commit.

use crate::error::CoreResult;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

const N_MAX: usize = 10_000;
const T_ORPHAN: Duration = Duration::from_secs(10 * 60);
const T_CLEAN: Duration = Duration::from_secs(60);

/// `(tenant, basename, ext, path_hash)` — the compound key §4.5.1 names
/// for isolating one tenant's copies from another's and for rebuild-time
/// dedup. `tenant`/`basename`/`ext` are the sanitized forms actually
/// written into the cache filename.
type CacheKey = (String, String, String, u64);

struct CacheEntry {
    cached_path: PathBuf,
    /// Known only for entries created this run; entries rebuilt from a
    /// prior run's leftover files (the on-disk name doesn't carry the
    /// full source path) have `None` here and age out by file mtime
    /// instead of by source-existence check.
    source_path: Option<PathBuf>,
    source_mtime: SystemTime,
    last_access: Instant,
}

pub struct FileCopyCache {
    cache_dir: PathBuf,
    index: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Per-key locks so concurrent callers for the same (tenant, source)
    /// serialize on the copy: the first writes, the rest reuse its result
    /// instead of racing each other to `persist`.
    copy_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl FileCopyCache {
    /// Opens (creating if absent) a persistent cache directory under
    /// `base_dir` and rebuilds its index from whatever temp files
    /// survived a prior run.
    pub fn open(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let cache_dir = base_dir.as_ref().join("chatvault-copy-cache");
        std::fs::create_dir_all(&cache_dir)?;
        let cache = FileCopyCache {
            cache_dir,
            index: RwLock::new(HashMap::new()),
            copy_locks: Mutex::new(HashMap::new()),
        };
        cache.rebuild_index()?;
        Ok(cache)
    }

    /// Scans the cache dir, groups files by the `(tenant, basename, ext,
    /// path_hash)` key encoded in their names, and keeps only the
    /// newest-mtime file per group — the rest are stale copies left
    /// behind by a source that changed content across runs, and are
    /// queued for deletion.
    fn rebuild_index(&self) -> CoreResult<()> {
        let mut groups: HashMap<CacheKey, Vec<(PathBuf, SystemTime)>> = HashMap::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(parsed) = parse_cache_filename(&path) else { continue };
            let meta = entry.metadata()?;
            let mtime = meta.modified()?;
            groups.entry(parsed).or_default().push((path, mtime));
        }

        let mut index = self.index.write().unwrap();
        for (key, mut files) in groups {
            files.sort_by_key(|(_, mtime)| *mtime);
            let Some((latest_path, latest_mtime)) = files.pop() else { continue };
            for (stale_path, _) in files {
                if let Err(e) = std::fs::remove_file(&stale_path) {
                    log::debug!("failed to remove orphaned cache duplicate {}: {}", stale_path.display(), e);
                }
            }
            index.insert(
                key,
                CacheEntry {
                    cached_path: latest_path,
                    source_path: None,
                    source_mtime: latest_mtime,
                    last_access: Instant::now(),
                },
            );
        }
        Ok(())
    }

    /// Returns a path to a local copy of `source_path` for `tenant`,
    /// reusing a cached copy if the source's mtime hasn't changed since
    /// it was made. Concurrent callers for the same `(tenant,
    /// source_path)` serialize on a per-key lock: the first copies, the
    /// rest reuse its result rather than racing to `persist`.
    pub fn get_or_copy(&self, source_path: &Path, tenant: &str) -> CoreResult<PathBuf> {
        let key = cache_key(source_path, tenant);
        let source_meta = std::fs::metadata(source_path)?;
        let source_mtime = source_meta.modified()?;

        if let Some(path) = self.try_reuse(&key, source_path, source_mtime) {
            return Ok(path);
        }

        let path_lock = self.lock_for(&key);
        let _guard = path_lock.lock().unwrap();

        // Re-check under the per-key lock: another caller may have just
        // finished the copy while we were waiting for it.
        if let Some(path) = self.try_reuse(&key, source_path, source_mtime) {
            return Ok(path);
        }

        let cached_path = self.copy_in(source_path, &key)?;
        {
            let mut index = self.index.write().unwrap();
            index.insert(
                key,
                CacheEntry {
                    cached_path: cached_path.clone(),
                    source_path: Some(source_path.to_path_buf()),
                    source_mtime,
                    last_access: Instant::now(),
                },
            );
        }
        self.evict_if_over_capacity();
        Ok(cached_path)
    }

    fn try_reuse(&self, key: &CacheKey, source_path: &Path, source_mtime: SystemTime) -> Option<PathBuf> {
        let mut index = self.index.write().unwrap();
        if let Some(entry) = index.get_mut(key) {
            if entry.source_mtime == source_mtime && entry.cached_path.exists() {
                entry.last_access = Instant::now();
                entry.source_path = Some(source_path.to_path_buf());
                return Some(entry.cached_path.clone());
            }
        }
        None
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.copy_locks.lock().unwrap();
        Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn copy_in(&self, source_path: &Path, key: &CacheKey) -> CoreResult<PathBuf> {
        let (tenant, basename, ext, path_hash) = key;
        let content_hash = hash_file_contents(source_path)?;
        // path_hash leads the name as a fixed-width hex prefix so
        // `parse_cache_filename` can recover the grouping key unambiguously
        // regardless of what tenant/basename/ext sanitize to.
        let file_name = format!(
            "{:016x}.{}.{}.{}.{}",
            path_hash,
            hex::encode(content_hash.to_be_bytes()),
            tenant,
            basename,
            ext,
        );
        let final_path = self.cache_dir.join(file_name);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        {
            let mut source = File::open(source_path)?;
            io::copy(&mut source, tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&final_path).map_err(|e| crate::error::CoreError::WriteFailed(e.to_string()))?;
        Ok(final_path)
    }

    fn evict_if_over_capacity(&self) {
        let mut index = self.index.write().unwrap();
        if index.len() <= N_MAX {
            return;
        }
        let evict_count = index.len() / 4;
        let mut by_access: Vec<(CacheKey, Instant)> =
            index.iter().map(|(k, v)| (k.clone(), v.last_access)).collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in by_access.into_iter().take(evict_count) {
            if let Some(entry) = index.remove(&key) {
                let _ = std::fs::remove_file(&entry.cached_path);
            }
        }
    }

    /// One cleanup sweep: drops entries whose known source vanished, and
    /// orphan-candidate entries (no known source, loaded from a prior
    /// run) whose file is older than `T_ORPHAN`.
    pub fn cleanup_once(&self) {
        let mut index = self.index.write().unwrap();
        let mut stale = Vec::new();
        for (key, entry) in index.iter() {
            let vanished = match &entry.source_path {
                Some(src) => !src.exists(),
                None => std::fs::metadata(&entry.cached_path)
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime.elapsed().unwrap_or(Duration::ZERO) > T_ORPHAN)
                    .unwrap_or(true),
            };
            if vanished {
                stale.push(key.clone());
            }
        }
        for key in stale {
            if let Some(entry) = index.remove(&key) {
                let _ = std::fs::remove_file(&entry.cached_path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the background sweep thread (`T_clean` = 1 minute), using a
/// plain native thread rather than a tokio interval: the sync core has
/// no async runtime of its own.
pub fn spawn_cleanup_thread(cache: Arc<FileCopyCache>, cancel: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !cancel.load(Ordering::SeqCst) {
            std::thread::sleep(T_CLEAN);
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            cache.cleanup_once();
        }
    })
}

fn cache_key(source_path: &Path, tenant: &str) -> CacheKey {
    let basename = source_path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let ext = source_path.extension().map(|s| s.to_string_lossy()).unwrap_or_default();
    (sanitize(tenant), sanitize(&basename), sanitize(&ext), hash_path(source_path))
}

fn hash_path(path: &Path) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

fn hash_file_contents(path: &Path) -> CoreResult<u64> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    Ok(u64::from_be_bytes(digest[..8].try_into().unwrap()))
}

fn sanitize(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

/// Recovers the `(tenant, basename, ext, path_hash)` grouping key from a
/// cache filename of the form
/// `{path_hash:016x}.{content_hash}.{tenant}.{basename}.{ext}`. The
/// content hash itself isn't part of the key — it's exactly the part
/// that must vary across duplicates for the same source.
fn parse_cache_filename(path: &Path) -> Option<CacheKey> {
    let name = path.file_name()?.to_string_lossy();
    let mut parts = name.splitn(5, '.');
    let path_hash = u64::from_str_radix(parts.next()?, 16).ok()?;
    let _content_hash = parts.next()?;
    let tenant = parts.next()?.to_string();
    let basename = parts.next()?.to_string();
    let ext = parts.next()?.to_string();
    Some((tenant, basename, ext, path_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_call_reuses_cached_copy_when_mtime_unchanged() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("a.db");
        std::fs::write(&source, b"hello").unwrap();

        let cache = FileCopyCache::open(cache_dir.path()).unwrap();
        let first = cache.get_or_copy(&source, "tenant-a").unwrap();
        let second = cache.get_or_copy(&source, "tenant-a").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_mtime_forces_a_fresh_copy() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("a.db");
        std::fs::write(&source, b"hello").unwrap();

        let cache = FileCopyCache::open(cache_dir.path()).unwrap();
        let first = cache.get_or_copy(&source, "tenant-a").unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(&source, b"hello again, longer").unwrap();
        let second = cache.get_or_copy(&source, "tenant-a").unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"hello again, longer");
    }

    #[test]
    fn cleanup_removes_entries_whose_source_vanished() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("a.db");
        std::fs::write(&source, b"hello").unwrap();

        let cache = FileCopyCache::open(cache_dir.path()).unwrap();
        cache.get_or_copy(&source, "tenant-a").unwrap();
        std::fs::remove_file(&source).unwrap();

        cache.cleanup_once();
        assert!(cache.is_empty());
    }

    #[test]
    fn distinct_tenants_requesting_the_same_source_get_distinct_copies() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("a.db");
        std::fs::write(&source, b"hello").unwrap();

        let cache = FileCopyCache::open(cache_dir.path()).unwrap();
        let for_a = cache.get_or_copy(&source, "tenant-a").unwrap();
        let for_b = cache.get_or_copy(&source, "tenant-b").unwrap();

        assert_ne!(for_a, for_b);
        assert_eq!(cache.len(), 2);
        assert_eq!(std::fs::read(&for_a).unwrap(), std::fs::read(&for_b).unwrap());
    }

    #[test]
    fn concurrent_callers_for_the_same_key_all_see_one_copy() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("a.db");
        std::fs::write(&source, b"hello").unwrap();

        let cache = Arc::new(FileCopyCache::open(cache_dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let source = source.clone();
                std::thread::spawn(move || cache.get_or_copy(&source, "tenant-a").unwrap())
            })
            .collect();

        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = &paths[0];
        assert!(paths.iter().all(|p| p == first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rebuild_keeps_only_newest_duplicate_per_group_and_deletes_the_rest() {
        let cache_dir = tempfile::tempdir().unwrap();
        let inner = cache_dir.path().join("chatvault-copy-cache");
        std::fs::create_dir_all(&inner).unwrap();

        let stale = inner.join("0000000000000001.aaaaaaaaaaaaaaaa.tenanta.basenm.db");
        let fresh = inner.join("0000000000000001.bbbbbbbbbbbbbbbb.tenanta.basenm.db");
        std::fs::write(&stale, b"old content").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(&fresh, b"new content").unwrap();

        let cache = FileCopyCache::open(cache_dir.path()).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
