// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-disk cache entry storage: layout, insertion, manifest I/O, and LRU
//! eviction. Grounded on the upstream tool's `CompilerArtifactsSection` /
//! `ObjectCache` methods (`setEntry`, `hasEntry`, `clean`).

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};

use crate::stats::Statistics;

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(key)
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join("object")
    }

    pub fn stdout_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join("output.txt")
    }

    pub fn stderr_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join("error.txt")
    }

    pub fn manifest_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join("manifest.txt")
    }

    pub fn has_entry(&self, key: &str) -> bool {
        self.object_path(key).is_file()
    }

    /// Inserts a complete entry: the compiled object plus the captured
    /// stdout/stderr of the compile that produced it. Must be called while
    /// holding the cache lock.
    pub fn set_entry(&self, key: &str, object_path: &Path, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache entry directory {}", dir.display()))?;
        fs::copy(object_path, self.object_path(key)).with_context(|| {
            format!(
                "copying {} into cache entry {}",
                object_path.display(),
                key
            )
        })?;
        fs::write(self.stdout_path(key), stdout)?;
        fs::write(self.stderr_path(key), stderr)?;
        Ok(())
    }

    /// Writes the direct-mode manifest: one `<hash> <path>` record per line.
    pub fn write_manifest(&self, key: &str, pairs: &[(String, PathBuf)]) -> Result<()> {
        let mut contents = String::new();
        for (hash, path) in pairs {
            contents.push_str(hash);
            contents.push(' ');
            contents.push_str(&path.to_string_lossy());
            contents.push('\n');
        }
        fs::write(self.manifest_path(key), contents)?;
        Ok(())
    }

    /// Parses a manifest into `path -> hash`. Returns `None` if the
    /// manifest doesn't exist (not yet a hit candidate).
    pub fn get_manifest(&self, key: &str) -> Option<HashMap<String, String>> {
        let contents = fs::read_to_string(self.manifest_path(key)).ok()?;
        let mut map = HashMap::new();
        for line in contents.lines() {
            if let Some((hash, path)) = line.split_once(' ') {
                map.insert(path.to_string(), hash.to_string());
            }
        }
        Some(map)
    }

    pub fn object_size(&self, key: &str) -> Result<u64> {
        Ok(fs::metadata(self.object_path(key))?.len())
    }

    /// Evicts least-recently-used entries (by the object file's atime)
    /// until `CacheSize < 0.9 * max_bytes`. A no-op if already under quota.
    pub fn clean(&self, stats: &mut Statistics, max_bytes: u64) -> Result<()> {
        if stats.cache_size() < max_bytes {
            return Ok(());
        }

        let target = (max_bytes as f64 * 0.9) as u64;
        let mut entries = self.enumerate_entries()?;
        entries.sort_by_key(|entry| entry.accessed);

        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut removed_entries = 0u64;
        for entry in &entries {
            if total < target {
                break;
            }
            self.remove_entry_dir(&entry.dir)?;
            total = total.saturating_sub(entry.size);
            removed_entries += 1;
        }

        stats.set_cache_size(total);
        let remaining = stats.cache_entries().saturating_sub(removed_entries);
        // cache_entries is only ever bumped via register_cache_entry, so
        // fold the eviction-driven decrease back in the same way stats
        // tracks size: directly, since eviction is the one place entries
        // are removed rather than added.
        stats.set_cache_entries(remaining);

        Ok(())
    }

    /// Deletes an entry directory atomically from a peer's point of view:
    /// rename it aside first, then remove the renamed copy, so no other
    /// process ever observes a half-deleted entry. The staging directory is
    /// created inside the cache root rather than the OS temp dir so the
    /// rename stays on one filesystem; the cache root and `std::env::temp_dir()`
    /// are commonly separate mounts, which would turn the rename into an
    /// `EXDEV` error.
    fn remove_entry_dir(&self, dir: &Path) -> Result<()> {
        let staging = fileutil::SafeTempDirBuilder::new()
            .base_dir(&self.root)
            .prefix("clcache-evict-")
            .build()
            .context("creating eviction staging directory")?;
        let aside = staging.path().join("entry");
        fs::rename(dir, &aside)
            .with_context(|| format!("renaming {} aside for eviction", dir.display()))?;
        fileutil::remove_dir_all_with_chmod(&aside)
            .with_context(|| format!("removing evicted entry {}", aside.display()))?;
        Ok(())
    }

    fn enumerate_entries(&self) -> Result<Vec<EvictionCandidate>> {
        let mut candidates = Vec::new();
        if !self.root.is_dir() {
            return Ok(candidates);
        }
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let object = entry.path().join("object");
                let Ok(metadata) = fs::metadata(&object) else {
                    continue;
                };
                let accessed = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(EvictionCandidate {
                    dir: entry.path(),
                    size: metadata.len(),
                    accessed,
                });
            }
        }
        Ok(candidates)
    }
}

struct EvictionCandidate {
    dir: PathBuf,
    size: u64,
    accessed: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::tempdir;

    fn touch(path: &Path, seconds_ago: i64) {
        let time = FileTime::from_unix_time(
            FileTime::now().unix_seconds() - seconds_ago,
            0,
        );
        filetime::set_file_atime(path, time).unwrap();
    }

    #[test]
    fn entry_paths_are_sharded_by_first_two_hex_chars() {
        let store = ObjectStore::new(PathBuf::from("/cache"));
        let key = "abcdef0123456789";
        assert_eq!(
            store.object_path(key),
            PathBuf::from("/cache/ab/abcdef0123456789/object")
        );
    }

    #[test]
    fn set_entry_then_has_entry() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        let object = dir.path().join("in.obj");
        fs::write(&object, b"objectbytes").unwrap();

        assert!(!store.has_entry("key0000000000000000000000000000"));
        store
            .set_entry("key0000000000000000000000000000", &object, b"out", b"err")
            .unwrap();
        assert!(store.has_entry("key0000000000000000000000000000"));
        assert_eq!(
            fs::read(store.stdout_path("key0000000000000000000000000000")).unwrap(),
            b"out"
        );
    }

    #[test]
    fn manifest_round_trips() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        let key = "cafe0000000000000000000000000000";
        store
            .write_manifest(
                key,
                &[
                    ("hash1".to_string(), PathBuf::from("/a.h")),
                    ("hash2".to_string(), PathBuf::from("/b.h")),
                ],
            )
            .unwrap();
        let manifest = store.get_manifest(key).unwrap();
        assert_eq!(manifest.get("/a.h"), Some(&"hash1".to_string()));
        assert_eq!(manifest.get("/b.h"), Some(&"hash2".to_string()));
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        assert!(store.get_manifest("nope").is_none());
    }

    #[test]
    fn clean_evicts_oldest_entries_until_under_headroom() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        let mut stats = Statistics::load(dir.path());

        let keys = ["aa000000000000000000000000000000", "bb000000000000000000000000000000", "cc000000000000000000000000000000", "dd000000000000000000000000000000"];
        for (i, key) in keys.iter().enumerate() {
            let object = dir.path().join(format!("obj{i}"));
            fs::write(&object, vec![0u8; 400]).unwrap();
            store.set_entry(key, &object, b"", b"").unwrap();
            touch(&store.object_path(key), (keys.len() - i) as i64 * 10);
            stats.register_cache_entry(400);
        }

        store.clean(&mut stats, 1000).unwrap();

        assert!(stats.cache_size() < 1000);
        assert!(!store.has_entry(keys[0]));
    }
}
