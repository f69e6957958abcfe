// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small key/value document persisted as a single JSON file.
//!
//! This is the Rust stand-in for the upstream tool's `PersistentJSONDict`,
//! which leaned on Python's dynamic attribute access to behave like a
//! mapping. Here it's a single concrete type; [`crate::config::Configuration`]
//! and [`crate::stats::Statistics`] are typed facades built on top of it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

pub struct PersistentMap {
    path: PathBuf,
    map: Map<String, Value>,
    dirty: bool,
}

impl PersistentMap {
    /// Loads the document at `path`, or starts with an empty map if it is
    /// missing or cannot be parsed as a JSON object.
    pub fn load(path: PathBuf) -> Self {
        let map = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();
        Self {
            path,
            map,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Sets `key` to `value` unconditionally, marking the map dirty.
    pub fn set(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_owned(), value);
        self.dirty = true;
    }

    /// Sets `key` to `value` only if it isn't already present, without
    /// marking the map dirty if the key already existed. Used to materialize
    /// defaults on load without forcing an immediate `save()`.
    pub fn set_default(&mut self, key: &str, value: Value) {
        if !self.map.contains_key(key) {
            self.map.insert(key.to_owned(), value);
            self.dirty = true;
        }
    }

    /// Serializes the document to disk if (and only if) it is dirty.
    ///
    /// Writes atomically: a temp file in the same directory is written and
    /// fsynced, then renamed over the destination, so a reader never
    /// observes a partially-written document.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .context("persistent map path has no parent directory")?;
        fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file next to {}", self.path.display()))?;
        serde_json::to_writer(&mut temp, &Value::Object(self.map.clone()))?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .with_context(|| format!("renaming temp file onto {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let map = PersistentMap::load(dir.path().join("nope.txt"));
        assert!(!map.contains("anything"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.txt");
        fs::write(&path, b"not json{{{").unwrap();
        let map = PersistentMap::load(path);
        assert!(!map.contains("anything"));
    }

    #[test]
    fn save_is_noop_unless_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.txt");
        let mut map = PersistentMap::load(path.clone());
        map.save().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.txt");

        let mut map = PersistentMap::load(path.clone());
        map.set("MaximumCacheSize", Value::from(12345));
        map.save().unwrap();

        let reloaded = PersistentMap::load(path);
        assert_eq!(reloaded.get("MaximumCacheSize"), Some(&Value::from(12345)));
    }

    #[test]
    fn set_default_does_not_override_existing() {
        let dir = tempdir().unwrap();
        let mut map = PersistentMap::load(dir.path().join("config.txt"));
        map.set("x", Value::from(1));
        map.set_default("x", Value::from(2));
        assert_eq!(map.get("x"), Some(&Value::from(1)));
    }

    #[test]
    fn unknown_keys_survive_a_save_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.txt");

        let mut map = PersistentMap::load(path.clone());
        map.set("SomeFutureOption", Value::from("keep-me"));
        map.set("MaximumCacheSize", Value::from(10));
        map.save().unwrap();

        let mut reloaded = PersistentMap::load(path.clone());
        reloaded.set("MaximumCacheSize", Value::from(20));
        reloaded.save().unwrap();

        let final_map = PersistentMap::load(path);
        assert_eq!(
            final_map.get("SomeFutureOption"),
            Some(&Value::from("keep-me"))
        );
        assert_eq!(final_map.get("MaximumCacheSize"), Some(&Value::from(20)));
    }
}
