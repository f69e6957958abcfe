// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cache-wide statistics, persisted as `<cache dir>/stats.txt`.
//!
//! Grounded on the upstream tool's `CacheStatistics` class: same eight
//! counters, same reset behavior (size counters survive `-z`).

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::persistent_map::PersistentMap;

const COUNTERS: &[&str] = &[
    "CallsWithoutSourceFile",
    "CallsWithMultipleSourceFiles",
    "CallsWithPch",
    "CallsForLinking",
    "CacheEntries",
    "CacheSize",
    "CacheHits",
    "CacheMisses",
];

// Reset by `-z`. CacheEntries and CacheSize describe what's actually on disk
// and must not be clobbered by a counter reset.
const RESETTABLE_COUNTERS: &[&str] = &[
    "CallsWithoutSourceFile",
    "CallsWithMultipleSourceFiles",
    "CallsWithPch",
    "CallsForLinking",
    "CacheHits",
    "CacheMisses",
];

pub struct Statistics {
    map: PersistentMap,
}

impl Statistics {
    pub fn load(cache_dir: &Path) -> Self {
        let mut map = PersistentMap::load(cache_dir.join("stats.txt"));
        for counter in COUNTERS {
            map.set_default(counter, Value::from(0u64));
        }
        Self { map }
    }

    fn get(&self, key: &str) -> u64 {
        self.map.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    fn increment(&mut self, key: &str) {
        let next = self.get(key) + 1;
        self.map.set(key, Value::from(next));
    }

    pub fn calls_without_source_file(&self) -> u64 {
        self.get("CallsWithoutSourceFile")
    }
    pub fn register_call_without_source_file(&mut self) {
        self.increment("CallsWithoutSourceFile");
    }

    pub fn calls_with_multiple_source_files(&self) -> u64 {
        self.get("CallsWithMultipleSourceFiles")
    }
    pub fn register_call_with_multiple_source_files(&mut self) {
        self.increment("CallsWithMultipleSourceFiles");
    }

    pub fn calls_with_pch(&self) -> u64 {
        self.get("CallsWithPch")
    }
    pub fn register_call_with_pch(&mut self) {
        self.increment("CallsWithPch");
    }

    pub fn calls_for_linking(&self) -> u64 {
        self.get("CallsForLinking")
    }
    pub fn register_call_for_linking(&mut self) {
        self.increment("CallsForLinking");
    }

    pub fn cache_entries(&self) -> u64 {
        self.get("CacheEntries")
    }

    pub fn cache_size(&self) -> u64 {
        self.get("CacheSize")
    }

    pub fn set_cache_size(&mut self, size: u64) {
        self.map.set("CacheSize", Value::from(size));
    }

    /// Used by eviction to reflect entries removed from disk.
    pub fn set_cache_entries(&mut self, entries: u64) {
        self.map.set("CacheEntries", Value::from(entries));
    }

    /// Records a newly-inserted entry of `size_bytes`: bumps `CacheEntries`
    /// by one and `CacheSize` by `size_bytes`.
    pub fn register_cache_entry(&mut self, size_bytes: u64) {
        let entries = self.get("CacheEntries") + 1;
        self.map.set("CacheEntries", Value::from(entries));
        let size = self.get("CacheSize") + size_bytes;
        self.map.set("CacheSize", Value::from(size));
    }

    pub fn cache_hits(&self) -> u64 {
        self.get("CacheHits")
    }
    pub fn register_cache_hit(&mut self) {
        self.increment("CacheHits");
    }

    pub fn cache_misses(&self) -> u64 {
        self.get("CacheMisses")
    }
    pub fn register_cache_miss(&mut self) {
        self.increment("CacheMisses");
    }

    /// Resets every counter except `CacheEntries` and `CacheSize`, which
    /// describe the entries actually on disk.
    pub fn reset_counters(&mut self) {
        for counter in RESETTABLE_COUNTERS {
            self.map.set(counter, Value::from(0u64));
        }
    }

    pub fn save(&mut self) -> Result<()> {
        self.map.save()
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "CacheHits: {}", self.cache_hits())?;
        writeln!(f, "CacheMisses: {}", self.cache_misses())?;
        writeln!(f, "CacheEntries: {}", self.cache_entries())?;
        writeln!(f, "CacheSize: {}", self.cache_size())?;
        writeln!(
            f,
            "CallsWithoutSourceFile: {}",
            self.calls_without_source_file()
        )?;
        writeln!(
            f,
            "CallsWithMultipleSourceFiles: {}",
            self.calls_with_multiple_source_files()
        )?;
        writeln!(f, "CallsWithPch: {}", self.calls_with_pch())?;
        write!(f, "CallsForLinking: {}", self.calls_for_linking())
    }
}
