// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cache-wide configuration, persisted as `<cache dir>/config.txt`.
//!
//! Grounded on the upstream tool's `Configuration` class, which is itself a
//! thin wrapper around its `PersistentJSONDict`. The two knobs it persists
//! (`MaximumCacheSize` and `CppCompileCommand`) become one and a hook for the
//! second, since command-line template substitution isn't implemented here.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::persistent_map::PersistentMap;

/// Default maximum cache size: 1 GiB, matching the upstream tool's default.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

const KEY_MAXIMUM_CACHE_SIZE: &str = "MaximumCacheSize";

pub struct Configuration {
    map: PersistentMap,
}

impl Configuration {
    pub fn load(cache_dir: &Path) -> Self {
        let mut map = PersistentMap::load(cache_dir.join("config.txt"));
        map.set_default(KEY_MAXIMUM_CACHE_SIZE, Value::from(DEFAULT_MAX_CACHE_SIZE));
        Self { map }
    }

    pub fn maximum_cache_size(&self) -> u64 {
        self.map
            .get(KEY_MAXIMUM_CACHE_SIZE)
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_CACHE_SIZE)
    }

    pub fn set_maximum_cache_size(&mut self, size: u64) {
        self.map.set(KEY_MAXIMUM_CACHE_SIZE, Value::from(size));
    }

    pub fn save(&mut self) -> Result<()> {
        self.map.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_to_one_gibibyte() {
        let dir = tempdir().unwrap();
        let config = Configuration::load(dir.path());
        assert_eq!(config.maximum_cache_size(), DEFAULT_MAX_CACHE_SIZE);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempdir().unwrap();
        let mut config = Configuration::load(dir.path());
        config.set_maximum_cache_size(42);
        config.save().unwrap();

        let reloaded = Configuration::load(dir.path());
        assert_eq!(reloaded.maximum_cache_size(), 42);
    }
}
