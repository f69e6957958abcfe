// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`CacheContext`] bundles the cache root, its lock, and lazily-loaded
//! configuration/statistics into the one value threaded through the
//! dispatcher, instead of reaching for process globals.
//!
//! Fields are `pub` rather than hidden behind accessor methods on purpose:
//! the dispatcher routinely needs to hold the lock while mutating `stats`
//! and reading `store` in the same scope, and only direct field access
//! lets the borrow checker see those as disjoint borrows. `main.rs` is a
//! separate crate from this library even though they share a package, so
//! `pub(crate)` would not reach it.

use std::path::PathBuf;

use anyhow::Result;
use fileutil::ReentrantLock;

use crate::{config::Configuration, stats::Statistics, store::ObjectStore};

pub struct CacheContext {
    pub root: PathBuf,
    pub lock: ReentrantLock,
    pub store: ObjectStore,
    pub config: Configuration,
    pub stats: Statistics,
}

impl CacheContext {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let lock = ReentrantLock::new(&root);
        let config = Configuration::load(&root);
        let stats = Statistics::load(&root);
        let store = ObjectStore::new(root.clone());
        Ok(Self {
            root,
            lock,
            store,
            config,
            stats,
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}
