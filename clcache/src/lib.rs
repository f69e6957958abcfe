// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core library for the compiler cache wrapper: command-line analysis,
//! fingerprinting, on-disk storage, and dispatch. `main.rs` is a thin CLI
//! shell around [`dispatcher::dispatch`] and the management commands.

pub mod analyzer;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod fingerprint;
pub mod jobrunner;
pub mod persistent_map;
pub mod stats;
pub mod store;

pub use context::CacheContext;
