// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    ffi::{OsStr, OsString},
    fs,
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::info_span;

lazy_static! {
    static ref DEFAULT_PREFIX: OsString = {
        let current_exe = std::env::current_exe().unwrap_or_default();
        let current_program_name = current_exe
            .file_name()
            .unwrap_or(OsStr::new("__unknown__"))
            .to_string_lossy();
        format!("clcache.{}.", current_program_name).into()
    };
}

/// Removes a directory tree, restoring write permissions on anything that
/// blocks removal along the way.
///
/// Plain [`std::fs::remove_dir_all`] fails outright if it finds a directory
/// that isn't writable by the current user, which is exactly the state the
/// cache leaves read-only entry directories in (see `ObjectStore::clean`).
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    if fs::remove_dir_all(dir).is_ok() {
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(dir).contents_first(false) {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let mut perms = metadata.permissions();
        let writable_mode = if metadata.is_dir() { 0o700 } else { 0o600 };
        if perms.mode() & 0o700 != writable_mode {
            perms.set_mode(perms.mode() | writable_mode);
            fs::set_permissions(entry.path(), perms)?;
        }
    }

    fs::remove_dir_all(dir)?;
    Ok(())
}

/// Safer version of [`tempfile::TempDir`].
///
/// Notable differences to [`tempfile::TempDir`] are:
/// - Directory names are prefixed with the current program name by default
///   so that it's easier to debug temporary directory issues.
/// - Uses [`remove_dir_all_with_chmod`] to remove files that could not be
///   removed simply by [`std::fs::remove_dir_all`].
pub struct SafeTempDir {
    dir: Option<PathBuf>,
}

impl SafeTempDir {
    /// Creates a new temporary directory using the default configuration.
    ///
    /// Use [`SafeTempDirBuilder`] instead if you want more configurations.
    pub fn new() -> Result<Self> {
        SafeTempDirBuilder::new().build()
    }

    /// Creates a [`SafeTempDir`] by taking ownership of an existing directory.
    pub fn take(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    /// Returns the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap()
    }

    /// Converts [`SafeTempDir`] into [`PathBuf`]. After calling this function,
    /// it is the caller's responsibility to remove the directory after use.
    pub fn into_path(mut self) -> PathBuf {
        self.dir.take().unwrap()
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _span = info_span!("SafeTempDir::drop", dir = ?dir).entered();
            remove_dir_all_with_chmod(dir).expect("Failed to remove temporary directory");
        }
    }
}

pub struct SafeTempDirBuilder<'prefix, 'suffix> {
    builder: tempfile::Builder<'prefix, 'suffix>,
    base_dir: PathBuf,
}

impl<'prefix, 'suffix> SafeTempDirBuilder<'prefix, 'suffix> {
    /// Creates a new builder for [`SafeTempDir`].
    pub fn new() -> Self {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&*DEFAULT_PREFIX);
        let base_dir = std::env::temp_dir();
        Self { builder, base_dir }
    }

    /// Sets the base directory where a new temporary directory is created.
    pub fn base_dir(self, dir: &Path) -> Self {
        Self {
            base_dir: dir.to_owned(),
            ..self
        }
    }

    /// Sets a custom file name prefix.
    pub fn prefix<S: AsRef<OsStr> + ?Sized>(mut self, prefix: &'prefix S) -> Self {
        self.builder.prefix(prefix);
        self
    }

    /// Sets a custom file name suffix.
    pub fn suffix<S: AsRef<OsStr> + ?Sized>(mut self, suffix: &'suffix S) -> Self {
        self.builder.suffix(suffix);
        self
    }

    /// Builds [`SafeTempDir`].
    pub fn build(self) -> Result<SafeTempDir> {
        let dir = self.builder.tempdir_in(self.base_dir)?;
        Ok(SafeTempDir::take(&dir.into_path()))
    }
}

impl Default for SafeTempDirBuilder<'_, '_> {
    fn default() -> Self {
        Self::new()
    }
}
