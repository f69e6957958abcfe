// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to all Rust-based CLI programs in this repo.

use itertools::Itertools;
use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use anyhow::Result;

mod config;
mod logging;

pub use crate::config::*;
pub use crate::logging::*;

/// Wraps a CLI main function to provide the common startup/cleanup logic.
///
/// Most programs likely want to call this function at the very beginning of
/// main.
pub fn cli_main<F, T, E>(main: F, config: Config) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    let _log_guard = config.logging.setup();
    if config.log_command_line {
        log_current_command_line();
    }
    handle_top_level_result(main())
}

/// Logs the command line of the current process.
///
/// You don't need this function if you use [`cli_main`] because it calls
/// this function for you.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::trace!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] and returns the [`ExitCode`] to be
/// returned from `main`.
///
/// You don't need this function if you use [`cli_main`].
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// Returns the current process name, or `__unknown__` if it failed to get one.
fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}
