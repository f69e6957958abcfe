// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use nix::sys::signal::Signal;
use signal_hook::{
    consts::signal::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, ExitCode, ExitStatus},
};
use tracing::instrument;

// run runs a child process, with some special signal handling:
//   - Forwards SIGTERM to the child process.
//   - Ignores SIGINT while the process is running. SIGINT is normally generated
//     by the terminal when Ctrl+C is pressed and delivered to the whole foreground
//     process group, so the child receives it directly; forwarding it too would
//     double-deliver it on processes that install their own handler.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    // Register the signal handler before spawning the process to ensure we don't drop any signals.
    let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM])?;

    let mut child = cmd.spawn()?;

    for signal in signals.forever() {
        match signal {
            SIGCHLD => match &child.try_wait()? {
                Some(status) => return Ok(*status),
                None => continue,
            },
            SIGINT => {}
            SIGTERM => nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(child.id().try_into()?),
                Signal::SIGTERM,
            )?,
            _ => unreachable!(),
        }
    }
    unreachable!()
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {cmd:?} failed with {status}");
    }

    Ok(())
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell convention.
///
/// It panics if [`ExitStatus`] does not represent a status of an exiting process
/// (e.g. process being stopped or continued). This won't happen as long as you
/// get [`ExitStatus`] from [`std::process`] methods, such as
/// [`Command::status`], [`Command::output`],
/// [`Child::wait`](std::process::Child::wait).
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}
