// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded-parallelism fan-out for `MultipleSourceFilesSimple` invocations.
//!
//! Grounded on `processes::run` for individual child handling and on the
//! design notes' explicit rejection of the upstream tool's busy-polling
//! `Popen` loop: one waiter thread per child reports completion over a
//! channel, so the main thread simply blocks on `recv()`.

use std::{process::Command, sync::mpsc};

use anyhow::Result;

/// Runs `commands` with at most `parallelism` running concurrently.
/// Stops launching new children after the first nonzero exit but lets
/// already-running children finish. Returns the first nonzero exit code
/// seen, or 0 if every child succeeded.
pub fn run_jobs(commands: Vec<Command>, parallelism: usize) -> Result<i32> {
    let parallelism = parallelism.max(1);
    let mut pending: Vec<Command> = commands;
    pending.reverse();

    let (tx, rx) = mpsc::channel::<Result<i32>>();
    let mut in_flight = 0usize;
    let mut first_failure: Option<i32> = None;

    let launch = |command: Option<Command>, tx: mpsc::Sender<Result<i32>>| -> bool {
        let Some(mut command) = command else {
            return false;
        };
        std::thread::spawn(move || {
            let result = processes::run(&mut command).map(|status| status.code().unwrap_or(1));
            let _ = tx.send(result);
        });
        true
    };

    for _ in 0..parallelism {
        if launch(pending.pop(), tx.clone()) {
            in_flight += 1;
        } else {
            break;
        }
    }

    while in_flight > 0 {
        let result = rx
            .recv()
            .map_err(|_| anyhow::anyhow!("job runner channel closed with jobs still in flight"))?;
        in_flight -= 1;

        match result {
            Ok(code) if code != 0 => {
                first_failure.get_or_insert(code);
            }
            Ok(_) => {}
            Err(err) => {
                first_failure.get_or_insert(1);
                tracing::warn!(error = %err, "job runner: child process failed to launch");
            }
        }

        if first_failure.is_none() {
            if launch(pending.pop(), tx.clone()) {
                in_flight += 1;
            }
        }
    }

    Ok(first_failure.unwrap_or(0))
}
