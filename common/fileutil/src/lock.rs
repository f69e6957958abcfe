// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use anyhow::Result;
use nix::{
    dir::Dir,
    fcntl::{flock, FlockArg, OFlag},
    sys::stat::Mode,
};

/// Error returned by [`DirLock::acquire`].
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("timed out waiting {0:?} for the lock on {1}")]
    Timeout(Duration, PathBuf),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// A named, directory-scoped advisory lock.
///
/// The "name" of the lock is the directory itself: we open it and take an
/// exclusive `flock(2)` on the descriptor, which is exactly what a POSIX host
/// has in place of a Windows named mutex. `flock(2)` is released by the
/// kernel as soon as every descriptor referring to it is closed, including
/// when the holding process is killed, so a lock whose previous holder died
/// is simply available again — there is no separate "abandoned" state to
/// detect or clear.
///
/// Acquisition is bounded: a background thread performs the (possibly
/// blocking) `flock()` call and reports success over a channel, so the
/// calling thread can give up after [`DirLock::DEFAULT_TIMEOUT`] without
/// busy-polling. Giving up does not affect the background thread; if it
/// eventually acquires the lock it releases it immediately on its own drop.
pub struct DirLock {
    _fd: Dir,
}

impl DirLock {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Acquires an exclusive lock on `dir`, waiting up to `timeout`.
    pub fn acquire(dir: &Path, timeout: Duration) -> Result<DirLock, LockError> {
        let dir = dir.to_owned();
        let dir_for_thread = dir.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let result = (|| -> Result<Dir> {
                let fd = Dir::open(
                    &dir_for_thread,
                    OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )?;
                flock(fd.as_raw_fd(), FlockArg::LockExclusive)?;
                Ok(fd)
            })();
            // The receiver may already have given up; ignore the send failure.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(fd)) => Ok(DirLock { _fd: fd }),
            Ok(Err(err)) => Err(LockError::Io(err)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(LockError::Timeout(timeout, dir)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(LockError::Io(anyhow::anyhow!(
                    "lock-acquiring thread vanished without a result"
                )))
            }
        }
    }

    /// Acquires an exclusive lock on `dir` within the default 10 second bound.
    pub fn try_new(dir: &Path) -> Result<DirLock, LockError> {
        Self::acquire(dir, Self::DEFAULT_TIMEOUT)
    }
}

/// A lock that is reentrant within the process that holds it.
///
/// [`Dispatcher`](../../clcache/src/dispatcher.rs) acquires the cache lock
/// both in outer orchestration and in inner helper calls that themselves
/// acquire it; this type lets the same process nest acquisitions instead of
/// deadlocking on its own `flock()`.
pub struct ReentrantLock {
    dir: PathBuf,
    held: std::cell::RefCell<Option<Held>>,
}

struct Held {
    lock: DirLock,
    depth: u32,
}

pub struct ReentrantLockGuard<'a> {
    owner: &'a ReentrantLock,
}

impl ReentrantLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            held: std::cell::RefCell::new(None),
        }
    }

    /// Acquires the lock, or re-enters it if this process already holds it.
    pub fn acquire(&self) -> Result<ReentrantLockGuard<'_>, LockError> {
        let mut held = self.held.borrow_mut();
        match held.as_mut() {
            Some(held) => {
                held.depth += 1;
            }
            None => {
                let lock = DirLock::try_new(&self.dir)?;
                *held = Some(Held { lock, depth: 1 });
            }
        }
        Ok(ReentrantLockGuard { owner: self })
    }
}

impl Drop for ReentrantLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.owner.held.borrow_mut();
        let done = match held.as_mut() {
            Some(held) => {
                held.depth -= 1;
                held.depth == 0
            }
            None => false,
        };
        if done {
            *held = None;
        }
    }
}
