// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use itertools::Itertools;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

/// Presence (any value, including empty) enables trace statements on stdout.
pub const LOG_ENV: &str = "CLCACHE_LOG";

/// A guard object to perform cleanups with RAII.
pub struct LogGuard {
    _span_guard: Option<tracing::span::EnteredSpan>,
}

/// The configuration for the logger.
///
/// Gated entirely on [`LOG_ENV`]: when unset, no subscriber is installed and
/// every `tracing` call in the process is a no-op, matching the upstream
/// tool's `printTraceStatement` being a no-op unless `CLCACHE_LOG` is set.
pub struct LoggingConfig {
    enabled: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var_os(LOG_ENV).is_some(),
        }
    }

    /// Sets up the tracing subscriber in accordance with the config, and
    /// starts a span named "main".
    pub fn setup(self) -> LogGuard {
        if !self.enabled {
            return LogGuard { _span_guard: None };
        }

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::TRACE.into())
            .from_env()
            .unwrap_or_else(|_| EnvFilter::new("trace"));

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(std::io::stdout)
            .with_filter(filter);

        // A previous test in the same process may have already installed a
        // subscriber; `tracing` only allows one, so ignore that failure mode.
        let _ = tracing_subscriber::registry().with(layer).try_init();

        let args = std::env::args()
            .map(|s| shell_escape::escape(s.into()))
            .join(" ");
        let span_guard = tracing::trace_span!("main", args = args).entered();

        LogGuard {
            _span_guard: Some(span_guard),
        }
    }
}
