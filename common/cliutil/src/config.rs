// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::LoggingConfig;

/// The configuration for the current process.
/// This should rarely be used directly; most users just want `Config::default()`.
pub struct ConfigBuilder {
    logging: Option<LoggingConfig>,
    log_command_line: bool,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            logging: None,
            log_command_line: true,
        }
    }

    /// Overrides the logging config. If this isn't called, it defaults to
    /// `LoggingConfig::from_env()`.
    pub fn logging(mut self, cfg: LoggingConfig) -> Self {
        self.logging = Some(cfg);
        self
    }

    /// `enable` controls whether to log the command line of the current process.
    pub fn log_command_line(mut self, enable: bool) -> Self {
        self.log_command_line = enable;
        self
    }

    pub fn build(self) -> Config {
        Config {
            logging: self.logging.unwrap_or_else(LoggingConfig::from_env),
            log_command_line: self.log_command_line,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A POD struct containing the configs, after applying any defaults for unset values.
/// Build it with `cliutil::ConfigBuilder::new().log_command_line(false).build()`.
pub struct Config {
    pub(crate) logging: LoggingConfig,
    pub(crate) log_command_line: bool,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config() {
        let config = ConfigBuilder::new().log_command_line(false).build();
        assert!(!config.log_command_line);
    }
}
