// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CLI entry point. Management commands (`--help`, `-s`, `-z`, `-M
//! <bytes>`) are recognized up front and handled with `clap`; anything
//! else is treated as a wrapped compiler invocation and handed to
//! [`clcache::dispatcher::dispatch`] on its own hand-written parsing path,
//! so clap's `-`/`--` conventions never have to coexist with MSVC's.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cliutil::ConfigBuilder;

use clcache::{context::CacheContext, dispatcher};

#[derive(Parser, Debug)]
#[command(
    name = "clcache",
    version,
    about = "A transparent object-file cache for MSVC-compatible compiler invocations"
)]
struct ManagementArgs {
    /// Print cache statistics and exit.
    #[arg(short = 's', action = clap::ArgAction::SetTrue)]
    stats: bool,

    /// Reset the resettable statistics counters and exit.
    #[arg(short = 'z', action = clap::ArgAction::SetTrue)]
    zero_stats: bool,

    /// Set the maximum cache size, in bytes, and exit.
    #[arg(short = 'M')]
    max_size: Option<u64>,
}

/// Returns `Some` management-mode argv (including a synthetic program name)
/// if `args` matches one of the exact single-purpose forms this tool
/// recognizes, so they can be routed to `clap` instead of the compiler
/// passthrough path.
fn as_management_argv(args: &[String]) -> Option<Vec<String>> {
    match args {
        [one] if one == "--help" || one == "-h" || one == "--version" => {
            Some(vec!["clcache".to_string(), one.clone()])
        }
        [one] if one == "-s" || one == "-z" => Some(vec!["clcache".to_string(), one.clone()]),
        [flag, value] if flag == "-M" => {
            Some(vec!["clcache".to_string(), flag.clone(), value.clone()])
        }
        _ => None,
    }
}

fn run_management_command(args: ManagementArgs) -> Result<i32> {
    let cache_dir = dispatcher::default_cache_dir();
    let mut ctx = CacheContext::open(cache_dir)?;
    let _guard = ctx.lock.acquire()?;

    if args.stats {
        println!("{}", ctx.stats);
    } else if args.zero_stats {
        ctx.stats.reset_counters();
        ctx.stats.save()?;
    } else if let Some(size) = args.max_size {
        ctx.config.set_maximum_cache_size(size);
        ctx.config.save()?;
    }

    Ok(0)
}

fn run_passthrough(args: &[String]) -> Result<i32> {
    let compiler = dispatcher::resolve_compiler()?;
    let cache_dir = dispatcher::default_cache_dir();
    let mut ctx = CacheContext::open(cache_dir)?;
    dispatcher::dispatch(&mut ctx, &compiler, args)
}

fn do_main() -> Result<ExitCode> {
    let all_args: Vec<String> = std::env::args().skip(1).collect();

    let code = if let Some(management_argv) = as_management_argv(&all_args) {
        match ManagementArgs::try_parse_from(management_argv) {
            Ok(parsed) => run_management_command(parsed)?,
            Err(clap_error) => {
                clap_error.print().ok();
                clap_error.exit_code()
            }
        }
    } else {
        run_passthrough(&all_args)?
    };

    Ok(match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    })
}

fn main() -> ExitCode {
    let config = ConfigBuilder::new().build();
    cliutil::cli_main(do_main, config)
}
