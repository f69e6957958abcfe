// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Top-level orchestration: turns one wrapper invocation into a
//! pass-through, a fan-out, a cache hit, or a cache miss.
//!
//! Grounded on the upstream tool's module-level script body (the `if
//! analysisResult != AnalysisResult.Ok: ...` / hit / miss sequence at the
//! bottom of `clcache.py`), restructured into a single `dispatch` entry
//! point that this codebase's `main.rs` can call the way `action_wrapper`
//! calls `do_main`.

use std::{
    env, fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::{
    analyzer::{self, Classification},
    context::CacheContext,
    fingerprint::{self, PreprocessResult},
};

pub const DISABLE_ENV: &str = "CLCACHE_DISABLE";
pub const DIRECT_ENV: &str = "CLCACHE_DIRECT";
pub const HARDLINK_ENV: &str = "CLCACHE_HARDLINK";
pub const CACHE_DIR_ENV: &str = "CLCACHE_DIR";
pub const COMPILER_ENV: &str = "CLCACHE_CL";
/// Test-only additive override: points the `PATH` fallback search at a
/// fake compiler executable named anything other than `cl.exe`.
pub const COMPILER_NAME_ENV: &str = "CLCACHE_CL_NAME";

pub fn default_cache_dir() -> PathBuf {
    match env::var_os(CACHE_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs_home().join("clcache"),
    }
}

fn dirs_home() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolves the real compiler binary: `CLCACHE_CL` if set, else a `PATH`
/// search for `cl.exe` (or `CLCACHE_CL_NAME`, for tests on non-Windows hosts).
pub fn resolve_compiler() -> Result<PathBuf> {
    if let Some(path) = env::var_os(COMPILER_ENV) {
        return Ok(PathBuf::from(path));
    }

    let name = env::var(COMPILER_NAME_ENV).unwrap_or_else(|_| "cl.exe".to_string());
    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    anyhow::bail!("could not find {name} in PATH; set {COMPILER_ENV} explicitly")
}

/// Runs the real compiler with the original argv and returns its exit code.
/// Used for every pass-through path (disabled, uncacheable, fan-out child).
pub fn run_real_compiler(compiler: &Path, args: &[String]) -> Result<i32> {
    let mut command = Command::new(compiler);
    command.args(args);
    let status = processes::run(&mut command)
        .with_context(|| format!("invoking real compiler {}", compiler.display()))?;
    Ok(status.code().unwrap_or(1))
}

/// Entry point: dispatches one wrapper invocation (`args` excludes argv[0])
/// and returns the process exit code.
pub fn dispatch(ctx: &mut CacheContext, compiler: &Path, args: &[String]) -> Result<i32> {
    tracing::trace!(compiler = %compiler.display(), args = %args.iter().join(" "), "dispatching");

    if env::var_os(DISABLE_ENV).is_some() {
        return run_real_compiler(compiler, args);
    }

    let expanded = analyzer::expand_command_line(args)?;
    let parsed = analyzer::parse_args(&expanded);
    let cwd = env::current_dir()?;
    let classification = analyzer::classify(&parsed, &cwd);

    match classification {
        Classification::MultipleSourceFilesSimple(sources) => dispatch_fan_out(compiler, args, &sources),
        Classification::Ok {
            source_file,
            output_file,
        } => dispatch_single(ctx, compiler, &expanded, &source_file, &output_file),
        other => dispatch_uncacheable(ctx, compiler, args, other),
    }
}

fn dispatch_fan_out(compiler: &Path, args: &[String], sources: &[String]) -> Result<i32> {
    let self_exe = env::current_exe().context("resolving current executable for fan-out")?;
    let parallelism = analyzer::effective_parallelism(args);

    let commands = sources
        .iter()
        .map(|source| {
            let mut command = Command::new(&self_exe);
            command.args(analyzer::source_argv(args, source));
            command.env(COMPILER_ENV, compiler);
            command
        })
        .collect();

    crate::jobrunner::run_jobs(commands, parallelism)
}

fn dispatch_uncacheable(
    ctx: &mut CacheContext,
    compiler: &Path,
    args: &[String],
    classification: Classification,
) -> Result<i32> {
    {
        let _guard = ctx.lock.acquire()?;
        match classification {
            Classification::NoSourceFile => {
                tracing::trace!("cannot cache invocation: no source file found");
                ctx.stats.register_call_without_source_file();
            }
            Classification::MultipleSourceFilesComplex => {
                tracing::trace!("cannot cache invocation: multiple source files found");
                ctx.stats.register_call_with_multiple_source_files();
            }
            Classification::CalledWithPch => {
                tracing::trace!("cannot cache invocation: precompiled headers in use");
                ctx.stats.register_call_with_pch();
            }
            Classification::CalledForLink => {
                tracing::trace!("cannot cache invocation: called for linking");
                ctx.stats.register_call_for_linking();
            }
            Classification::ExternalDebugInfo => {
                tracing::trace!(
                    "cannot cache invocation: external debug information (/Zi) is not supported"
                );
            }
            Classification::Ok { .. } | Classification::MultipleSourceFilesSimple(_) => {
                unreachable!("handled by dispatch() before reaching dispatch_uncacheable")
            }
        }
        ctx.stats.save()?;
    }
    run_real_compiler(compiler, args)
}

fn dispatch_single(
    ctx: &mut CacheContext,
    compiler: &Path,
    expanded_args: &[String],
    source_file: &str,
    output_file: &Path,
) -> Result<i32> {
    let direct_mode = env::var_os(DIRECT_ENV).is_some();

    if direct_mode {
        dispatch_direct(ctx, compiler, expanded_args, source_file, output_file)
    } else {
        dispatch_preprocessed(ctx, compiler, expanded_args, output_file)
    }
}

fn dispatch_preprocessed(
    ctx: &mut CacheContext,
    compiler: &Path,
    expanded_args: &[String],
    output_file: &Path,
) -> Result<i32> {
    let outcome = match fingerprint::preprocessed_fingerprint(compiler, expanded_args)? {
        PreprocessResult::Fingerprint(outcome) => outcome,
        PreprocessResult::Failed { exit_code, stderr } => {
            use std::io::Write;
            std::io::stderr().write_all(&stderr).ok();
            return Ok(exit_code);
        }
    };
    let key = outcome.fingerprint;

    let is_hit = {
        let _guard = ctx.lock.acquire()?;
        ctx.store.has_entry(&key)
    };

    if is_hit {
        return serve_hit(ctx, &key, output_file);
    }

    run_miss(ctx, compiler, expanded_args, &key, output_file, false)
}

fn dispatch_direct(
    ctx: &mut CacheContext,
    compiler: &Path,
    expanded_args: &[String],
    source_file: &str,
    output_file: &Path,
) -> Result<i32> {
    let key = fingerprint::direct_fingerprint(compiler, expanded_args, Path::new(source_file))?;

    let is_hit = {
        let _guard = ctx.lock.acquire()?;
        match ctx.store.get_manifest(&key) {
            Some(manifest) => fingerprint::check_manifest(&manifest),
            None => false,
        }
    };

    if is_hit {
        return serve_hit(ctx, &key, output_file);
    }

    run_miss(ctx, compiler, expanded_args, &key, output_file, true)
}

fn serve_hit(ctx: &mut CacheContext, key: &str, output_file: &Path) -> Result<i32> {
    let _guard = ctx.lock.acquire()?;
    ctx.stats.register_cache_hit();
    ctx.stats.save()?;
    drop(_guard);

    if output_file.exists() {
        fs::remove_file(output_file).ok();
    }
    materialize_object(ctx.store.object_path(key).as_path(), output_file)?;

    use std::io::Write;
    std::io::stderr()
        .write_all(&fs::read(ctx.store.stderr_path(key)).unwrap_or_default())
        .ok();
    std::io::stdout()
        .write_all(&fs::read(ctx.store.stdout_path(key)).unwrap_or_default())
        .ok();

    Ok(0)
}

fn materialize_object(cached: &Path, output_file: &Path) -> Result<()> {
    if env::var_os(HARDLINK_ENV).is_some() {
        if fs::hard_link(cached, output_file).is_ok() {
            touch_now(output_file)?;
            return Ok(());
        }
    }
    fs::copy(cached, output_file)
        .with_context(|| format!("copying cached object to {}", output_file.display()))?;
    Ok(())
}

fn touch_now(path: &Path) -> Result<()> {
    let now = filetime::FileTime::now();
    filetime::set_file_mtime(path, now)?;
    Ok(())
}

fn run_miss(
    ctx: &mut CacheContext,
    compiler: &Path,
    expanded_args: &[String],
    key: &str,
    output_file: &Path,
    direct_mode: bool,
) -> Result<i32> {
    let output = Command::new(compiler)
        .args(expanded_args)
        .output()
        .with_context(|| format!("invoking real compiler {}", compiler.display()))?;

    let _guard = ctx.lock.acquire()?;
    ctx.stats.register_cache_miss();

    if output.status.success() && output_file.exists() {
        if direct_mode {
            let includes = fingerprint::direct_include_files(compiler, expanded_args)?;
            ctx.store.write_manifest(key, &includes)?;
        }

        if ctx
            .store
            .set_entry(key, output_file, &output.stdout, &output.stderr)
            .is_ok()
        {
            let size = fs::metadata(output_file).map(|m| m.size()).unwrap_or(0);
            ctx.stats.register_cache_entry(size);

            let max_bytes = ctx.config.maximum_cache_size();
            let store = ctx.store.clone();
            store.clean(&mut ctx.stats, max_bytes)?;
        }
    }

    ctx.stats.save()?;
    drop(_guard);

    use std::io::Write;
    std::io::stdout().write_all(&output.stdout).ok();
    std::io::stderr().write_all(&output.stderr).ok();

    Ok(output.status.code().unwrap_or(1))
}
