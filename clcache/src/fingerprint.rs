// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fingerprint computation: the cache key derivation for both compile modes.
//!
//! Grounded on the upstream tool's `getFileHash`/`getStringHash` helpers and
//! its `CompilerArtifacts`/key computation in `processCompileRequest`.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use path_absolutize::Absolutize;
use regex::Regex;

/// Prefixes (after the leading `/` or `-`) of options that do not affect the
/// resulting object file and so are dropped before fingerprinting.
const NORMALIZED_AWAY_PREFIXES: &[&str] = &[
    "AI", "C", "E", "P", "FI", "u", "X", "FU", "D", "EP", "Fx", "U", "I", "Fo",
];

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Strips options whose effect is absorbed elsewhere (preprocessor-only
/// flags, and `/Fo` since the output path doesn't affect object content).
/// Matching is a prefix test on the option letters following `/` or `-`.
pub fn normalize_command_line(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|arg| {
            let Some(rest) = arg.strip_prefix('/').or_else(|| arg.strip_prefix('-')) else {
                return true;
            };
            !NORMALIZED_AWAY_PREFIXES
                .iter()
                .any(|prefix| rest.starts_with(prefix))
        })
        .cloned()
        .collect()
}

fn hash_compiler_identity(compiler: &Path) -> Result<String> {
    let metadata = fs::metadata(compiler)
        .with_context(|| format!("stat-ing compiler {}", compiler.display()))?;
    let mtime = metadata
        .modified()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(format!("{}-{}", mtime, metadata.len()))
}

/// Runs `compiler` with `args` appended to `extra_flags`, dropping any
/// `-c`/`/c` from `args` (used for the `/EP` and `/E` side invocations that
/// only need preprocessor output, not a compiled object).
fn run_for_preprocessing(compiler: &Path, args: &[String], extra_flag: &str) -> Result<std::process::Output> {
    let filtered: Vec<&String> = args
        .iter()
        .filter(|a| a.as_str() != "-c" && a.as_str() != "/c")
        .collect();
    Command::new(compiler)
        .arg(extra_flag)
        .args(filtered)
        .output()
        .with_context(|| format!("invoking {} for preprocessing", compiler.display()))
}

/// Computes the preprocessed-mode fingerprint: hashes the compiler identity,
/// the normalized command line, and the full preprocessor output.
///
/// Returns `Err` carrying the preprocessor's exit code in the error chain if
/// it failed; callers should surface its stderr and forfeit caching.
pub struct PreprocessOutcome {
    pub fingerprint: String,
    pub stderr: Vec<u8>,
}

pub enum PreprocessResult {
    Fingerprint(PreprocessOutcome),
    Failed { exit_code: i32, stderr: Vec<u8> },
}

pub fn preprocessed_fingerprint(
    compiler: &Path,
    args: &[String],
) -> Result<PreprocessResult> {
    let output = run_for_preprocessing(compiler, args, "/EP")?;
    if !output.status.success() {
        return Ok(PreprocessResult::Failed {
            exit_code: output.status.code().unwrap_or(1),
            stderr: output.stderr,
        });
    }

    let compiler_identity = hash_compiler_identity(compiler)?;
    let normalized = normalize_command_line(args).join(" ");
    let mut hasher = Md5::new();
    hasher.update(compiler_identity.as_bytes());
    hasher.update(normalized.as_bytes());
    hasher.update(&output.stdout);
    let fingerprint = hex::encode(hasher.finalize());

    Ok(PreprocessResult::Fingerprint(PreprocessOutcome {
        fingerprint,
        stderr: output.stderr,
    }))
}

/// Computes the direct-mode fingerprint: `<env-hex>-<src-hex>`.
pub fn direct_fingerprint(compiler: &Path, args: &[String], source_file: &Path) -> Result<String> {
    let compiler_identity = hash_compiler_identity(compiler)?;
    let normalized = normalize_command_line(args).join(" ");
    let mut env_hasher = Md5::new();
    env_hasher.update(compiler_identity.as_bytes());
    env_hasher.update(normalized.as_bytes());
    let env_hash = hex::encode(env_hasher.finalize());

    let src_hash = hash_file(source_file)?;
    Ok(format!("{}-{}", env_hash, src_hash))
}

/// Verifies a direct-mode manifest against the files currently on disk.
/// `manifest` maps absolute path to the hash recorded when it was written.
pub fn check_manifest(manifest: &std::collections::HashMap<String, String>) -> bool {
    manifest.iter().all(|(path, expected_hash)| {
        Path::new(path).exists()
            && hash_file(Path::new(path))
                .map(|actual| actual == *expected_hash)
                .unwrap_or(false)
    })
}

/// Discovers the set of files the compiler actually read for this
/// invocation via `/E` + `#line` directive scanning, and hashes each.
/// Returns `(hash, absolute_path)` pairs suitable for `ObjectStore::write_manifest`.
pub fn direct_include_files(compiler: &Path, args: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let line_directive = Regex::new(r#"^#line\s+\d+\s+"([^"]+)""#).unwrap();

    let output = run_for_preprocessing(compiler, args, "/E")?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for line in stdout.lines() {
        let Some(captures) = line_directive.captures(line) else {
            continue;
        };
        let raw_path = PathBuf::from(&captures[1]);
        let path = raw_path
            .absolutize()
            .map(|p| p.into_owned())
            .unwrap_or(raw_path);
        if !seen.insert(path.clone()) {
            continue;
        }
        let hash = hash_file(&path)
            .with_context(|| format!("hashing discovered include {}", path.display()))?;
        result.push((hash, path));
    }
    Ok(result)
}
