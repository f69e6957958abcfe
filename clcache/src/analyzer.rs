// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Response-file expansion, MSVC command-line parsing, and the
//! cacheability classification used to decide whether to dispatch to the
//! cache or fall straight through to the real compiler.
//!
//! Grounded on the upstream tool's `expandCommandLine`/`splitCommandsFile`/
//! `analyzeCommandLine` functions.

use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Options that consume a parameter, either glued to the same token or as
/// the following token. Letters only, matched after the leading `/` or `-`.
const PARAMETRIZED_OPTIONS: &[&str] = &[
    "Ob", "Gs", "Fa", "Fd", "Fm", "Fp", "FR", "doc", "FA", "Fe", "Fo", "Fr", "AI", "FI", "FU", "D",
    "U", "I", "Zp", "vm", "MP", "Tc", "V", "wd", "wo", "W", "Yc", "Yl", "Tp", "we", "Yu", "Zm", "F",
];

#[derive(Debug, Default, Clone)]
pub struct ParsedArgs {
    /// Option name (without leading `/`/`-`) to the list of parameter
    /// values it was given (empty for options taking no parameter).
    pub options: HashMap<String, Vec<String>>,
    pub source_files: Vec<String>,
}

impl ParsedArgs {
    pub fn has_option(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    pub fn option_values(&self, name: &str) -> &[String] {
        self.options
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Reads a response file's raw bytes, stripping and interpreting a BOM if
/// present, and returns the decoded text.
fn decode_response_file(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        decode_utf32(&bytes[4..], false)
    } else if bytes.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        decode_utf32(&bytes[4..], true)
    } else if bytes.starts_with(&[0xFE, 0xFF]) {
        decode_utf16(&bytes[2..], false)
    } else if bytes.starts_with(&[0xFF, 0xFE]) {
        decode_utf16(&bytes[2..], true)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| {
            if little_endian {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], chunk[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

fn decode_utf32(bytes: &[u8], little_endian: bool) -> String {
    bytes
        .chunks_exact(4)
        .filter_map(|chunk| {
            let code = if little_endian {
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            } else {
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            };
            char::from_u32(code)
        })
        .collect()
}

/// Windows-style shell tokenization: whitespace-separated, double quotes
/// group a token (and are retained in the output, matching the upstream
/// tool's behavior of leaving quoting to the downstream option parser),
/// backslashes are literal (no escaping).
fn tokenize_windows_style(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in text.chars() {
        match c {
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Recursively expands `@file` response-file arguments into their contents.
pub fn expand_command_line(args: &[String]) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for arg in args {
        if let Some(file_name) = arg.strip_prefix('@') {
            let bytes = std::fs::read(file_name)
                .with_context(|| format!("reading response file {file_name}"))?;
            let text = decode_response_file(&bytes);
            let tokens = tokenize_windows_style(&text);
            expanded.extend(expand_command_line(&tokens)?);
        } else {
            expanded.push(arg.clone());
        }
    }
    Ok(expanded)
}

fn option_takes_parameter(name: &str) -> bool {
    PARAMETRIZED_OPTIONS
        .iter()
        .any(|candidate| name.starts_with(candidate))
}

/// Parses an already-expanded argument list into options and source files.
pub fn parse_args(args: &[String]) -> ParsedArgs {
    let mut parsed = ParsedArgs::default();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if let Some(rest) = arg.strip_prefix('/').or_else(|| arg.strip_prefix('-')) {
            if option_takes_parameter(rest) {
                // Find the longest matching prefix to split name from glued value.
                let prefix_len = PARAMETRIZED_OPTIONS
                    .iter()
                    .filter(|candidate| rest.starts_with(**candidate))
                    .map(|candidate| candidate.len())
                    .max()
                    .unwrap_or(0);
                let (name, glued) = rest.split_at(prefix_len);
                let value = if !glued.is_empty() {
                    glued.to_string()
                } else if let Some(next) = iter.peek() {
                    let v = (*next).clone();
                    iter.next();
                    v
                } else {
                    String::new()
                };
                parsed
                    .options
                    .entry(name.to_string())
                    .or_default()
                    .push(value);
            } else {
                parsed.options.entry(rest.to_string()).or_default();
            }
        } else if let Some(_response_file) = arg.strip_prefix('@') {
            // Already expanded; nothing further to record.
        } else {
            parsed.source_files.push(arg.clone());
        }
    }
    parsed
}

#[derive(Debug, Clone)]
pub enum Classification {
    Ok {
        source_file: String,
        output_file: PathBuf,
    },
    NoSourceFile,
    MultipleSourceFilesSimple(Vec<String>),
    MultipleSourceFilesComplex,
    CalledForLink,
    CalledWithPch,
    ExternalDebugInfo,
}

/// Classifies an already-parsed invocation per the rules enumerated in the
/// cacheability design: `/Zi` and `/Yu` short-circuit first, then `/Tp`/`/Tc`
/// extend the source list and mark it "complex", then linking and source
/// count are resolved.
pub fn classify(parsed: &ParsedArgs, cwd: &Path) -> Classification {
    if parsed.has_option("Zi") {
        return Classification::ExternalDebugInfo;
    }
    if parsed.has_option("Yu") {
        return Classification::CalledWithPch;
    }

    let mut sources = parsed.source_files.clone();
    let mut complex = false;
    for opt in ["Tp", "Tc"] {
        let values = parsed.option_values(opt);
        if !values.is_empty() {
            sources.extend(values.iter().cloned());
            complex = true;
        }
    }

    if parsed.has_option("link") || !parsed.has_option("c") {
        return Classification::CalledForLink;
    }

    match sources.len() {
        0 => Classification::NoSourceFile,
        1 => {
            let source_file = sources.into_iter().next().unwrap();
            let output_file = derive_output_file(parsed, &source_file, cwd);
            Classification::Ok {
                source_file,
                output_file,
            }
        }
        _ if complex => Classification::MultipleSourceFilesComplex,
        _ => Classification::MultipleSourceFilesSimple(sources),
    }
}

fn derive_output_file(parsed: &ParsedArgs, source_file: &str, cwd: &Path) -> PathBuf {
    let base = Path::new(source_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let fo_values = parsed.option_values("Fo");
    let Some(raw) = fo_values.last() else {
        return cwd.join(format!("{base}.obj"));
    };

    let trimmed = raw.trim_matches('"');
    let candidate = PathBuf::from(trimmed);
    if trimmed.is_empty() {
        return cwd.join(format!("{base}.obj"));
    }
    if candidate.is_dir() || trimmed.ends_with(['/', '\\']) {
        candidate.join(format!("{base}.obj"))
    } else {
        candidate
    }
}

/// Reads the `/MPn` (last wins, across the `CL` environment variable and
/// the command line together) parallelism hint. Bare `/MP` means "all
/// logical CPUs"; absent means 1.
pub fn effective_parallelism(args: &[String]) -> usize {
    let cl_env = env::var("CL").unwrap_or_default();
    let env_tokens = cl_env.split_whitespace().map(str::to_string);
    let all_tokens: Vec<String> = env_tokens.chain(args.iter().cloned()).collect();

    let mut saw_mp = false;
    let mut count: Option<usize> = None;
    for token in &all_tokens {
        let Some(rest) = token.strip_prefix('/').or_else(|| token.strip_prefix('-')) else {
            continue;
        };
        let Some(digits) = rest.strip_prefix("MP") else {
            continue;
        };
        if !digits.is_empty() && !digits.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        saw_mp = true;
        count = digits.parse::<usize>().ok();
    }

    if !saw_mp {
        return 1;
    }
    count.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Builds the argv for one fanned-out child: the original argv with every
/// source file other than `keep` removed, order preserved.
pub fn source_argv(args: &[String], keep: &str) -> Vec<OsString> {
    args.iter()
        .filter(|arg| !is_other_source_file(arg, keep))
        .map(OsString::from)
        .collect()
}

fn is_other_source_file(arg: &str, keep: &str) -> bool {
    arg != keep && !arg.starts_with('/') && !arg.starts_with('-') && !arg.starts_with('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_compile() {
        let args = vec!["/c".to_string(), "foo.cpp".to_string()];
        let parsed = parse_args(&args);
        assert!(parsed.has_option("c"));
        assert_eq!(parsed.source_files, vec!["foo.cpp".to_string()]);
    }

    #[test]
    fn parses_glued_and_separate_parameters() {
        let args = vec![
            "/Fooutput.obj".to_string(),
            "/I".to_string(),
            "include".to_string(),
        ];
        let parsed = parse_args(&args);
        assert_eq!(parsed.option_values("Fo"), ["output.obj"]);
        assert_eq!(parsed.option_values("I"), ["include"]);
    }

    #[test]
    fn classify_no_source_file() {
        let parsed = parse_args(&["/c".to_string()]);
        assert!(matches!(
            classify(&parsed, Path::new(".")),
            Classification::NoSourceFile
        ));
    }

    #[test]
    fn classify_ok_with_default_output_path() {
        let args = vec!["/c".to_string(), "foo.cpp".to_string()];
        let parsed = parse_args(&args);
        match classify(&parsed, Path::new("/work")) {
            Classification::Ok {
                source_file,
                output_file,
            } => {
                assert_eq!(source_file, "foo.cpp");
                assert_eq!(output_file, PathBuf::from("/work/foo.obj"));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn classify_multiple_source_files_simple() {
        let args = vec!["/c".to_string(), "a.cpp".to_string(), "b.cpp".to_string()];
        let parsed = parse_args(&args);
        match classify(&parsed, Path::new(".")) {
            Classification::MultipleSourceFilesSimple(list) => {
                assert_eq!(list, vec!["a.cpp".to_string(), "b.cpp".to_string()]);
            }
            other => panic!("expected MultipleSourceFilesSimple, got {other:?}"),
        }
    }

    #[test]
    fn classify_external_debug_info_short_circuits() {
        let args = vec!["/Zi".to_string(), "/c".to_string(), "a.cpp".to_string()];
        let parsed = parse_args(&args);
        assert!(matches!(
            classify(&parsed, Path::new(".")),
            Classification::ExternalDebugInfo
        ));
    }

    #[test]
    fn classify_called_for_link_without_c() {
        let args = vec!["foo.obj".to_string()];
        let parsed = parse_args(&args);
        assert!(matches!(
            classify(&parsed, Path::new(".")),
            Classification::CalledForLink
        ));
    }

    #[test]
    fn bare_mp_uses_logical_cpus() {
        std::env::remove_var("CL");
        let args = vec!["/MP".to_string(), "/c".to_string(), "a.cpp".to_string()];
        assert!(effective_parallelism(&args) >= 1);
    }

    #[test]
    fn explicit_mp_count_wins() {
        std::env::remove_var("CL");
        let args = vec!["/MP4".to_string(), "/c".to_string(), "a.cpp".to_string()];
        assert_eq!(effective_parallelism(&args), 4);
    }

    #[test]
    fn no_mp_means_one() {
        std::env::remove_var("CL");
        let args = vec!["/c".to_string(), "a.cpp".to_string()];
        assert_eq!(effective_parallelism(&args), 1);
    }
}
