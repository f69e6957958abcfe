// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests driving the real `clcache` binary against the fake
//! compiler in `testdata/fake_cl.sh`, the way `action_wrapper`'s
//! `tests/run_binary.rs` drives its own binary against a fixture script.

use std::{
    fs,
    process::{Command, Output},
};

use clcache::stats::Statistics;
use tempfile::tempdir;

fn fake_cl_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/fake_cl.sh").to_string()
}

struct Harness {
    workdir: tempfile::TempDir,
    cache_dir: tempfile::TempDir,
    call_log: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        let workdir = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let call_log = workdir.path().join("fake_cl_calls.log");
        fs::write(&call_log, "").unwrap();
        Self {
            workdir,
            cache_dir,
            call_log,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.workdir.path().join(name)
    }

    fn write_source(&self, name: &str, contents: &str) {
        fs::write(self.path(name), contents).unwrap();
    }

    fn call_count(&self) -> usize {
        fs::read_to_string(&self.call_log)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .count()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_clcache"))
            .current_dir(self.workdir.path())
            .env("CLCACHE_CL", fake_cl_path())
            .env("CLCACHE_DIR", self.cache_dir.path())
            .env("FAKE_CL_CALL_LOG", &self.call_log)
            .args(args)
            .output()
            .unwrap()
    }

    fn stats(&self) -> Statistics {
        Statistics::load(self.cache_dir.path())
    }
}

#[test]
fn clean_cache_miss_records_one_entry() {
    let h = Harness::new();
    h.write_source("a.cpp", "int main(){return 0;}\n");

    let output = h.run(&["/c", "/FoOut.obj", "a.cpp"]);
    assert!(output.status.success(), "stderr: {:?}", output.stderr);

    let obj_bytes = fs::read(h.path("Out.obj")).unwrap();
    assert!(!obj_bytes.is_empty());

    let stats = h.stats();
    assert_eq!(stats.cache_entries(), 1);
    assert_eq!(stats.cache_misses(), 1);
    assert_eq!(stats.cache_size(), obj_bytes.len() as u64);
}

#[test]
fn repeat_invocation_is_a_hit_and_skips_the_real_compiler() {
    let h = Harness::new();
    h.write_source("a.cpp", "int main(){return 0;}\n");

    let first = h.run(&["/c", "/FoOut.obj", "a.cpp"]);
    assert!(first.status.success());
    let first_bytes = fs::read(h.path("Out.obj")).unwrap();
    let calls_after_first = h.call_count();

    let second = h.run(&["/c", "/FoOut.obj", "a.cpp"]);
    assert!(second.status.success());
    let second_bytes = fs::read(h.path("Out.obj")).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(
        h.call_count(),
        calls_after_first,
        "the real compiler must not run again on a hit"
    );

    let stats = h.stats();
    assert_eq!(stats.cache_hits(), 1);
    assert_eq!(stats.cache_misses(), 1);
}

fn run_with_mode(h: &Harness, direct_mode: bool, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_clcache"));
    command
        .current_dir(h.workdir.path())
        .env("CLCACHE_CL", fake_cl_path())
        .env("CLCACHE_DIR", h.cache_dir.path())
        .env("FAKE_CL_CALL_LOG", &h.call_log)
        .args(args);
    if direct_mode {
        command.env("CLCACHE_DIRECT", "1");
    }
    command.output().unwrap()
}

#[test]
fn modifying_the_source_produces_a_second_entry() {
    for direct_mode in [false, true] {
        let h = Harness::new();
        h.write_source("a.cpp", "int main(){return 1;}\n");
        let args = ["/c", "/FoOut.obj", "a.cpp"];

        let first = run_with_mode(&h, direct_mode, &args);
        assert!(first.status.success(), "stderr: {:?}", first.stderr);
        let second = run_with_mode(&h, direct_mode, &args);
        assert!(second.status.success());

        h.write_source("a.cpp", "int main(){return 2;}\n");
        let third = run_with_mode(&h, direct_mode, &args);
        assert!(third.status.success(), "stderr: {:?}", third.stderr);

        let stats = h.stats();
        assert_eq!(stats.cache_entries(), 2, "direct_mode={direct_mode}");
    }
}

#[test]
fn direct_mode_invalidates_when_an_included_header_changes() {
    let h = Harness::new();
    h.write_source("a.cpp", "int main(){return included();}\n");
    h.write_source("h.h", "int included(){return 0;}\n");
    let header_abs = h.path("h.h");
    h.write_source("a.cpp.includes", &header_abs.to_string_lossy());

    let run_direct = |h: &Harness| run_with_mode(h, true, &["/c", "/FoOut.obj", "a.cpp"]);

    let first = run_direct(&h);
    assert!(first.status.success(), "stderr: {:?}", first.stderr);
    assert_eq!(h.stats().cache_misses(), 1);

    let second = run_direct(&h);
    assert!(second.status.success());
    assert_eq!(h.stats().cache_hits(), 1);

    h.write_source("h.h", "int included(){return 99;}\n");
    let third = run_direct(&h);
    assert!(third.status.success(), "stderr: {:?}", third.stderr);

    let stats = h.stats();
    assert_eq!(stats.cache_misses(), 2, "changed header must force a miss");
    assert_eq!(stats.cache_entries(), 2);
}

#[test]
fn eviction_keeps_cache_size_under_the_configured_maximum() {
    let h = Harness::new();
    h.run(&["-M", "1000"]);

    let sources = ["a.cpp", "b.cpp", "c.cpp", "d.cpp"];
    for (i, source) in sources.iter().enumerate() {
        h.write_source(source, &format!("int marker_{i}(){{return {i};}}\n"));
        let output = Command::new(env!("CARGO_BIN_EXE_clcache"))
            .current_dir(h.workdir.path())
            .env("CLCACHE_CL", fake_cl_path())
            .env("CLCACHE_DIR", h.cache_dir.path())
            .env("FAKE_CL_CALL_LOG", &h.call_log)
            .env("FAKE_CL_OBJECT_SIZE", "400")
            .args(["/c", "/FoOut.obj", source])
            .output()
            .unwrap();
        assert!(output.status.success(), "stderr: {:?}", output.stderr);
        // Each source's object must differ so every invocation is a fresh entry.
    }

    let stats = h.stats();
    assert!(stats.cache_size() <= 900, "size was {}", stats.cache_size());
    assert!(stats.cache_entries() < 4, "eviction should have dropped at least one entry");
}

#[test]
fn multiple_source_files_fan_out_into_independent_cache_entries() {
    let h = Harness::new();
    fs::create_dir(h.path("Out")).unwrap();
    h.write_source("a.cpp", "int main_a(){return 0;}\n");
    h.write_source("b.cpp", "int main_b(){return 0;}\n");

    let output = h.run(&["/c", "a.cpp", "b.cpp", "/MP2", "/FoOut/"]);
    assert!(output.status.success(), "stderr: {:?}", output.stderr);

    assert!(h.path("Out/a.obj").exists());
    assert!(h.path("Out/b.obj").exists());

    let stats = h.stats();
    assert_eq!(stats.cache_entries(), 2);
    assert_eq!(stats.cache_misses(), 2);
}
