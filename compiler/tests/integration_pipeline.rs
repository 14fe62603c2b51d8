// Integration tests for the `nestc` binary.
//
// These tests verify:
// - every --emit target produces its artifact from a JSON pipeline
// - minimal pass evaluation (--emit dot / regions succeed on pipelines
//   that would fail later passes)
// - exit codes: 1 for lowering errors, 2 for unreadable input

use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};

use nestc::expr::{var, ScalarType};
use nestc::func::{Func, Pipeline};
use nestc::nest::LoopNest;
use nestc::pipeline::{lower, LowerOptions};

fn nestc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nestc"))
}

/// Unique counter for temp file names (avoids collisions in parallel tests).
static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{}_{}_{}.{}", prefix, std::process::id(), n, ext))
}

fn write_pipeline(p: &Pipeline) -> PathBuf {
    let path = temp_path("nestc_cli", "json");
    let json = serde_json::to_string_pretty(p).expect("pipeline serializes");
    std::fs::write(&path, json).expect("write temp pipeline");
    path
}

fn run_nestc(args: &[&str]) -> Output {
    Command::new(nestc_binary())
        .args(args)
        .output()
        .expect("failed to run nestc")
}

fn stdout_of(args: &[&str]) -> String {
    let output = run_nestc(args);
    assert!(
        output.status.success(),
        "nestc failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

fn blur() -> Pipeline {
    let input = Func::input("in", ScalarType::UInt(8), &[0, 0], &[34, 34]);
    let bx = Func::new("blur_x", &["x", "y"])
        .define(input.call([var("x"), var("y") + 1]) + input.call([var("x") + 2, var("y") + 1]))
        .store_root()
        .compute_at("blur_y", "y");
    let by = Func::new("blur_y", &["x", "y"])
        .define(bx.call([var("x"), var("y")]) + bx.call([var("x"), var("y") + 2]))
        .stage(0, |s| s.split("x", "xo", "xi", 8, nestc::schedule::TailStrategy::GuardWithIf));
    Pipeline::new()
        .with_func(input)
        .with_func(bx)
        .with_func(by)
        .output("blur_y", &[0, 0], &[32, 32])
}

/// A pipeline whose lookup is unbounded: validates, fails in synthesis.
fn unbounded_lookup() -> Pipeline {
    let input = Func::input("in", ScalarType::I32, &[0], &[8]);
    let lut = Func::new("lut", &["i"]).define(var("i") * 2).compute_root();
    let out = Func::new("out", &["x"]).define(lut.call([input.call([var("x")])]));
    Pipeline::new()
        .with_func(input)
        .with_func(lut)
        .with_func(out)
        .output("out", &[0], &[8])
}

#[test]
fn emit_nest_prints_the_loop_nest() {
    let path = write_pipeline(&blur());
    let text = stdout_of(&[path.to_str().unwrap(), "--emit", "nest"]);
    assert!(text.contains("realize blur_x("), "{text}");
    assert!(text.contains("produce blur_y"), "{text}");
    assert!(text.contains("fold 4"), "{text}");
    assert!(text.contains("blur_y.s0.xo"), "{text}");
}

#[test]
fn emit_json_matches_library_lowering() {
    let p = blur();
    let path = write_pipeline(&p);
    let text = stdout_of(&[path.to_str().unwrap(), "--emit", "json"]);
    let from_cli: LoopNest = serde_json::from_str(&text).expect("nest JSON parses");
    let lowered = lower(&p, &LowerOptions::default()).expect("lowers");
    assert_eq!(from_cli, lowered.nest);
}

#[test]
fn no_fold_keeps_full_storage() {
    let path = write_pipeline(&blur());
    let text = stdout_of(&[path.to_str().unwrap(), "--emit", "nest", "--no-fold", "--no-sliding"]);
    assert!(!text.contains(" fold "), "{text}");
    assert!(!text.contains(" window "), "{text}");
}

#[test]
fn emit_dot_only_needs_validation() {
    let path = write_pipeline(&unbounded_lookup());
    let text = stdout_of(&[path.to_str().unwrap(), "--emit", "dot"]);
    assert!(text.starts_with("digraph pipeline {"), "{text}");
    assert!(text.contains("lut -> out;"), "{text}");
}

#[test]
fn emit_regions_lists_every_func() {
    let path = write_pipeline(&blur());
    let text = stdout_of(&[path.to_str().unwrap(), "--emit", "regions"]);
    let entries: serde_json::Value = serde_json::from_str(&text).expect("regions JSON parses");
    let funcs: Vec<&str> = entries
        .as_array()
        .expect("array of regions")
        .iter()
        .filter_map(|e| e["func"].as_str())
        .collect();
    assert!(funcs.contains(&"blur_x"), "{funcs:?}");
    assert_eq!(funcs.last(), Some(&"blur_y"));
}

#[test]
fn output_flag_writes_file() {
    let path = write_pipeline(&blur());
    let out = temp_path("nestc_out", "txt");
    let text = stdout_of(&[
        path.to_str().unwrap(),
        "--emit",
        "nest",
        "-o",
        out.to_str().unwrap(),
    ]);
    assert!(text.is_empty());
    let written = std::fs::read_to_string(&out).expect("output written");
    assert!(written.contains("produce blur_y"));
}

#[test]
fn lowering_error_exits_with_one() {
    let path = write_pipeline(&unbounded_lookup());
    let output = run_nestc(&[path.to_str().unwrap(), "--emit", "nest"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[E0100]"), "{stderr}");
}

#[test]
fn missing_file_exits_with_two() {
    let output = run_nestc(&["/nonexistent/pipeline.json"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn malformed_json_exits_with_two() {
    let path = temp_path("nestc_bad", "json");
    std::fs::write(&path, "{ not json").expect("write temp");
    let output = run_nestc(&[path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}
