// Reproducibility tests for lowering.
//
// These tests verify that the compiler produces byte-identical outputs
// for identical inputs, and that build provenance tracks both the pipeline
// and the lowering options.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use nestc::expr::var;
use nestc::func::{Func, Pipeline};
use nestc::pipeline::{lower, LowerOptions};
use nestc::schedule::TailStrategy;

fn nestc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nestc"))
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn write_pipeline(p: &Pipeline) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "nestc_repro_{}_{}.json",
        std::process::id(),
        n
    ));
    let json = serde_json::to_string(p).expect("pipeline serializes");
    std::fs::write(&path, json).expect("write temp pipeline");
    path
}

fn run_nestc(args: &[&str]) -> String {
    let output = Command::new(nestc_binary())
        .args(args)
        .output()
        .expect("failed to run nestc");
    assert!(
        output.status.success(),
        "nestc failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

fn field(json: &str, key: &str) -> String {
    let v: serde_json::Value = serde_json::from_str(json).expect("build-info parses");
    v[key].as_str().unwrap_or_default().to_string()
}

fn stencil_chain() -> Pipeline {
    chain(false)
}

fn chain(a_at_root: bool) -> Pipeline {
    let a = Func::new("a", &["x", "y"]).define(var("x") * 3 + var("y"));
    let a = if a_at_root {
        a.compute_root()
    } else {
        a.store_root().compute_at("c", "y")
    };
    let b = Func::new("b", &["x", "y"])
        .define(a.call([var("x"), var("y") - 1]) + a.call([var("x"), var("y") + 1]))
        .store_root()
        .compute_at("c", "y");
    let c = Func::new("c", &["x", "y"])
        .define(b.call([var("x"), var("y")]) + b.call([var("x") + 1, var("y") + 1]))
        .stage(0, |s| {
            s.split("x", "xo", "xi", 4, TailStrategy::GuardWithIf)
                .parallel("xo")
        });
    Pipeline::new()
        .with_func(a)
        .with_func(b)
        .with_func(c)
        .output("c", &[0, 0], &[17, 9])
}

/// Lowering the same pipeline twice produces byte-identical nest text.
#[test]
fn same_pipeline_identical_nest() {
    let path = write_pipeline(&stencil_chain());
    let path_str = path.to_str().unwrap();

    let first = run_nestc(&[path_str, "--emit", "nest"]);
    let second = run_nestc(&[path_str, "--emit", "nest"]);
    assert_eq!(first, second, "nest output should be byte-identical across runs");

    let first = run_nestc(&[path_str, "--emit", "json"]);
    let second = run_nestc(&[path_str, "--emit", "json"]);
    assert_eq!(first, second, "JSON output should be byte-identical across runs");
}

/// The library result is independent of how often it is called.
#[test]
fn library_lowering_is_deterministic() {
    let p = stencil_chain();
    let options = LowerOptions::default();
    let first = lower(&p, &options).expect("lowers");
    let second = lower(&p, &options).expect("lowers");
    assert_eq!(first.nest, second.nest);
    assert_eq!(first.order, second.order);
    assert_eq!(first.storage, second.storage);
    assert_eq!(first.nest.to_string(), second.nest.to_string());
}

/// Build info is stable for identical inputs.
#[test]
fn build_info_is_stable() {
    let path = write_pipeline(&stencil_chain());
    let path_str = path.to_str().unwrap();
    let first = run_nestc(&[path_str, "--emit", "build-info"]);
    let second = run_nestc(&[path_str, "--emit", "build-info"]);
    assert_eq!(first, second);
    assert_eq!(field(&first, "pipeline_hash").len(), 64);
    assert_eq!(field(&first, "compiler_version"), env!("CARGO_PKG_VERSION"));
}

/// Changing an option changes options_hash but not pipeline_hash.
#[test]
fn options_hash_tracks_flags() {
    let path = write_pipeline(&stencil_chain());
    let path_str = path.to_str().unwrap();
    let default = run_nestc(&[path_str, "--emit", "build-info"]);
    let no_fold = run_nestc(&[path_str, "--emit", "build-info", "--no-fold"]);
    assert_eq!(field(&default, "pipeline_hash"), field(&no_fold, "pipeline_hash"));
    assert_ne!(field(&default, "options_hash"), field(&no_fold, "options_hash"));
}

/// Two pipelines that differ only in schedule hash differently.
#[test]
fn pipeline_hash_covers_schedule() {
    let base = chain(false);
    let rescheduled = chain(true);
    let a = run_nestc(&[write_pipeline(&base).to_str().unwrap(), "--emit", "build-info"]);
    let b = run_nestc(&[write_pipeline(&rescheduled).to_str().unwrap(), "--emit", "build-info"]);
    assert_ne!(field(&a, "pipeline_hash"), field(&b, "pipeline_hash"));
}
