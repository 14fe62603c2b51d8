// pipeline.rs — Compilation state and pass orchestration
//
// Holds every pass artifact and runs the minimal set of passes for a given
// terminal PassId. `lower` runs the whole chain and either returns the
// verified loop nest or the diagnostics of the failing pass.
//
// Preconditions: the pipeline must be set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics; nest cert failure.
// Side effects: calls on_pass_complete after each pass; logs pass timings
//               through `tracing` at debug level.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::atomics::{insert_atomics, StageSync};
use crate::diag::{codes, has_errors, Diagnostic, Site};
use crate::func::Pipeline;
use crate::graph::{build_graph, FuncGraph};
use crate::inline::inline_funcs;
use crate::lower::{build_loop_nest, StageState};
use crate::nest::{verify_nest, LoopNest, NestCert};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::region::{infer_regions, RegionResult};
use crate::schedule::{check_schedules, ScheduleCert};
use crate::skip::{skip_stages, SkipReport};
use crate::storage::{plan_storage, StorageDecision, StorageOptions};

// ── Options ────────────────────────────────────────────────────────────────

/// Switches for the optional refinement passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerOptions {
    pub storage_folding: bool,
    pub sliding_window: bool,
    pub skip_stages: bool,
    pub atomics: bool,
    pub verify: bool,
    /// Largest fold factor chosen automatically.
    pub max_fold_factor: i64,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions {
            storage_folding: true,
            sliding_window: true,
            skip_stages: true,
            atomics: true,
            verify: true,
            max_fold_factor: 1024,
        }
    }
}

impl LowerOptions {
    fn storage(&self) -> StorageOptions {
        StorageOptions {
            folding: self.storage_folding,
            sliding_window: self.sliding_window,
            max_fold_factor: self.max_fold_factor,
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible output.
///
/// `pipeline_hash`: SHA-256 of the canonical compact JSON of the pipeline.
/// `options_hash`: SHA-256 of the canonical compact JSON of the options.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub pipeline_hash: [u8; 32],
    pub options_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the pipeline hash (64 characters).
    pub fn pipeline_hash_hex(&self) -> String {
        bytes_to_hex(&self.pipeline_hash)
    }

    pub fn options_hash_hex(&self) -> String {
        bytes_to_hex(&self.options_hash)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"pipeline_hash\": \"{}\",\n  \"options_hash\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            self.pipeline_hash_hex(),
            self.options_hash_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(text: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the pipeline and the options it is lowered with.
pub fn compute_provenance(pipeline: &Pipeline, options: &LowerOptions) -> Provenance {
    let canonical = serde_json::to_string(pipeline).unwrap_or_default();
    let opts = serde_json::to_string(options).unwrap_or_default();
    Provenance {
        pipeline_hash: sha256(&canonical),
        options_hash: sha256(&opts),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub pipeline: Pipeline,
    pub graph: Option<FuncGraph>,
    pub schedule_cert: Option<ScheduleCert>,
    /// Declaration-level realization order, inlined Funcs included.
    pub declared_order: Option<Vec<String>>,
    /// Pipeline with inlined Funcs substituted and removed.
    pub inlined: Option<Pipeline>,
    pub inlined_funcs: Vec<String>,
    pub order: Option<Vec<String>>,
    pub regions: Option<RegionResult>,
    pub nest: Option<LoopNest>,
    pub stage_states: BTreeMap<(String, usize), StageState>,
    pub storage: Vec<StorageDecision>,
    pub guards: Vec<SkipReport>,
    pub sync: Vec<StageSync>,
    pub nest_cert: Option<NestCert>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            graph: None,
            schedule_cert: None,
            declared_order: None,
            inlined: None,
            inlined_funcs: Vec::new(),
            order: None,
            regions: None,
            nest: None,
            stage_states: BTreeMap::new(),
            storage: Vec::new(),
            guards: Vec::new(),
            sync: Vec::new(),
            nest_cert: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error types ────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pass {failing_pass:?} failed")]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

/// `lower` failed; no loop nest is returned.
#[derive(Debug, Error)]
#[error("lowering failed in `{pass}` with {} error(s)", error_count(.diagnostics))]
pub struct LowerFailure {
    pub pass: &'static str,
    /// Every diagnostic emitted up to and including the failing pass.
    pub diagnostics: Vec<Diagnostic>,
}

fn error_count(diags: &[Diagnostic]) -> usize {
    diags.iter().filter(|d| d.is_error()).count()
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Per-pass post-processing: callback, accumulate, log, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_errors(&diags);
    debug!(
        pass = descriptor(pass_id).name,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        diagnostics = diags.len(),
        "pass complete"
    );
    state.diagnostics.extend(diags);
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// An artifact an earlier pass should have produced is absent.
fn missing(state: &mut CompilationState, pass_id: PassId, what: &str) -> PipelineError {
    state.diagnostics.push(Diagnostic::error(
        codes::E0600,
        Site::Pipeline,
        format!("{} ran without {}", descriptor(pass_id).name, what),
    ));
    state.has_error = true;
    PipelineError {
        failing_pass: pass_id,
    }
}

/// Error diagnostic summarizing a failed certificate, if it failed.
fn cert_failure(cert: &impl StageCert, what: &str) -> Option<Diagnostic> {
    if cert.all_pass() {
        return None;
    }
    Some(Diagnostic::error(
        codes::E0600,
        Site::Pipeline,
        format!("{} verification failed: {}", what, cert.failed().join(", ")),
    ))
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → log → error check.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &LowerOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    state.provenance = Some(compute_provenance(&state.pipeline, options));

    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Validate => {
                let graph = build_graph(&state.pipeline);
                let mut diags = graph.diagnostics;
                // Schedules are meaningless on a malformed graph.
                if !has_errors(&diags) {
                    let sched = check_schedules(&state.pipeline);
                    diags.extend(sched.diagnostics);
                    if !has_errors(&diags) {
                        diags.extend(cert_failure(&sched.cert, "schedule"));
                    }
                    state.schedule_cert = Some(sched.cert);
                }
                state.declared_order = Some(graph.order);
                state.graph = Some(graph.graph);
                diags
            }
            PassId::Inline => {
                let Some(order) = state.declared_order.as_ref() else {
                    return Err(missing(state, pass_id, "a realization order"));
                };
                let result = inline_funcs(&state.pipeline, order);
                let mut inlined = result.pipeline;
                inlined.funcs.retain(|f| !result.inlined.contains(&f.name));
                state.inlined = Some(inlined);
                state.inlined_funcs = result.inlined;
                Vec::new()
            }
            PassId::Order => {
                let Some(inlined) = state.inlined.as_ref() else {
                    return Err(missing(state, pass_id, "an inlined pipeline"));
                };
                let graph = build_graph(inlined);
                state.order = Some(graph.order);
                graph.diagnostics
            }
            PassId::Regions => {
                let (Some(inlined), Some(order)) = (state.inlined.as_ref(), state.order.as_ref())
                else {
                    return Err(missing(state, pass_id, "a realization order"));
                };
                let mut result = infer_regions(inlined, order);
                let diags = std::mem::take(&mut result.diagnostics);
                state.regions = Some(result);
                diags
            }
            PassId::Synthesize => {
                let (Some(inlined), Some(order)) = (state.inlined.as_ref(), state.order.as_ref())
                else {
                    return Err(missing(state, pass_id, "a realization order"));
                };
                let result = build_loop_nest(inlined, order);
                state.stage_states = result.stage_states;
                if !has_errors(&result.diagnostics) {
                    state.nest = Some(result.nest);
                }
                result.diagnostics
            }
            PassId::Storage => {
                let (Some(inlined), Some(nest)) = (state.inlined.as_ref(), state.nest.take()) else {
                    return Err(missing(state, pass_id, "a loop nest"));
                };
                let result = plan_storage(nest, inlined, options.storage());
                state.storage = result.decisions;
                state.nest = Some(result.nest);
                result.diagnostics
            }
            PassId::SkipStages => {
                let (Some(inlined), Some(order)) = (state.inlined.as_ref(), state.order.as_ref())
                else {
                    return Err(missing(state, pass_id, "a realization order"));
                };
                if options.skip_stages {
                    let Some(nest) = state.nest.take() else {
                        return Err(missing(state, pass_id, "a loop nest"));
                    };
                    let result = skip_stages(nest, inlined, order);
                    state.guards = result.guards;
                    state.nest = Some(result.nest);
                }
                Vec::new()
            }
            PassId::Atomics => {
                let Some(inlined) = state.inlined.as_ref() else {
                    return Err(missing(state, pass_id, "an inlined pipeline"));
                };
                if options.atomics {
                    let Some(nest) = state.nest.take() else {
                        return Err(missing(state, pass_id, "a loop nest"));
                    };
                    let result = insert_atomics(nest, inlined);
                    state.sync = result.stages;
                    state.nest = Some(result.nest);
                    result.diagnostics
                } else {
                    Vec::new()
                }
            }
            PassId::Verify => {
                let (Some(inlined), Some(nest)) = (state.inlined.as_ref(), state.nest.as_ref()) else {
                    return Err(missing(state, pass_id, "a loop nest"));
                };
                if options.verify {
                    let inputs: BTreeSet<String> = inlined
                        .funcs
                        .iter()
                        .filter(|f| f.is_input())
                        .map(|f| f.name.clone())
                        .collect();
                    let (cert, mut diags) = verify_nest(nest, &inputs);
                    if diags.is_empty() {
                        diags.extend(cert_failure(&cert, "loop-nest"));
                    }
                    state.nest_cert = Some(cert);
                    diags
                } else {
                    Vec::new()
                }
            }
        };
        finish_pass(state, pass_id, diags, t.elapsed(), &mut on_pass_complete)?;
    }
    Ok(())
}

// ── One-shot lowering ──────────────────────────────────────────────────────

/// A verified loop nest and the decisions that shaped it.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub nest: LoopNest,
    pub order: Vec<String>,
    pub storage: Vec<StorageDecision>,
    pub guards: Vec<SkipReport>,
    pub sync: Vec<StageSync>,
    /// Warnings emitted along the way.
    pub diagnostics: Vec<Diagnostic>,
}

/// Run every pass over `pipeline`.
pub fn lower(pipeline: &Pipeline, options: &LowerOptions) -> Result<Lowered, LowerFailure> {
    let mut state = CompilationState::new(pipeline.clone());
    if let Err(e) = run_pipeline(&mut state, PassId::Verify, options, |_, _| {}) {
        return Err(LowerFailure {
            pass: descriptor(e.failing_pass).name,
            diagnostics: state.diagnostics,
        });
    }
    let Some(nest) = state.nest else {
        return Err(LowerFailure {
            pass: descriptor(PassId::Verify).name,
            diagnostics: state.diagnostics,
        });
    };
    Ok(Lowered {
        nest,
        order: state.order.unwrap_or_default(),
        storage: state.storage,
        guards: state.guards,
        sync: state.sync,
        diagnostics: state.diagnostics,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{var, ScalarType};
    use crate::func::Func;

    fn blur() -> Pipeline {
        let input = Func::input("in", ScalarType::UInt(8), &[0, 0], &[20, 20]);
        let bx = Func::new("blur_x", &["x", "y"]).define(
            input.call([var("x"), var("y")]) + input.call([var("x") + 1, var("y")]),
        );
        let by = Func::new("blur_y", &["x", "y"]).define(
            bx.call([var("x"), var("y")]) + bx.call([var("x"), var("y") + 1]),
        );
        Pipeline::new()
            .with_func(input)
            .with_func(bx.compute_at("blur_y", "y").store_root())
            .with_func(by)
            .output("blur_y", &[0, 0], &[8, 8])
    }

    #[test]
    fn lower_runs_every_pass() {
        let mut seen = Vec::new();
        let mut state = CompilationState::new(blur());
        let result = run_pipeline(&mut state, PassId::Verify, &LowerOptions::default(), |p, _| {
            seen.push(p)
        });
        assert!(result.is_ok(), "{:?}", state.diagnostics);
        assert_eq!(seen.len(), 8);
        assert!(state.nest_cert.as_ref().is_some_and(|c| c.all_pass()));
        let order = ["in", "blur_x", "blur_y"].map(String::from).to_vec();
        assert_eq!(state.order, Some(order));
        assert!(state.regions.is_none());
    }

    #[test]
    fn regions_terminal_stops_before_synthesis() {
        let mut state = CompilationState::new(blur());
        let result = run_pipeline(&mut state, PassId::Regions, &LowerOptions::default(), |_, _| {});
        assert!(result.is_ok());
        assert!(state.nest.is_none());
        let regions = state.regions.as_ref().map(|r| r.regions.len());
        assert_eq!(regions, Some(3));
    }

    #[test]
    fn inlined_funcs_leave_the_pipeline() {
        let g = Func::new("g", &["x"]).define(var("x") * 2);
        let f = Func::new("f", &["x"]).define(g.call([var("x")]) + 1);
        let p = Pipeline::new().with_func(g).with_func(f).output("f", &[0], &[4]);
        let lowered = lower(&p, &LowerOptions::default());
        let lowered = lowered.unwrap_or_else(|e| panic!("{e}: {:?}", e.diagnostics));
        assert_eq!(lowered.order, vec!["f".to_string()]);
        assert!(lowered.nest.body.find_realize("g").is_none());
    }

    #[test]
    fn undefined_callee_stops_at_validate() {
        let ghost = Func::new("ghost", &["x"]);
        let f = Func::new("f", &["x"]).define(ghost.call([var("x")]));
        let p = Pipeline::new().with_func(f).output("f", &[0], &[4]);
        let err = lower(&p, &LowerOptions::default()).err();
        let err = err.unwrap_or_else(|| panic!("lowering should fail"));
        assert_eq!(err.pass, "validate");
        assert!(err.diagnostics.iter().any(|d| d.code == Some(codes::E0101)));
        assert!(err.to_string().starts_with("lowering failed in `validate`"));
    }

    #[test]
    fn disabled_folding_keeps_full_storage() {
        let options = LowerOptions {
            storage_folding: false,
            sliding_window: false,
            ..LowerOptions::default()
        };
        let lowered = lower(&blur(), &options).unwrap_or_else(|e| panic!("{e}"));
        assert!(lowered
            .storage
            .iter()
            .all(|d| d.choice == crate::storage::StorageChoice::Full));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let parsed: LowerOptions = serde_json::from_str(r#"{"skip_stages": false}"#)
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(!parsed.skip_stages);
        assert!(parsed.storage_folding);
        assert_eq!(parsed.max_fold_factor, 1024);
    }

    #[test]
    fn provenance_tracks_pipeline_and_options() {
        let opts = LowerOptions::default();
        let a = compute_provenance(&blur(), &opts);
        let b = compute_provenance(&blur(), &opts);
        assert_eq!(a, b);
        assert_eq!(a.pipeline_hash_hex().len(), 64);
        let other = LowerOptions {
            skip_stages: false,
            ..opts
        };
        assert_ne!(a.options_hash, compute_provenance(&blur(), &other).options_hash);
        let json = a.to_json();
        assert!(json.contains("\"compiler_version\""));
    }
}
