// schedule.rs — Schedule directives and their validation
//
// Directives say where each Func is computed and stored (loop levels) and
// how each stage's loops are transformed (split, fuse, rename, reorder,
// loop kinds). `check_schedules` applies the loop transforms of every
// stage to produce its final dimension list and verifies the schedule
// before any loop nest is built.
//
// Preconditions: `pipeline` passes graph checks (callees exist, arities match).
// Postconditions: returns `ScheduleResult` with the final loop dimensions of
//                 every non-inlined stage; `cert.all_pass()` when no errors.
// Failure modes: illegal directives produce E0200, E0202, E0203, E0205 and
//                E0206 diagnostics.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, DiagCode, Diagnostic, Site};
use crate::func::{Func, FuncKind, Pipeline};
use crate::nest::ForType;

// ── Public types ────────────────────────────────────────────────────────────

/// Where a Func is computed or stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopLevel {
    /// Substituted into every call site.
    Inlined,
    /// Outside all loops.
    Root,
    /// Inside the loop over `var` of stage `stage` of `func`.
    At {
        func: String,
        stage: usize,
        var: String,
    },
}

impl LoopLevel {
    pub fn at(func: impl Into<String>, var: impl Into<String>) -> Self {
        LoopLevel::At {
            func: func.into(),
            stage: 0,
            var: var.into(),
        }
    }

    /// Qualified name of the loop this level refers to.
    pub fn loop_name(&self) -> Option<String> {
        match self {
            LoopLevel::At { func, stage, var } => Some(loop_name(func, *stage, var)),
            _ => None,
        }
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Inlined => write!(f, "inline"),
            LoopLevel::Root => write!(f, "root"),
            LoopLevel::At { func, stage, var } => write!(f, "{}.s{}.{}", func, stage, var),
        }
    }
}

/// Qualified loop / bound-variable name for `var` of stage `stage` of `func`.
pub fn loop_name(func: &str, stage: usize, var: &str) -> String {
    format!("{}.s{}.{}", func, stage, var)
}

/// What to do when a split factor does not divide the loop extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TailStrategy {
    RoundUp,
    GuardWithIf,
    Predicate,
    PredicateLoads,
    PredicateStores,
    ShiftInwards,
    RoundUpAndBlend,
    ShiftInwardsAndBlend,
    Auto,
}

impl TailStrategy {
    pub fn is_shift_inwards(self) -> bool {
        matches!(
            self,
            TailStrategy::ShiftInwards | TailStrategy::ShiftInwardsAndBlend
        )
    }

    /// Resolve `Auto` for the loop being split.
    pub fn resolve(self, is_rvar: bool, is_update: bool) -> TailStrategy {
        match self {
            TailStrategy::Auto if is_rvar => TailStrategy::GuardWithIf,
            TailStrategy::Auto if !is_update => TailStrategy::ShiftInwards,
            TailStrategy::Auto => TailStrategy::RoundUp,
            other => other,
        }
    }

    /// Whether this strategy may be applied to the loop being split.
    pub fn legal_for(self, is_rvar: bool, is_update: bool) -> Result<(), &'static str> {
        if is_rvar
            && matches!(
                self,
                TailStrategy::RoundUp
                    | TailStrategy::ShiftInwards
                    | TailStrategy::ShiftInwardsAndBlend
                    | TailStrategy::PredicateStores
                    | TailStrategy::RoundUpAndBlend
            )
        {
            return Err("reduction variables cannot be split with a tail that runs extra iterations");
        }
        if is_update && self.is_shift_inwards() {
            return Err("update definitions cannot shift inwards: recomputing a point would apply the update twice");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopTransform {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i64,
        tail: TailStrategy,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
    Rename {
        old: String,
        new: String,
    },
    /// Variables listed innermost first.
    Reorder(Vec<String>),
    Mark {
        var: String,
        for_type: ForType,
    },
}

/// Loop transforms and synchronization hints of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSchedule {
    pub transforms: Vec<LoopTransform>,
    /// `Some(override_associativity)` when `atomic()` was requested.
    pub atomic: Option<bool>,
    pub allow_race_conditions: bool,
}

impl StageSchedule {
    pub fn split(
        mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
        tail: TailStrategy,
    ) -> Self {
        self.transforms.push(LoopTransform::Split {
            old: old.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor,
            tail,
        });
        self
    }

    pub fn fuse(mut self, inner: &str, outer: &str, fused: &str) -> Self {
        self.transforms.push(LoopTransform::Fuse {
            inner: inner.into(),
            outer: outer.into(),
            fused: fused.into(),
        });
        self
    }

    pub fn rename(mut self, old: &str, new: &str) -> Self {
        self.transforms.push(LoopTransform::Rename {
            old: old.into(),
            new: new.into(),
        });
        self
    }

    /// Reorder loops; `vars` is innermost first.
    pub fn reorder(mut self, vars: &[&str]) -> Self {
        self.transforms.push(LoopTransform::Reorder(
            vars.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        self,
        x: &str,
        y: &str,
        xo: &str,
        yo: &str,
        xi: &str,
        yi: &str,
        fx: i64,
        fy: i64,
        tail: TailStrategy,
    ) -> Self {
        self.split(x, xo, xi, fx, tail)
            .split(y, yo, yi, fy, tail)
            .reorder(&[xi, yi, xo, yo])
    }

    fn mark(mut self, var: &str, for_type: ForType) -> Self {
        self.transforms.push(LoopTransform::Mark {
            var: var.into(),
            for_type,
        });
        self
    }

    pub fn serial(self, var: &str) -> Self {
        self.mark(var, ForType::Serial)
    }

    pub fn parallel(self, var: &str) -> Self {
        self.mark(var, ForType::Parallel)
    }

    pub fn vectorize(self, var: &str) -> Self {
        self.mark(var, ForType::Vectorized)
    }

    pub fn unroll(self, var: &str) -> Self {
        self.mark(var, ForType::Unrolled)
    }

    pub fn gpu_blocks(self, var: &str) -> Self {
        self.mark(var, ForType::GpuBlock)
    }

    pub fn gpu_threads(self, var: &str) -> Self {
        self.mark(var, ForType::GpuThread)
    }

    pub fn atomic(mut self, override_associativity: bool) -> Self {
        self.atomic = Some(override_associativity);
        self
    }

    pub fn allow_race_conditions(mut self) -> Self {
        self.allow_race_conditions = true;
        self
    }
}

/// Explicit storage folding request for one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldRequest {
    pub var: String,
    pub factor: i64,
}

/// Func-level directives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncSchedule {
    pub compute_level: LoopLevel,
    /// `None` stores at the compute level.
    pub store_level: Option<LoopLevel>,
    pub folds: Vec<FoldRequest>,
    /// Storage order, innermost first.
    pub storage_order: Option<Vec<String>>,
    pub memoize: bool,
    pub is_async: bool,
}

impl Default for FuncSchedule {
    fn default() -> Self {
        FuncSchedule {
            compute_level: LoopLevel::Inlined,
            store_level: None,
            folds: Vec::new(),
            storage_order: None,
            memoize: false,
            is_async: false,
        }
    }
}

impl FuncSchedule {
    pub fn store_level(&self) -> &LoopLevel {
        self.store_level.as_ref().unwrap_or(&self.compute_level)
    }
}

/// One loop dimension of a stage after all transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub var: String,
    pub for_type: ForType,
    pub is_rvar: bool,
    /// Original (pre-transform) variables this loop derives from.
    pub sources: BTreeSet<String>,
}

/// A split, fuse or rename with its tail strategy resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitRecord {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i64,
        tail: TailStrategy,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
    Rename {
        old: String,
        new: String,
    },
}

/// Final loop structure of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLoops {
    /// Innermost first.
    pub dims: Vec<Dim>,
    pub splits: Vec<SplitRecord>,
    pub is_update: bool,
}

impl StageLoops {
    pub fn dim(&self, var: &str) -> Option<&Dim> {
        self.dims.iter().find(|d| d.var == var)
    }

    pub fn position(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.var == var)
    }
}

pub type StageLoopMap = BTreeMap<(String, usize), StageLoops>;

/// Result of schedule checking.
#[derive(Debug)]
pub struct ScheduleResult {
    pub loops: StageLoopMap,
    pub cert: ScheduleCert,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions (S1-S6).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: every compute_at / store_at names an existing loop of a
    /// non-inlined stage.
    pub s1_levels_resolve: bool,
    /// S2: store levels are at or outside compute levels.
    pub s2_store_encloses_compute: bool,
    /// S3: every split uses a tail strategy legal for its loop.
    pub s3_tails_legal: bool,
    /// S4: GPU thread loops are nested inside GPU block loops.
    pub s4_gpu_nesting: bool,
    /// S5: every loop transform names existing loops and fresh names, and
    /// reduction order is preserved.
    pub s5_transforms_valid: bool,
    /// S6: output requests name computed Funcs with matching dimensionality.
    pub s6_outputs_valid: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_levels_resolve
            && self.s2_store_encloses_compute
            && self.s3_tails_legal
            && self.s4_gpu_nesting
            && self.s5_transforms_valid
            && self.s6_outputs_valid
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_levels_resolve", self.s1_levels_resolve),
            ("S2_store_encloses_compute", self.s2_store_encloses_compute),
            ("S3_tails_legal", self.s3_tails_legal),
            ("S4_gpu_nesting", self.s4_gpu_nesting),
            ("S5_transforms_valid", self.s5_transforms_valid),
            ("S6_outputs_valid", self.s6_outputs_valid),
        ]
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Apply loop transforms of every stage and verify all directives.
pub fn check_schedules(pipeline: &Pipeline) -> ScheduleResult {
    let mut ctx = ScheduleCtx::new(pipeline);
    ctx.apply_all();
    ctx.check_levels();
    ctx.check_outputs();
    ctx.build_result()
}

/// Compute level after defaults: outputs are always computed at root.
pub fn effective_compute_level(pipeline: &Pipeline, func: &Func) -> LoopLevel {
    if pipeline.is_output(&func.name) {
        LoopLevel::Root
    } else {
        func.schedule.compute_level.clone()
    }
}

/// Store level after defaults: outputs are stored at root, everything else
/// at its store level or, if none, its compute level.
pub fn effective_store_level(pipeline: &Pipeline, func: &Func) -> LoopLevel {
    if pipeline.is_output(&func.name) {
        LoopLevel::Root
    } else {
        func.schedule.store_level().clone()
    }
}

/// Loop dimensions of stage `stage` of `func` after its transforms.
pub fn stage_loops(func: &Func, stage: usize) -> Result<StageLoops, (DiagCode, String)> {
    let def = func
        .definitions
        .get(stage)
        .ok_or_else(|| (codes::E0205, format!("`{}` has no stage {}", func.name, stage)))?;
    let is_update = stage > 0;
    let mut dims: Vec<Dim> = func
        .stage_vars(stage)
        .into_iter()
        .map(|(var, is_rvar)| Dim {
            sources: [var.clone()].into_iter().collect(),
            var,
            for_type: ForType::Serial,
            is_rvar,
        })
        .collect();
    let mut splits = Vec::new();
    let mut seen: BTreeSet<String> = dims.iter().map(|d| d.var.clone()).collect();
    let unknown = |var: &str| {
        (
            codes::E0205,
            format!(
                "stage {} of `{}` has no loop named `{}`",
                stage, func.name, var
            ),
        )
    };
    let fresh = |name: &str, seen: &mut BTreeSet<String>| {
        if seen.insert(name.to_string()) {
            Ok(())
        } else {
            Err((
                codes::E0205,
                format!(
                    "loop name `{}` is already used in stage {} of `{}`",
                    name, stage, func.name
                ),
            ))
        }
    };

    for t in &def.schedule.transforms {
        match t {
            LoopTransform::Split {
                old,
                outer,
                inner,
                factor,
                tail,
            } => {
                let i = dims.iter().position(|d| &d.var == old).ok_or_else(|| unknown(old))?;
                if *factor < 1 {
                    return Err((
                        codes::E0205,
                        format!("split of `{}` in `{}` needs a positive factor", old, func.name),
                    ));
                }
                fresh(outer, &mut seen)?;
                fresh(inner, &mut seen)?;
                let d = dims.remove(i);
                tail.legal_for(d.is_rvar, is_update).map_err(|why| {
                    (
                        codes::E0203,
                        format!(
                            "illegal tail strategy {:?} for `{}` in stage {} of `{}`: {}",
                            tail, old, stage, func.name, why
                        ),
                    )
                })?;
                let tail = tail.resolve(d.is_rvar, is_update);
                dims.insert(
                    i,
                    Dim {
                        var: outer.clone(),
                        for_type: ForType::Serial,
                        is_rvar: d.is_rvar,
                        sources: d.sources.clone(),
                    },
                );
                dims.insert(
                    i,
                    Dim {
                        var: inner.clone(),
                        for_type: ForType::Serial,
                        is_rvar: d.is_rvar,
                        sources: d.sources,
                    },
                );
                splits.push(SplitRecord::Split {
                    old: old.clone(),
                    outer: outer.clone(),
                    inner: inner.clone(),
                    factor: *factor,
                    tail,
                });
            }
            LoopTransform::Fuse {
                inner,
                outer,
                fused,
            } => {
                let i = dims.iter().position(|d| &d.var == inner).ok_or_else(|| unknown(inner))?;
                let o = dims.iter().position(|d| &d.var == outer).ok_or_else(|| unknown(outer))?;
                if o != i + 1 {
                    return Err((
                        codes::E0205,
                        format!(
                            "cannot fuse `{}` and `{}` in `{}`: `{}` must be immediately outside `{}`",
                            inner, outer, func.name, outer, inner
                        ),
                    ));
                }
                fresh(fused, &mut seen)?;
                let od = dims.remove(o);
                let id = dims.remove(i);
                dims.insert(
                    i,
                    Dim {
                        var: fused.clone(),
                        for_type: ForType::Serial,
                        is_rvar: id.is_rvar || od.is_rvar,
                        sources: id.sources.union(&od.sources).cloned().collect(),
                    },
                );
                splits.push(SplitRecord::Fuse {
                    inner: inner.clone(),
                    outer: outer.clone(),
                    fused: fused.clone(),
                });
            }
            LoopTransform::Rename { old, new } => {
                let i = dims.iter().position(|d| &d.var == old).ok_or_else(|| unknown(old))?;
                fresh(new, &mut seen)?;
                dims[i].var = new.clone();
                splits.push(SplitRecord::Rename {
                    old: old.clone(),
                    new: new.clone(),
                });
            }
            LoopTransform::Reorder(vars) => {
                let mut positions = Vec::with_capacity(vars.len());
                for v in vars {
                    positions.push(dims.iter().position(|d| &d.var == v).ok_or_else(|| unknown(v))?);
                }
                let distinct: BTreeSet<usize> = positions.iter().copied().collect();
                if distinct.len() != positions.len() {
                    return Err((
                        codes::E0205,
                        format!("reorder in `{}` lists a loop twice", func.name),
                    ));
                }
                let rvar_order = |dims: &[Dim]| -> Vec<String> {
                    dims.iter().filter(|d| d.is_rvar).map(|d| d.var.clone()).collect()
                };
                let before = rvar_order(&dims);
                let picked: Vec<Dim> = positions.iter().map(|&p| dims[p].clone()).collect();
                let mut slots = positions.clone();
                slots.sort_unstable();
                for (slot, d) in slots.into_iter().zip(picked) {
                    dims[slot] = d;
                }
                let relaxed = def.schedule.atomic.is_some() || def.schedule.allow_race_conditions;
                if !relaxed && rvar_order(&dims) != before {
                    return Err((
                        codes::E0205,
                        format!(
                            "reorder in stage {} of `{}` changes the order of reduction loops",
                            stage, func.name
                        ),
                    ));
                }
            }
            LoopTransform::Mark { var, for_type } => {
                let d = dims
                    .iter_mut()
                    .find(|d| &d.var == var)
                    .ok_or_else(|| unknown(var))?;
                d.for_type = *for_type;
            }
        }
    }

    Ok(StageLoops {
        dims,
        splits,
        is_update,
    })
}

// ── Internal context ────────────────────────────────────────────────────────

struct ScheduleCtx<'a> {
    pipeline: &'a Pipeline,
    loops: StageLoopMap,
    diagnostics: Vec<Diagnostic>,
    cert: ScheduleCert,
}

impl<'a> ScheduleCtx<'a> {
    fn new(pipeline: &'a Pipeline) -> Self {
        ScheduleCtx {
            pipeline,
            loops: BTreeMap::new(),
            diagnostics: Vec::new(),
            cert: ScheduleCert {
                s1_levels_resolve: true,
                s2_store_encloses_compute: true,
                s3_tails_legal: true,
                s4_gpu_nesting: true,
                s5_transforms_valid: true,
                s6_outputs_valid: true,
            },
        }
    }

    fn error(&mut self, code: DiagCode, site: Site, message: String) {
        match code.0 {
            "E0200" => self.cert.s2_store_encloses_compute = false,
            "E0202" => self.cert.s1_levels_resolve = false,
            "E0203" => self.cert.s3_tails_legal = false,
            "E0206" => self.cert.s4_gpu_nesting = false,
            _ => self.cert.s5_transforms_valid = false,
        }
        self.diagnostics.push(Diagnostic::error(code, site, message));
    }

    fn output_error(&mut self, site: Site, message: String) {
        self.cert.s6_outputs_valid = false;
        self.diagnostics
            .push(Diagnostic::error(codes::E0205, site, message));
    }

    fn build_result(self) -> ScheduleResult {
        ScheduleResult {
            loops: self.loops,
            cert: self.cert,
            diagnostics: self.diagnostics,
        }
    }

    fn effective_level(&self, func: &Func) -> LoopLevel {
        effective_compute_level(self.pipeline, func)
    }

    // ── Loop transforms ─────────────────────────────────────────────────

    fn apply_all(&mut self) {
        let pipeline = self.pipeline;
        for func in &pipeline.funcs {
            if !matches!(func.kind, FuncKind::Computed) {
                continue;
            }
            if self.effective_level(func) == LoopLevel::Inlined {
                if func.definitions.len() > 1 {
                    self.error(
                        codes::E0205,
                        Site::func(&func.name),
                        format!(
                            "`{}` has update definitions and cannot be inlined",
                            func.name
                        ),
                    );
                }
                continue;
            }
            for stage in 0..func.definitions.len() {
                match stage_loops(func, stage) {
                    Ok(loops) => {
                        self.check_gpu_nesting(func, stage, &loops);
                        self.loops.insert((func.name.clone(), stage), loops);
                    }
                    Err((code, msg)) => self.error(code, Site::stage(&func.name, stage), msg),
                }
            }
        }
    }

    fn check_gpu_nesting(&mut self, func: &Func, stage: usize, loops: &StageLoops) {
        for (i, d) in loops.dims.iter().enumerate() {
            if d.for_type != ForType::GpuThread {
                continue;
            }
            let has_block_outside = loops.dims[i + 1..]
                .iter()
                .any(|o| o.for_type == ForType::GpuBlock);
            let block_inside = loops.dims[..i]
                .iter()
                .any(|o| o.for_type == ForType::GpuBlock);
            if !has_block_outside || block_inside {
                self.error(
                    codes::E0206,
                    Site::stage(&func.name, stage),
                    format!(
                        "GPU thread loop `{}` of `{}` must be nested inside GPU block loops",
                        d.var, func.name
                    ),
                );
                return;
            }
        }
    }

    // ── Loop levels ─────────────────────────────────────────────────────

    fn check_levels(&mut self) {
        let pipeline = self.pipeline;
        for func in &pipeline.funcs {
            if !matches!(func.kind, FuncKind::Computed) {
                continue;
            }
            let compute = self.effective_level(func);
            if compute == LoopLevel::Inlined {
                continue;
            }
            let store = effective_store_level(self.pipeline, func);
            self.check_level_target(func, &compute, "compute_at");
            self.check_level_target(func, &store, "store_at");
            match (&store, &compute) {
                (LoopLevel::Inlined, _) => self.error(
                    codes::E0200,
                    Site::func(&func.name),
                    format!("`{}` is computed at {} but stored inline", func.name, compute),
                ),
                (LoopLevel::At { .. }, LoopLevel::Root) => self.error(
                    codes::E0200,
                    Site::func(&func.name),
                    format!(
                        "`{}` is stored at {} but computed at root, outside its storage",
                        func.name, store
                    ),
                ),
                (
                    LoopLevel::At {
                        func: sf,
                        stage: ss,
                        var: sv,
                    },
                    LoopLevel::At {
                        func: cf,
                        stage: cs,
                        var: cv,
                    },
                ) if sf == cf && ss == cs => {
                    let loops = self.loops.get(&(cf.clone(), *cs));
                    let sp = loops.and_then(|l| l.position(sv));
                    let cp = loops.and_then(|l| l.position(cv));
                    if let (Some(sp), Some(cp)) = (sp, cp) {
                        if sp < cp {
                            self.error(
                                codes::E0200,
                                Site::func(&func.name),
                                format!(
                                    "`{}` is stored at {} which is inside its compute level {}",
                                    func.name, store, compute
                                ),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn check_level_target(&mut self, func: &Func, level: &LoopLevel, what: &str) {
        let LoopLevel::At {
            func: target,
            stage,
            var,
        } = level
        else {
            return;
        };
        let msg = if target == &func.name {
            Some(format!("`{}` cannot be {} its own loop", func.name, what))
        } else {
            match self.pipeline.func(target) {
                None => Some(format!(
                    "`{}` is {} `{}`, which does not exist",
                    func.name, what, target
                )),
                Some(t) if self.effective_level(t) == LoopLevel::Inlined => Some(format!(
                    "`{}` is {} `{}`, which is inlined and has no loops",
                    func.name, what, target
                )),
                Some(_) => match self.loops.get(&(target.clone(), *stage)) {
                    Some(l) if l.dim(var).is_some() => None,
                    Some(_) => Some(format!(
                        "`{}` is {} {}, but stage {} of `{}` has no loop `{}`",
                        func.name, what, level, stage, target, var
                    )),
                    None => Some(format!(
                        "`{}` is {} {}, but `{}` has no stage {}",
                        func.name, what, level, target, stage
                    )),
                },
            }
        };
        if let Some(msg) = msg {
            self.error(codes::E0202, Site::func(&func.name), msg);
        }
    }

    // ── Outputs ─────────────────────────────────────────────────────────

    fn check_outputs(&mut self) {
        if self.pipeline.outputs.is_empty() {
            self.output_error(Site::Pipeline, "pipeline requests no outputs".to_string());
        }
        let pipeline = self.pipeline;
        for out in &pipeline.outputs {
            let msg = match pipeline.func(&out.func) {
                None => Some(format!("output `{}` does not exist", out.func)),
                Some(f) if !matches!(f.kind, FuncKind::Computed) => {
                    Some(format!("output `{}` is an input image", out.func))
                }
                Some(f) if f.definitions.is_empty() => {
                    Some(format!("output `{}` has no definition", out.func))
                }
                Some(f) if f.args.len() != out.mins.len() || f.args.len() != out.extents.len() => {
                    Some(format!(
                        "output `{}` has {} dimensions but the request has {}",
                        out.func,
                        f.args.len(),
                        out.mins.len()
                    ))
                }
                Some(_) if out.extents.iter().any(|e| *e < 1) => Some(format!(
                    "output `{}` requests an empty region",
                    out.func
                )),
                Some(_) => None,
            };
            if let Some(msg) = msg {
                self.output_error(Site::func(&out.func), msg);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{var, Expr};
    use crate::func::{Func, Pipeline, RDom};
    use crate::pass::StageCert;

    fn simple(f: Func) -> Pipeline {
        let name = f.name.clone();
        Pipeline::new().with_func(f).output(&name, &[0, 0], &[16, 16])
    }

    #[test]
    fn split_replaces_dim_with_inner_and_outer() {
        let f = Func::new("f", &["x", "y"])
            .define(var("x") + var("y"))
            .stage(0, |s| s.split("x", "xo", "xi", 8, TailStrategy::Auto));
        let loops = stage_loops(&f, 0).unwrap_or_else(|e| panic!("{:?}", e));
        let names: Vec<&str> = loops.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(names, vec!["xi", "xo", "y"]);
        assert!(matches!(
            loops.splits[0],
            SplitRecord::Split {
                tail: TailStrategy::ShiftInwards,
                ..
            }
        ));
    }

    #[test]
    fn tile_reorders_inner_loops_inside() {
        let f = Func::new("f", &["x", "y"]).define(var("x")).stage(0, |s| {
            s.tile("x", "y", "xo", "yo", "xi", "yi", 4, 4, TailStrategy::RoundUp)
        });
        let loops = stage_loops(&f, 0).unwrap_or_else(|e| panic!("{:?}", e));
        let names: Vec<&str> = loops.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(names, vec!["xi", "yi", "xo", "yo"]);
    }

    #[test]
    fn fuse_requires_adjacent_loops() {
        let f = Func::new("f", &["x", "y", "z"])
            .define(var("x"))
            .stage(0, |s| s.fuse("x", "z", "xz"));
        assert!(stage_loops(&f, 0).is_err());
        let f = Func::new("f", &["x", "y"])
            .define(var("x"))
            .stage(0, |s| s.fuse("x", "y", "xy").parallel("xy"));
        let loops = stage_loops(&f, 0).unwrap_or_else(|e| panic!("{:?}", e));
        assert_eq!(loops.dims.len(), 1);
        assert_eq!(loops.dims[0].for_type, ForType::Parallel);
        assert_eq!(loops.dims[0].sources.len(), 2);
    }

    #[test]
    fn update_dims_put_rvars_innermost() {
        let r = RDom::new(&[("r", 0, 10)]);
        let f = Func::new("f", &["x"])
            .define(0)
            .update_over(r, vec![var("x")], vec![var("x") + var("r")]);
        let loops = stage_loops(&f, 1).unwrap_or_else(|e| panic!("{:?}", e));
        let names: Vec<&str> = loops.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(names, vec!["r", "x"]);
        assert!(loops.dims[0].is_rvar);
        assert!(loops.is_update);
    }

    #[test]
    fn illegal_tails_rejected() {
        let r = RDom::new(&[("r", 0, 10)]);
        let f = Func::new("f", &["x"])
            .define(0)
            .update_over(r, vec![var("r")], vec![Expr::from(1)])
            .stage(1, |s| s.split("r", "ro", "ri", 4, TailStrategy::RoundUp));
        let err = stage_loops(&f, 1).err().map(|e| e.0);
        assert_eq!(err, Some(codes::E0203));

        let f = Func::new("f", &["x"])
            .define(0)
            .update(vec![var("x")], vec![Expr::from(1)])
            .stage(1, |s| s.split("x", "xo", "xi", 4, TailStrategy::ShiftInwards));
        let err = stage_loops(&f, 1).err().map(|e| e.0);
        assert_eq!(err, Some(codes::E0203));
    }

    #[test]
    fn reordering_rvars_needs_atomic() {
        let r = RDom::new(&[("rx", 0, 4), ("ry", 0, 4)]);
        let f = Func::new("f", &["x"])
            .define(0)
            .update_over(r.clone(), vec![var("rx")], vec![Expr::from(1)])
            .stage(1, |s| s.reorder(&["ry", "rx"]));
        assert!(stage_loops(&f, 1).is_err());
        let f = Func::new("f", &["x"])
            .define(0)
            .update_over(r, vec![var("rx")], vec![Expr::from(1)])
            .stage(1, |s| s.reorder(&["ry", "rx"]).atomic(false));
        assert!(stage_loops(&f, 1).is_ok());
    }

    #[test]
    fn compute_at_missing_loop() {
        let g = Func::new("g", &["x"]).define(var("x")).compute_at("f", "nope");
        let f = Func::new("f", &["x", "y"]).define(g.call([var("x")]));
        let p = simple(f).with_func(g);
        let result = check_schedules(&p);
        assert!(!result.cert.all_pass());
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0202)));
    }

    #[test]
    fn store_inside_compute_rejected() {
        let g = Func::new("g", &["x"])
            .define(var("x"))
            .compute_at("f", "y")
            .store_at("f", "x");
        let f = Func::new("f", &["x", "y"]).define(g.call([var("x")]));
        let p = simple(f).with_func(g);
        let result = check_schedules(&p);
        assert!(!result.cert.s2_store_encloses_compute);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0200));
    }

    #[test]
    fn gpu_threads_need_blocks() {
        let f = Func::new("f", &["x", "y"])
            .define(var("x"))
            .stage(0, |s| s.gpu_threads("x"));
        let result = check_schedules(&simple(f));
        assert!(!result.cert.s4_gpu_nesting);
        let f = Func::new("f", &["x", "y"])
            .define(var("x"))
            .stage(0, |s| s.gpu_threads("x").gpu_blocks("y"));
        let result = check_schedules(&simple(f));
        assert!(result.cert.all_pass(), "{:?}", result.diagnostics);
    }

    #[test]
    fn inline_with_updates_rejected() {
        let g = Func::new("g", &["x"])
            .define(0)
            .update(vec![var("x")], vec![Expr::from(1)]);
        let f = Func::new("f", &["x", "y"]).define(g.call([var("x")]));
        let result = check_schedules(&simple(f).with_func(g));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0205)));
    }

    #[test]
    fn bad_output_request() {
        let f = Func::new("f", &["x"]).define(var("x"));
        let p = Pipeline::new().with_func(f).output("f", &[0, 0], &[4, 4]);
        let result = check_schedules(&p);
        assert!(!result.cert.s6_outputs_valid);
    }
}
