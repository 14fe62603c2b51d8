// lower.rs — Loop-nest synthesis
//
// Builds the loop nest of a scheduled pipeline. Funcs are injected in
// reverse realization order: each Func's produce block (one loop nest per
// stage) goes at its compute level inside the already-built consumers,
// and its Realize goes at its store level. Regions are inferred from the
// code that is already in place, so a Func computed at an inner loop only
// computes what one iteration of that loop needs.
//
// Preconditions: `pipeline` passed graph and schedule checks and has been
//                inlined; `order` is its realization order.
// Postconditions: on success every non-input Func in `order` has one
//                 Realize, one Produce and every stage in `NestBuilt`.
//                 Bound variables `f.s{k}.{v}.min/max` are defined just
//                 outside the Produce of `f`, the last stage outermost.
// Failure modes: unbounded required regions (E0100), uses outside the
//                compute level (E0201), storage inside compute (E0200),
//                non-constant vector/unroll extents (E0204).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, trace};

use crate::bounds::{boxes_touched, BoundsCtx, Interval, Region, Scope};
use crate::diag::{codes, Diagnostic, Site};
use crate::error::LowerError;
use crate::expr::{self, all_of, Expr};
use crate::func::{Func, Pipeline};
use crate::region::apply_declared_bounds;
use crate::nest::{
    For, ForType, LoopNest, OutputRegion, Produce, Provide, Realize, Stmt, StorageDim,
    StorageReduction,
};
use crate::schedule::{
    effective_compute_level, effective_store_level, loop_name, stage_loops, SplitRecord,
    TailStrategy,
};
use crate::simplify::simplify;

// ── Output types ────────────────────────────────────────────────────────────

/// Progress of one stage through synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StageState {
    Unscheduled,
    BoxComputed,
    Injected,
    NestBuilt,
}

#[derive(Debug)]
pub struct SynthesisResult {
    pub nest: LoopNest,
    pub stage_states: BTreeMap<(String, usize), StageState>,
    /// Region each stage computes, symbolic in the loops enclosing its
    /// compute level.
    pub stage_boxes: BTreeMap<(String, usize), Region>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Name of the let holding the lower bound of `var` in stage `stage`.
pub fn bound_min_name(func: &str, stage: usize, var: &str) -> String {
    format!("{}.min", loop_name(func, stage, var))
}

pub fn bound_max_name(func: &str, stage: usize, var: &str) -> String {
    format!("{}.max", loop_name(func, stage, var))
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Build the loop nest for `pipeline`, realizing Funcs in `order`.
pub fn build_loop_nest(pipeline: &Pipeline, order: &[String]) -> SynthesisResult {
    let mut ctx = SynthCtx::new(pipeline);
    let mut body = Stmt::no_op();
    for name in order.iter().rev() {
        let Some(func) = pipeline.func(name) else {
            continue;
        };
        if func.is_input() {
            continue;
        }
        match ctx.inject(func, body) {
            Ok(next) => body = next,
            Err(errors) => {
                // Widened bounds are often the cause of the error.
                ctx.report_overflows();
                ctx.diagnostics.extend(errors);
                return ctx.build_result(Stmt::no_op());
            }
        }
    }
    ctx.report_overflows();
    ctx.build_result(body)
}

// ── Internal context ────────────────────────────────────────────────────────

struct SynthCtx<'a> {
    pipeline: &'a Pipeline,
    bounds: BoundsCtx,
    states: BTreeMap<(String, usize), StageState>,
    boxes: BTreeMap<(String, usize), Region>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> SynthCtx<'a> {
    fn new(pipeline: &'a Pipeline) -> Self {
        SynthCtx {
            pipeline,
            bounds: BoundsCtx::for_pipeline(pipeline),
            states: BTreeMap::new(),
            boxes: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn build_result(self, body: Stmt) -> SynthesisResult {
        let outputs = self
            .pipeline
            .outputs
            .iter()
            .map(|o| OutputRegion {
                func: o.func.clone(),
                mins: o.mins.clone(),
                extents: o.extents.clone(),
            })
            .collect();
        SynthesisResult {
            nest: LoopNest { body, outputs },
            stage_states: self.states,
            stage_boxes: self.boxes,
            diagnostics: self.diagnostics,
        }
    }

    fn advance(&mut self, func: &Func, state: StageState) {
        for k in 0..func.num_stages() {
            let entry = self
                .states
                .entry((func.name.clone(), k))
                .or_insert(StageState::Unscheduled);
            debug_assert!(*entry <= state, "stage state moved backwards");
            *entry = state;
        }
    }

    fn report_overflows(&mut self) {
        let mut seen = BTreeSet::new();
        for e in std::mem::take(&mut self.bounds.overflows) {
            let text = e.to_string();
            if seen.insert(text.clone()) {
                self.diagnostics.push(Diagnostic::warning(
                    codes::W0100,
                    Site::Pipeline,
                    format!(
                        "bounds of `{}` may overflow {}; widened to unbounded",
                        text,
                        e.ty()
                    ),
                ));
            }
        }
    }

    // ── Injection ───────────────────────────────────────────────────────

    /// Inject `func` into `body`, which already holds all its consumers.
    fn inject(&mut self, func: &Func, body: Stmt) -> Result<Stmt, Vec<Diagnostic>> {
        self.advance(func, StageState::Unscheduled);
        let name = func.name.clone();
        let compute = effective_compute_level(self.pipeline, func);
        let compute_loop = compute.loop_name();
        let site_body = match &compute_loop {
            None => &body,
            Some(l) => {
                let outside = body.calls_func_outside_loop(l, &name);
                match body.find_loop(l) {
                    Some(lp) if !outside => &*lp.body,
                    _ => {
                        return Err(vec![LowerError::UsedOutsideComputeLevel {
                            func: name,
                            level: compute.to_string(),
                        }
                        .into()])
                    }
                }
            }
        };

        // Region the consumers need at the compute level.
        let funcs: BTreeSet<String> = [name.clone()].into_iter().collect();
        let touched = boxes_touched(site_body, &funcs, &mut Scope::new(), &mut self.bounds);
        let mut required = touched.region(&name).cloned();
        if let Some(req) = self.pipeline.output_request(&name) {
            let req = Region::from_const(&req.mins, &req.extents);
            required = Some(match required {
                Some(r) => r.union(&req),
                None => req,
            });
        }
        let Some(required) = required else {
            return Err(vec![LowerError::UsedOutsideComputeLevel {
                func: name,
                level: compute.to_string(),
            }
            .into()]);
        };
        let no_uses = Vec::new();
        let uses = touched.unbounded.get(&name).unwrap_or(&no_uses);
        let required = apply_declared_bounds(func, required, uses)?;

        // Each stage covers the required region plus whatever later stages
        // of the same Func touch, so stages are built last to first.
        let n = func.num_stages();
        let mut stage_boxes = vec![required.clone(); n];
        let mut stage_nests = vec![Stmt::no_op(); n];
        let mut acc = required;
        for k in (0..n).rev() {
            stage_boxes[k] = acc.clone();
            let nest = self.stage_nest(func, k, &acc)?;
            if k > 0 {
                let t = boxes_touched(&nest, &funcs, &mut Scope::new(), &mut self.bounds);
                if let Some(r) = t.region(&name) {
                    let uses = t.unbounded.get(&name).unwrap_or(&no_uses);
                    let r = apply_declared_bounds(func, r.clone(), uses)?;
                    acc = acc.union(&r);
                }
            }
            stage_nests[k] = nest;
        }
        for (k, b) in stage_boxes.iter().enumerate() {
            trace!(func = %name, stage = k, region = %b, "stage region");
            self.boxes.insert((name.clone(), k), b.clone());
        }
        self.advance(func, StageState::BoxComputed);

        // Produce block with its bound lets, last stage outermost.
        let mut produce = Stmt::Produce(Produce {
            func: name.clone(),
            is_async: func.schedule.is_async,
            guard: None,
            body: Box::new(Stmt::Block(stage_nests)),
        });
        for (k, b) in stage_boxes.iter().enumerate() {
            for i in func.pure_dims(k).into_iter().rev() {
                let var = &func.args[i];
                let (Some(lo), Some(hi)) = (&b.dims[i].min, &b.dims[i].max) else {
                    continue;
                };
                produce = Stmt::let_stmt(bound_max_name(&name, k, var), hi.clone(), produce);
                produce = Stmt::let_stmt(bound_min_name(&name, k, var), lo.clone(), produce);
            }
        }

        let body = match &compute_loop {
            None => produce.then(body),
            Some(l) => {
                let mut produce = Some(produce);
                let (next, _) = body.map_loop_body(l, &mut |inner| match produce.take() {
                    Some(p) => p.then(inner),
                    None => inner,
                });
                next
            }
        };
        self.advance(func, StageState::Injected);
        debug!(func = %name, level = %compute, "injected produce");

        let body = self.wrap_realize(func, body)?;
        self.advance(func, StageState::NestBuilt);
        Ok(body)
    }

    /// Wrap the store level of `func` in its Realize.
    fn wrap_realize(&mut self, func: &Func, body: Stmt) -> Result<Stmt, Vec<Diagnostic>> {
        let name = func.name.clone();
        let store = effective_store_level(self.pipeline, func);
        let compute = effective_compute_level(self.pipeline, func);
        let misplaced = || -> Vec<Diagnostic> {
            vec![LowerError::ComputeOutsideStore {
                func: func.name.clone(),
                store: store.to_string(),
                compute: compute.to_string(),
            }
            .into()]
        };
        let store_loop = store.loop_name();
        let store_body = match &store_loop {
            None => &body,
            Some(l) => match body.find_loop(l) {
                Some(lp) if lp.body.find_produce(&name).is_some() => &*lp.body,
                _ => return Err(misplaced()),
            },
        };

        let funcs: BTreeSet<String> = [name.clone()].into_iter().collect();
        let touched = boxes_touched(store_body, &funcs, &mut Scope::new(), &mut self.bounds);
        let mut region = touched
            .region(&name)
            .cloned()
            .unwrap_or_else(|| Region::new(vec![Interval::everything(); func.args.len()]));
        if let Some(req) = self.pipeline.output_request(&name) {
            region = region.union(&Region::from_const(&req.mins, &req.extents));
        }
        let no_uses = Vec::new();
        let uses = touched.unbounded.get(&name).unwrap_or(&no_uses);
        let region = apply_declared_bounds(func, region, uses)?;

        let dims: Vec<StorageDim> = region
            .dims
            .iter()
            .map(|iv| StorageDim {
                min: iv.min.clone().unwrap_or(Expr::Int(0)),
                extent: iv.extent().unwrap_or(Expr::Int(0)),
                alloc_extent: None,
                reduction: StorageReduction::None,
            })
            .collect();
        let storage_order = storage_order(func);
        let mut realize = |inner: Stmt| {
            Stmt::Realize(Realize {
                func: name.clone(),
                types: func.types.clone(),
                dims: dims.clone(),
                storage_order: storage_order.clone(),
                memoize: func.schedule.memoize,
                body: Box::new(inner),
            })
        };
        let out = match &store_loop {
            None => realize(body),
            Some(l) => body.map_loop_body(l, &mut realize).0,
        };
        debug!(func = %name, level = %store, region = %region, "realized");
        Ok(out)
    }

    // ── Stage loop nests ────────────────────────────────────────────────

    /// Loops and store of stage `k` of `func`, with split lets and tail
    /// handling around the store. Dimensions whose box is constant get
    /// constant loop bounds; the rest read the stage's bound lets.
    fn stage_nest(&self, func: &Func, k: usize, stage_box: &Region) -> Result<Stmt, Vec<Diagnostic>> {
        let def = &func.definitions[k];
        let loops = stage_loops(func, k)
            .map_err(|(code, msg)| vec![Diagnostic::error(code, Site::stage(&func.name, k), msg)])?;
        let name = &func.name;
        let q = |v: &str| loop_name(name, k, v);

        let qualify: BTreeMap<String, Expr> = func
            .stage_vars(k)
            .into_iter()
            .map(|(v, _)| (v.clone(), Expr::Var(q(&v))))
            .collect();

        // (min, extent) of every loop variable.
        let mut ranges: BTreeMap<String, (Expr, Expr)> = BTreeMap::new();
        for i in func.pure_dims(k) {
            let v = &func.args[i];
            let dim = stage_box.dims.get(i);
            let lo = dim.and_then(|d| d.min.as_ref()).filter(|e| e.is_const()).cloned();
            let lo = lo.unwrap_or_else(|| Expr::Var(bound_min_name(name, k, v)));
            let extent = dim.and_then(|d| d.extent()).filter(|e| e.is_const());
            let extent = extent.unwrap_or_else(|| {
                let hi = Expr::Var(bound_max_name(name, k, v));
                simplify(&(hi - Expr::Var(bound_min_name(name, k, v)) + 1))
            });
            ranges.insert(v.clone(), (lo, extent));
        }
        if let Some(rdom) = &def.rdom {
            for r in &rdom.vars {
                ranges.insert(
                    r.name.clone(),
                    (
                        simplify(&r.min.substitute(&qualify)),
                        simplify(&r.extent.substitute(&qualify)),
                    ),
                );
            }
        }

        let mut lets: Vec<(String, Expr)> = Vec::new();
        let mut guards: Vec<Expr> = Vec::new();
        let mut load_preds: Vec<Expr> = Vec::new();
        let mut store_preds: Vec<Expr> = Vec::new();
        for split in &loops.splits {
            match split {
                SplitRecord::Split {
                    old,
                    outer,
                    inner,
                    factor,
                    tail,
                } => {
                    let (om, oe) = ranges.remove(old).unwrap_or((Expr::Int(0), Expr::Int(1)));
                    let f = *factor;
                    ranges.insert(outer.clone(), (Expr::Int(0), simplify(&((&oe + (f - 1)) / f))));
                    ranges.insert(inner.clone(), (Expr::Int(0), Expr::Int(f)));
                    let exact = oe.as_int().is_some_and(|e| e % f == 0);
                    let mut base = Expr::Var(q(outer)) * f + om.clone();
                    if tail.is_shift_inwards() && !exact {
                        base = expr::min(base, &om + &oe - f);
                    }
                    lets.push((q(old), simplify(&(base + Expr::Var(q(inner))))));
                    if exact {
                        continue;
                    }
                    let old_v = Expr::Var(q(old));
                    let last = simplify(&(&om + &oe - 1));
                    match tail {
                        TailStrategy::GuardWithIf => guards.push(expr::le(old_v, last)),
                        TailStrategy::Predicate | TailStrategy::PredicateLoads => {
                            load_preds.push(expr::le(old_v, last))
                        }
                        TailStrategy::PredicateStores | TailStrategy::RoundUpAndBlend => {
                            store_preds.push(expr::le(old_v, last))
                        }
                        TailStrategy::ShiftInwardsAndBlend => store_preds.push(expr::and(
                            expr::le(om.clone(), old_v.clone()),
                            expr::le(old_v, last),
                        )),
                        TailStrategy::RoundUp | TailStrategy::ShiftInwards | TailStrategy::Auto => {}
                    }
                }
                SplitRecord::Fuse {
                    inner,
                    outer,
                    fused,
                } => {
                    let (im, ie) = ranges.remove(inner).unwrap_or((Expr::Int(0), Expr::Int(1)));
                    let (om, oe) = ranges.remove(outer).unwrap_or((Expr::Int(0), Expr::Int(1)));
                    let fv = Expr::Var(q(fused));
                    ranges.insert(fused.clone(), (Expr::Int(0), simplify(&(&ie * &oe))));
                    lets.push((q(inner), simplify(&(fv.clone() % ie.clone() + im))));
                    lets.push((q(outer), simplify(&(fv / ie + om))));
                }
                SplitRecord::Rename { old, new } => {
                    if let Some(range) = ranges.remove(old) {
                        ranges.insert(new.clone(), range);
                    }
                    lets.push((q(old), Expr::Var(q(new))));
                }
            }
        }

        let args: Vec<Expr> = def.args.iter().map(|a| a.substitute(&qualify)).collect();
        let values: Vec<Expr> = def.values.iter().map(|v| v.substitute(&qualify)).collect();
        let (predicate, predicate_loads) = if !load_preds.is_empty() {
            load_preds.extend(store_preds);
            (Some(all_of(load_preds)), true)
        } else if !store_preds.is_empty() {
            (Some(all_of(store_preds)), false)
        } else {
            (None, false)
        };
        let mut stmt = Stmt::Provide(Provide {
            func: name.clone(),
            stage: k,
            args,
            values,
            predicate,
            predicate_loads,
        });
        if let Some(rdom) = &def.rdom {
            if !rdom.predicates.is_empty() {
                let cond = all_of(rdom.predicates.iter().map(|p| p.substitute(&qualify)));
                stmt = Stmt::if_then(cond, stmt);
            }
        }
        if !guards.is_empty() {
            stmt = Stmt::if_then(all_of(guards), stmt);
        }
        for (var, value) in lets {
            stmt = Stmt::let_stmt(var, value, stmt);
        }

        for d in &loops.dims {
            let (min, extent) = ranges
                .get(&d.var)
                .cloned()
                .unwrap_or((Expr::Int(0), Expr::Int(1)));
            let kind = match d.for_type {
                ForType::Vectorized => Some("vectorized"),
                ForType::Unrolled => Some("unrolled"),
                _ => None,
            };
            if let Some(kind) = kind {
                if extent.as_int().is_none() {
                    return Err(vec![LowerError::NonConstantExtent {
                        func: name.clone(),
                        stage: k,
                        loop_name: q(&d.var),
                        kind,
                        extent: extent.to_string(),
                    }
                    .into()]);
                }
            }
            stmt = Stmt::For(For {
                name: q(&d.var),
                min,
                extent,
                for_type: d.for_type,
                body: Box::new(stmt),
            });
        }
        Ok(stmt)
    }
}

/// Storage order as dimension indices, innermost first.
fn storage_order(func: &Func) -> Vec<usize> {
    let mut order: Vec<usize> = Vec::new();
    if let Some(vars) = &func.schedule.storage_order {
        for v in vars {
            if let Some(i) = func.args.iter().position(|a| a == v) {
                if !order.contains(&i) {
                    order.push(i);
                }
            }
        }
    }
    for i in 0..func.args.len() {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    order
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{self, var, ScalarType};
    use crate::func::RDom;
    use crate::schedule::TailStrategy;

    fn blur() -> (Func, Func, Func) {
        let input = Func::input("in", ScalarType::I32, &[-1], &[20]);
        let g = Func::new("g", &["x"]).define(input.call([var("x")]) * 2);
        let out = Func::new("out", &["x"])
            .define(g.call([var("x") - 1]) + g.call([var("x") + 1]));
        (input, g, out)
    }

    fn lower(p: &Pipeline, order: &[&str]) -> SynthesisResult {
        let order: Vec<String> = order.iter().map(|s| s.to_string()).collect();
        build_loop_nest(p, &order)
    }

    #[test]
    fn root_producer_covers_consumer_footprint() {
        let (input, g, out) = blur();
        let p = Pipeline::new()
            .with_func(input)
            .with_func(g.compute_root())
            .with_func(out)
            .output("out", &[0], &[10]);
        let result = lower(&p, &["in", "g", "out"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let realize = result.nest.body.find_realize("g").cloned();
        let realize = realize.unwrap_or_else(|| panic!("g not realized"));
        assert_eq!(realize.dims[0].min, Expr::Int(-1));
        assert_eq!(realize.dims[0].extent, Expr::Int(12));
        assert!(result
            .stage_states
            .values()
            .all(|s| *s == StageState::NestBuilt));
    }

    #[test]
    fn compute_at_shrinks_footprint() {
        let (input, g, out) = blur();
        let p = Pipeline::new()
            .with_func(input)
            .with_func(g.compute_at("out", "x"))
            .with_func(out)
            .output("out", &[0], &[10]);
        let result = lower(&p, &["in", "g", "out"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let lp = result.nest.body.find_loop("out.s0.x");
        let lp = lp.unwrap_or_else(|| panic!("no consumer loop"));
        let realize = lp.body.find_realize("g").cloned();
        let realize = realize.unwrap_or_else(|| panic!("g not realized inside out.s0.x"));
        assert_eq!(realize.dims[0].extent, Expr::Int(3));
    }

    #[test]
    fn split_with_guard_emits_if() {
        let f = Func::new("f", &["x"])
            .define(var("x"))
            .stage(0, |s| s.split("x", "xo", "xi", 8, TailStrategy::GuardWithIf));
        let p = Pipeline::new().with_func(f).output("f", &[0], &[13]);
        let result = lower(&p, &["f"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let mut guards = Vec::new();
        result.nest.body.walk(&mut |s| {
            if let Stmt::If { cond, .. } = s {
                guards.push(cond.to_string());
            }
        });
        assert_eq!(guards.len(), 1, "{}", result.nest.body);
        assert!(guards[0].starts_with("(f.s0.x <= "), "{}", guards[0]);
        assert!(result.nest.body.has_loop("f.s0.xo"));
        assert!(result.nest.body.has_loop("f.s0.xi"));
    }

    #[test]
    fn divisible_split_needs_no_tail() {
        let f = Func::new("f", &["x"])
            .define(var("x"))
            .bound("x", 0, 16)
            .stage(0, |s| s.split("x", "xo", "xi", 8, TailStrategy::GuardWithIf));
        let p = Pipeline::new().with_func(f).output("f", &[0], &[16]);
        let result = lower(&p, &["f"]);
        let mut ifs = 0;
        result.nest.body.walk(&mut |s| {
            if matches!(s, Stmt::If { .. }) {
                ifs += 1;
            }
        });
        assert_eq!(ifs, 0, "{}", result.nest.body);
    }

    #[test]
    fn vectorize_needs_constant_extent() {
        let g = Func::new("g", &["x", "y"])
            .define(var("x") + var("y"))
            .compute_at("out", "y")
            .stage(0, |s| s.vectorize("x"));
        let clamped = expr::min(var("x"), expr::param("p", ScalarType::I32));
        let out = Func::new("out", &["x", "y"]).define(g.call([clamped, var("y")]));
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .with_param("p", ScalarType::I32, None)
            .output("out", &[0, 0], &[16, 4]);
        let result = lower(&p, &["g", "out"]);
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.code == Some(codes::E0204));
        let diag = diag.unwrap_or_else(|| panic!("{:?}", result.diagnostics));
        assert!(diag.message.contains("g.s0.x"), "{}", diag.message);

        // A shifted footprint keeps a constant width.
        let g = Func::new("g", &["x", "y"])
            .define(var("x") + var("y"))
            .compute_at("out", "y")
            .stage(0, |s| s.vectorize("x"));
        let shifted = var("x") + expr::param("p", ScalarType::I32);
        let out = Func::new("out", &["x", "y"]).define(g.call([shifted, var("y")]));
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .with_param("p", ScalarType::I32, None)
            .output("out", &[0, 0], &[16, 4]);
        let result = lower(&p, &["g", "out"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn data_dependent_index_without_bound_is_fatal() {
        let input = Func::input("in", ScalarType::I32, &[0], &[10]);
        let lut = Func::new("lut", &["i"]).define(var("i") * var("i")).compute_root();
        let out = Func::new("out", &["x"]).define(lut.call([input.call([var("x")])]));
        let p = Pipeline::new()
            .with_func(input)
            .with_func(lut.clone())
            .with_func(out.clone())
            .output("out", &[0], &[10]);
        let result = lower(&p, &["in", "lut", "out"]);
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.code == Some(codes::E0100));
        let diag = diag.unwrap_or_else(|| panic!("{:?}", result.diagnostics));
        assert!(diag.message.contains("out.s0"), "{}", diag.message);
        assert!(result.nest.body.is_no_op());

        let p = Pipeline::new()
            .with_func(Func::input("in", ScalarType::I32, &[0], &[10]))
            .with_func(lut.bound("i", 0, 256))
            .with_func(out)
            .output("out", &[0], &[10]);
        let result = lower(&p, &["in", "lut", "out"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn update_stage_lets_are_outermost() {
        let r = RDom::new(&[("r", 0, 4)]);
        let f = Func::new("f", &["x"])
            .define(0)
            .update_over(r, vec![var("r") + 20], vec![Expr::from(1)]);
        let p = Pipeline::new().with_func(f).output("f", &[0], &[8]);
        let result = lower(&p, &["f"]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        // The pure stage must also cover what the update writes.
        let b0 = &result.stage_boxes[&("f".to_string(), 0)];
        assert_eq!(b0.dims[0].max, Some(Expr::Int(23)));
        let realize = result.nest.body.find_realize("f").cloned();
        let realize = realize.unwrap_or_else(|| panic!("f not realized"));
        assert_eq!(realize.dims[0].extent, Expr::Int(24));
    }

    #[test]
    fn use_outside_compute_level_rejected() {
        let (input, g, _) = blur();
        let other = Func::new("other", &["x"]).define(g.call([var("x")]));
        let out = Func::new("out", &["x"]).define(g.call([var("x")]) + other.call([var("x")]));
        let p = Pipeline::new()
            .with_func(input)
            .with_func(g.compute_at("other", "x"))
            .with_func(other.compute_root())
            .with_func(out)
            .output("out", &[0], &[4]);
        let result = lower(&p, &["in", "g", "other", "out"]);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0201)));
    }
}
