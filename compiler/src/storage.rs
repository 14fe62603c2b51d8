// storage.rs — Allocation sizing, storage folding and sliding window
//
// Runs over a synthesized loop nest. Every realized dimension gets a
// constant allocation extent. When a Func is stored outside a serial loop
// and computed inside it, the footprint of one loop iteration decides how
// each dimension is stored:
//   - the footprint moves monotonically and successive iterations
//     overlap: circular buffer of a power-of-two factor (`Fold`);
//   - it moves monotonically without overlap: one iteration's window
//     addressed from its moving base (`Window`);
//   - otherwise: full extent.
// Sliding window shrinks the produced region of an overlapping, increasing
// (or decreasing) footprint to the values the previous iteration did not
// produce.
//
// Preconditions: `nest` comes from `build_loop_nest` for `pipeline`.
// Postconditions: every Realize dimension whose extent has a constant
//                 bound gets an allocation extent; a `Fold` factor is
//                 never smaller than the live window.
// Failure modes: explicit folds on non-monotonic footprints (E0300) or
//                with a factor below the live window (E0301).
// Side effects: none.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, trace};

use crate::bounds::{boxes_touched, const_bounds_of_expr, BoundsCtx, Region, Scope};
use crate::diag::Diagnostic;
use crate::error::LowerError;
use crate::expr::{self, Expr};
use crate::func::Pipeline;
use crate::interval::ConstInterval;
use crate::lower::{bound_max_name, bound_min_name};
use crate::monotonic::{is_monotonic, Monotonic};
use crate::nest::{For, ForType, LoopNest, Realize, Stmt, StorageReduction};
use crate::simplify::{const_difference, simplify};

#[derive(Debug, Clone, Copy)]
pub struct StorageOptions {
    pub folding: bool,
    pub sliding_window: bool,
    pub max_fold_factor: i64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            folding: true,
            sliding_window: true,
            max_fold_factor: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StorageChoice {
    Full,
    Fold { factor: i64 },
    Window { extent: i64 },
}

/// How one dimension of one realization is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDecision {
    pub func: String,
    pub dim: usize,
    /// Loop whose iterations move the footprint, if any.
    pub loop_name: Option<String>,
    pub choice: StorageChoice,
    pub sliding: bool,
}

#[derive(Debug)]
pub struct StorageResult {
    pub nest: LoopNest,
    pub decisions: Vec<StorageDecision>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Size and fold every realization in `nest`.
pub fn plan_storage(nest: LoopNest, pipeline: &Pipeline, options: StorageOptions) -> StorageResult {
    let mut ctx = StorageCtx {
        pipeline,
        options,
        bounds: BoundsCtx::for_pipeline(pipeline),
        scope: Scope::new(),
        decisions: Vec::new(),
        diagnostics: Vec::new(),
    };
    let body = ctx.visit(nest.body);
    StorageResult {
        nest: LoopNest {
            body,
            outputs: nest.outputs,
        },
        decisions: ctx.decisions,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct StorageCtx<'a> {
    pipeline: &'a Pipeline,
    options: StorageOptions,
    bounds: BoundsCtx,
    /// Constant ranges of the loops and lets enclosing the current node.
    scope: Scope<ConstInterval>,
    decisions: Vec<StorageDecision>,
    diagnostics: Vec<Diagnostic>,
}

/// Footprint of one Func over one iteration of a loop, in one dimension.
struct Footprint {
    min: Expr,
    max: Expr,
    direction: Monotonic,
}

impl StorageCtx<'_> {
    fn visit(&mut self, s: Stmt) -> Stmt {
        match s {
            Stmt::For(mut l) => {
                let lo = const_bounds_of_expr(&l.min, &self.scope, &mut self.bounds);
                let last = simplify(&(&l.min + &l.extent - 1));
                let hi = const_bounds_of_expr(&last, &self.scope, &mut self.bounds);
                self.scope.push(&l.name, ConstInterval::new(lo.min, hi.max));
                l.body = Box::new(self.visit(*l.body));
                self.scope.pop(&l.name);
                Stmt::For(l)
            }
            Stmt::Let { name, value, body } => {
                let iv = const_bounds_of_expr(&value, &self.scope, &mut self.bounds);
                self.scope.push(&name, iv);
                let body = Box::new(self.visit(*body));
                self.scope.pop(&name);
                Stmt::Let { name, value, body }
            }
            Stmt::Realize(mut r) => {
                r.body = Box::new(self.visit(*r.body));
                self.plan(&mut r);
                Stmt::Realize(r)
            }
            other => other.map_children(&mut |c| self.visit(c)),
        }
    }

    fn plan(&mut self, r: &mut Realize) {
        for d in &mut r.dims {
            let ext = const_bounds_of_expr(&d.extent, &self.scope, &mut self.bounds);
            d.alloc_extent = ext.max.map(|m| m.max(1));
        }
        let Some(func) = self.pipeline.func(&r.func) else {
            return;
        };
        let is_output = self.pipeline.is_output(&r.func);
        let loops = loops_to_produce(&r.body, &r.func).unwrap_or_default();
        let mut slides: Vec<(String, Expr, usize, Monotonic)> = Vec::new();

        for i in 0..r.dims.len() {
            let var = func.args.get(i).cloned().unwrap_or_default();
            let explicit = func.schedule.folds.iter().find(|f| f.var == var).map(|f| f.factor);
            let driver = loops
                .iter()
                .find_map(|l| self.footprint(l, &r.func, i).map(|fp| (*l, fp)));
            let alloc = r.dims[i].alloc_extent;

            let (loop_name, choice, base) = match &driver {
                None => {
                    if let (Some(factor), Some(alloc)) = (explicit, alloc) {
                        if factor < alloc {
                            self.fail(LowerError::FoldFactorTooSmall {
                                func: r.func.clone(),
                                var,
                                factor,
                                needed: alloc,
                            });
                            continue;
                        }
                    }
                    let choice = match explicit {
                        Some(factor) => StorageChoice::Fold { factor },
                        None => StorageChoice::Full,
                    };
                    (None, choice, None)
                }
                Some((lp, fp)) => {
                    let reject = |reason: &str| LowerError::NonMonotonicFold {
                        func: r.func.clone(),
                        var: var.clone(),
                        reason: format!("{} `{}`", reason, lp.name),
                    };
                    let problem = if is_output {
                        Some("the Func is an output realized outside")
                    } else if !matches!(lp.for_type, ForType::Serial | ForType::Unrolled) {
                        Some("its footprint moves across the concurrent loop")
                    } else if loops
                        .iter()
                        .take_while(|l| l.name != lp.name)
                        .any(|l| l.for_type.is_parallel())
                    {
                        Some("its storage is shared by the concurrent loop around")
                    } else if r.body.calls_func_outside_loop(&lp.name, &r.func) {
                        Some("it is also read outside the loop")
                    } else if fp.direction == Monotonic::Unknown {
                        Some("its footprint is not monotonic in")
                    } else {
                        None
                    };
                    if let Some(reason) = problem {
                        if explicit.is_some() {
                            self.fail(reject(reason));
                        }
                        trace!(func = %r.func, dim = i, reason, "not folded");
                        self.decisions.push(StorageDecision {
                            func: r.func.clone(),
                            dim: i,
                            loop_name: Some(lp.name.clone()),
                            choice: StorageChoice::Full,
                            sliding: false,
                        });
                        continue;
                    }
                    let window = const_difference(&fp.max, &fp.min)
                        .map(|d| d + 1)
                        .or_else(|| {
                            let w = simplify(&(&fp.max - &fp.min + 1));
                            const_bounds_of_expr(&w, &self.scope, &mut self.bounds).max
                        });
                    let Some(window) = window else {
                        if explicit.is_some() {
                            self.fail(reject("its live window has no constant bound in"));
                        }
                        continue;
                    };
                    let choice = match explicit {
                        Some(factor) if factor < window => {
                            self.fail(LowerError::FoldFactorTooSmall {
                                func: r.func.clone(),
                                var,
                                factor,
                                needed: window,
                            });
                            continue;
                        }
                        Some(factor) => StorageChoice::Fold { factor },
                        None => self.auto_choice(fp, lp, window, alloc),
                    };
                    if matches!(choice, StorageChoice::Fold { .. } | StorageChoice::Full)
                        && self.options.sliding_window
                        && func.num_stages() == 1
                        && !is_output
                        && overlaps(fp, &lp.name)
                        && loops.last().is_some_and(|last| last.name == lp.name)
                        && has_serial_produce_loop(&r.body, &r.func, &var)
                    {
                        slides.push((lp.name.clone(), lp.min.clone(), i, fp.direction));
                    }
                    (Some(lp.name.clone()), choice, Some(fp.min.clone()))
                }
            };

            match &choice {
                StorageChoice::Full => {}
                StorageChoice::Fold { factor } => {
                    r.dims[i].reduction = StorageReduction::Fold { factor: *factor };
                }
                StorageChoice::Window { extent } => {
                    if let Some(base) = base {
                        r.dims[i].reduction = StorageReduction::Window {
                            extent: *extent,
                            base,
                        };
                    }
                }
            }
            debug!(func = %r.func, dim = i, choice = ?choice, "storage");
            let sliding = slides.iter().any(|(_, _, d, _)| *d == i);
            self.decisions.push(StorageDecision {
                func: r.func.clone(),
                dim: i,
                loop_name,
                choice,
                sliding,
            });
        }

        for (loop_name, loop_min, dim, direction) in slides {
            let var = &func.args[dim];
            let body = std::mem::replace(&mut r.body, Box::new(Stmt::no_op()));
            let (body, _) = body.map_loop_body(&loop_name, &mut |inner| {
                slide(inner, &r.func, var, &loop_name, &loop_min, direction)
            });
            r.body = Box::new(body);
            debug!(func = %r.func, dim, loop = %loop_name, "sliding window");
        }
    }

    fn auto_choice(
        &self,
        fp: &Footprint,
        lp: &For,
        window: i64,
        alloc: Option<i64>,
    ) -> StorageChoice {
        if !self.options.folding || fp.direction == Monotonic::Constant {
            return StorageChoice::Full;
        }
        let improves = |n: i64| alloc.map_or(true, |a| n < a);
        if !overlaps(fp, &lp.name) {
            if improves(window) {
                return StorageChoice::Window { extent: window };
            }
            return StorageChoice::Full;
        }
        let factor = next_pow2(window);
        if factor <= self.options.max_fold_factor && improves(factor) {
            StorageChoice::Fold { factor }
        } else {
            StorageChoice::Full
        }
    }

    /// Footprint of `func` in dimension `dim` over one iteration of `lp`,
    /// or `None` if it does not depend on the loop.
    fn footprint(&mut self, lp: &For, func: &str, dim: usize) -> Option<Footprint> {
        let funcs: BTreeSet<String> = [func.to_string()].into_iter().collect();
        let touched = boxes_touched(&lp.body, &funcs, &mut Scope::new(), &mut self.bounds);
        let region: &Region = touched.region(func)?;
        let iv = region.dims.get(dim)?;
        let (min, max) = (iv.min.clone()?, iv.max.clone()?);
        if !min.uses_var(&lp.name) && !max.uses_var(&lp.name) {
            return None;
        }
        let lo = is_monotonic(&min, &lp.name);
        let hi = is_monotonic(&max, &lp.name);
        let direction = match (lo, hi) {
            (Monotonic::Unknown, _) | (_, Monotonic::Unknown) => Monotonic::Unknown,
            (Monotonic::Increasing, Monotonic::Decreasing)
            | (Monotonic::Decreasing, Monotonic::Increasing) => Monotonic::Unknown,
            (Monotonic::Constant, m) | (m, Monotonic::Constant) => m,
            (m, _) => m,
        };
        Some(Footprint {
            min,
            max,
            direction,
        })
    }

    fn fail(&mut self, err: LowerError) {
        self.diagnostics.push(err.into());
    }
}

/// Whether successive iterations of the loop touch overlapping windows.
fn overlaps(fp: &Footprint, loop_var: &str) -> bool {
    let prev = Expr::Var(loop_var.to_string()) - 1;
    match fp.direction {
        Monotonic::Increasing => {
            let prev_max = fp.max.substitute_var(loop_var, &prev);
            !const_difference(&fp.min, &prev_max).is_some_and(|d| d > 0)
        }
        Monotonic::Decreasing => {
            let prev_min = fp.min.substitute_var(loop_var, &prev);
            !const_difference(&prev_min, &fp.max).is_some_and(|d| d > 0)
        }
        _ => true,
    }
}

fn next_pow2(n: i64) -> i64 {
    let mut f = 1;
    while f < n {
        f *= 2;
    }
    f
}

/// Loops between a realization and the produce of `func`, outermost first.
fn loops_to_produce<'s>(s: &'s Stmt, func: &str) -> Option<Vec<&'s For>> {
    match s {
        Stmt::Produce(p) if p.func == func => Some(Vec::new()),
        Stmt::For(l) => {
            let mut inner = loops_to_produce(&l.body, func)?;
            inner.insert(0, l);
            Some(inner)
        }
        _ => s
            .children()
            .into_iter()
            .find_map(|c| loops_to_produce(c, func)),
    }
}

/// Rewrite the bound lets of `func` inside one iteration of `loop_name` so
/// that non-first iterations only produce values the previous one did not.
fn slide(
    s: Stmt,
    func: &str,
    var: &str,
    loop_name: &str,
    loop_min: &Expr,
    direction: Monotonic,
) -> Stmt {
    let min_name = bound_min_name(func, 0, var);
    let max_name = bound_max_name(func, 0, var);
    let Some((min_value, max_value)) = let_values(&s, &min_name, &max_name) else {
        return s;
    };
    let lv = Expr::Var(loop_name.to_string());
    let prev = &lv - 1;
    // The lets sit directly in the loop body, so shifting the loop variable
    // gives the previous iteration's bounds.
    let first = expr::le(lv.clone(), loop_min.clone());
    let (target, value) = match direction {
        Monotonic::Increasing => {
            let prev_max = max_value.substitute_var(loop_name, &prev);
            (
                min_name.clone(),
                expr::select(first, min_value.clone(), expr::max(min_value, prev_max + 1)),
            )
        }
        _ => {
            let prev_min = min_value.substitute_var(loop_name, &prev);
            (
                max_name.clone(),
                expr::select(first, max_value.clone(), expr::min(max_value, prev_min - 1)),
            )
        }
    };
    // The produce loop may carry a constant extent from synthesis; after
    // the let changes it must cover exactly [min, max] again.
    let produce_loop = crate::schedule::loop_name(func, 0, var);
    let lo = Expr::Var(min_name);
    let extent = Expr::Var(max_name) - lo.clone() + 1;
    let s = replace_let(s, &target, &value);
    retarget_loop(s, &produce_loop, &lo, &extent)
}

/// Stage 0 of `func` iterates `var` in a loop of its own, unsplit and serial.
fn has_serial_produce_loop(body: &Stmt, func: &str, var: &str) -> bool {
    let name = crate::schedule::loop_name(func, 0, var);
    body.find_loop(&name)
        .is_some_and(|l| l.for_type == ForType::Serial)
}

fn retarget_loop(s: Stmt, name: &str, min: &Expr, extent: &Expr) -> Stmt {
    match s {
        Stmt::For(mut l) if l.name == name => {
            l.min = min.clone();
            l.extent = extent.clone();
            Stmt::For(l)
        }
        other => other.map_children(&mut |c| retarget_loop(c, name, min, extent)),
    }
}

fn let_values(s: &Stmt, min_name: &str, max_name: &str) -> Option<(Expr, Expr)> {
    let mut min = None;
    let mut max = None;
    s.walk(&mut |n| {
        if let Stmt::Let { name, value, .. } = n {
            if name == min_name {
                min = Some(value.clone());
            } else if name == max_name {
                max = Some(value.clone());
            }
        }
    });
    Some((min?, max?))
}

fn replace_let(s: Stmt, target: &str, value: &Expr) -> Stmt {
    match s {
        Stmt::Let { name, body, .. } if name == target => Stmt::Let {
            name,
            value: value.clone(),
            body,
        },
        other => other.map_children(&mut |c| replace_let(c, target, value)),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::codes;
    use crate::expr::var;
    use crate::func::Func;
    use crate::lower::build_loop_nest;
    use crate::realize::{realize, Buffer, Realization};
    use std::collections::BTreeMap;

    fn blur_y(g: Func, taps: &[i64]) -> Pipeline {
        let mut value: Option<Expr> = None;
        for t in taps {
            let c = g.call([var("x"), var("y") + *t]);
            value = Some(match value {
                Some(v) => v + c,
                None => c,
            });
        }
        let out = Func::new("out", &["x", "y"]).define(value.unwrap_or(Expr::Int(0)));
        Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[8, 16])
    }

    fn producer() -> Func {
        Func::new("g", &["x", "y"]).define(var("x") + var("y") * 3)
    }

    fn run(p: &Pipeline, options: StorageOptions) -> StorageResult {
        let order: Vec<String> = vec!["g".into(), "out".into()];
        let synth = build_loop_nest(p, &order);
        assert!(synth.diagnostics.is_empty(), "{:?}", synth.diagnostics);
        plan_storage(synth.nest, p, options)
    }

    fn realized(result: &StorageResult) -> Realization {
        realize(&result.nest, &BTreeMap::new(), &BTreeMap::new())
            .unwrap_or_else(|e| panic!("{e}\n{}", result.nest))
    }

    fn g_value(x: i64, y: i64) -> i64 {
        x + y * 3
    }

    fn decision(result: &StorageResult, dim: usize) -> StorageDecision {
        let found = result
            .decisions
            .iter()
            .find(|d| d.func == "g" && d.dim == dim)
            .cloned();
        found.unwrap_or_else(|| panic!("no decision for g dim {}", dim))
    }

    #[test]
    fn overlapping_rows_fold_to_power_of_two() {
        let g = producer().store_root().compute_at("out", "y");
        let result = run(&blur_y(g, &[-1, 0, 1]), StorageOptions::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(decision(&result, 1).choice, StorageChoice::Fold { factor: 4 });
        assert!(decision(&result, 1).sliding);
        assert_eq!(decision(&result, 0).choice, StorageChoice::Full);
        let realize = result.nest.body.find_realize("g").cloned();
        let realize = realize.unwrap_or_else(|| panic!("g not realized"));
        assert_eq!(realize.dims[0].alloc_extent, Some(8));
        assert_eq!(realize.dims[1].physical_extent(), Some(4));
        assert!(result.nest.body.to_string().contains("select("));

        // Every row of g is produced once and no live slot is overwritten.
        let r = realized(&result);
        assert_eq!(r.store_count("g"), 8 * 18);
        let expected = Buffer::from_fn(&[0, 0], &[8, 16], |p| {
            (-1..=1).map(|dy| g_value(p[0], p[1] + dy)).sum()
        });
        assert_eq!(r.output("out"), Some(&expected));
    }

    #[test]
    fn sliding_shrinks_the_produce_loop() {
        let g = producer().store_root().compute_at("out", "y");
        let result = run(&blur_y(g, &[-1, 0, 1]), StorageOptions::default());
        let produce = result.nest.body.find_loop("g.s0.y").cloned();
        let produce = produce.unwrap_or_else(|| panic!("no produce loop:\n{}", result.nest));
        assert_eq!(produce.min, Expr::Var("g.s0.y.min".into()));
        assert!(produce.extent.as_int().is_none(), "{}", produce.extent);
    }

    #[test]
    fn short_output_slides_within_its_region() {
        let g = producer().store_root().compute_at("out", "y");
        let out = Func::new("out", &["x", "y"]).define(
            g.call([var("x"), var("y") - 1]) + g.call([var("x"), var("y")]) + g.call([var("x"), var("y") + 1]),
        );
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[3, 2]);
        for options in [
            StorageOptions::default(),
            StorageOptions {
                folding: false,
                ..StorageOptions::default()
            },
        ] {
            let result = run(&p, options);
            let r = realized(&result);
            assert_eq!(r.store_count("g"), 3 * 4);
            let expected = Buffer::from_fn(&[0, 0], &[3, 2], |p| {
                (-1..=1).map(|dy| g_value(p[0], p[1] + dy)).sum()
            });
            assert_eq!(r.output("out"), Some(&expected));
        }
    }

    #[test]
    fn descending_reads_slide_downward() {
        let g = producer().store_root().compute_at("out", "y");
        let out = Func::new("out", &["x", "y"]).define(
            g.call([var("x"), Expr::Int(15) - var("y")])
                + g.call([var("x"), Expr::Int(16) - var("y")]),
        );
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[8, 16]);
        let result = run(&p, StorageOptions::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let r = realized(&result);
        let expected = Buffer::from_fn(&[0, 0], &[8, 16], |p| {
            g_value(p[0], 15 - p[1]) + g_value(p[0], 16 - p[1])
        });
        assert_eq!(r.output("out"), Some(&expected));
        if decision(&result, 1).sliding {
            assert_eq!(r.store_count("g"), 8 * 17);
        }
    }

    #[test]
    fn disjoint_rows_use_moving_window() {
        let g = producer().store_root().compute_at("out", "y");
        let out = Func::new("out", &["x", "y"]).define(
            g.call([var("x"), var("y") * 2]) + g.call([var("x"), var("y") * 2 + 1]),
        );
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[8, 16]);
        let result = run(&p, StorageOptions::default());
        assert_eq!(decision(&result, 1).choice, StorageChoice::Window { extent: 2 });
        assert!(!decision(&result, 1).sliding);
    }

    #[test]
    fn folding_disabled_keeps_full_storage() {
        let g = producer().store_root().compute_at("out", "y");
        let options = StorageOptions {
            folding: false,
            ..StorageOptions::default()
        };
        let result = run(&blur_y(g, &[-1, 0, 1]), options);
        assert_eq!(decision(&result, 1).choice, StorageChoice::Full);
        let realize = result.nest.body.find_realize("g").cloned();
        let realize = realize.unwrap_or_else(|| panic!("g not realized"));
        assert_eq!(realize.dims[1].physical_extent(), Some(18));
    }

    #[test]
    fn no_reuse_inside_parallel_rows() {
        let g = producer().store_root().compute_at("out", "x");
        let out = Func::new("out", &["x", "y"])
            .define(g.call([var("x"), var("y")]) + g.call([var("x") + 1, var("y")]))
            .stage(0, |s| s.parallel("y"));
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[8, 16]);
        let result = run(&p, StorageOptions::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(decision(&result, 0).choice, StorageChoice::Full);
        assert_eq!(decision(&result, 1).choice, StorageChoice::Full);
    }

    #[test]
    fn explicit_fold_smaller_than_window_is_rejected() {
        let g = producer()
            .store_root()
            .compute_at("out", "y")
            .fold_storage("y", 2);
        let result = run(&blur_y(g, &[-1, 0, 1]), StorageOptions::default());
        let err = result.diagnostics.iter().find(|d| d.code == Some(codes::E0301));
        let err = err.unwrap_or_else(|| panic!("{:?}", result.diagnostics));
        assert!(err.hint.as_deref().is_some_and(|h| h.contains("at least 3")));
    }

    #[test]
    fn explicit_fold_on_mirrored_access_is_rejected() {
        let g = producer()
            .store_root()
            .compute_at("out", "y")
            .fold_storage("y", 16);
        let out = Func::new("out", &["x", "y"]).define(
            g.call([var("x"), var("y")]) + g.call([var("x"), Expr::Int(15) - var("y")]),
        );
        let p = Pipeline::new()
            .with_func(g)
            .with_func(out)
            .output("out", &[0, 0], &[8, 16]);
        let result = run(&p, StorageOptions::default());
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0300)));
    }
}
