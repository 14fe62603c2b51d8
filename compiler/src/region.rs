// region.rs — Schedule-independent region inference
//
// Computes, for every Func reachable from the outputs, the dense region
// it would need if every Func were computed at root. This is the upper
// bound on what any schedule computes; the loop-nest synthesizer derives
// tighter, per-iteration regions from the same footprint analysis.
//
// Preconditions: `order` is the realization order of an inlined pipeline.
// Postconditions: every non-input Func in `order` that is required has a
//                 bounded region, or an E0100 diagnostic names the call
//                 that could not be bounded. Input regions are what the
//                 pipeline reads, clamped to the input shape only where
//                 inference gives no bound.
// Failure modes: unbounded regions (E0100).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::bounds::{
    bounds_of_expr, boxes_touched, BoundsCtx, Interval, Region, Scope, Touched, UnboundedUse,
};
use crate::diag::{Diagnostic, Site};
use crate::error::LowerError;
use crate::expr::{all_of, Expr};
use crate::func::{BoundKind, Func, Pipeline};
use crate::nest::{Provide, Stmt};
use crate::simplify::simplify;

#[derive(Debug, Clone, Serialize)]
pub struct RegionEntry {
    pub func: String,
    pub mins: Vec<Option<String>>,
    pub maxs: Vec<Option<String>>,
}

#[derive(Debug)]
pub struct RegionResult {
    pub regions: BTreeMap<String, Region>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RegionResult {
    /// Regions in serializable form, in `order`.
    pub fn entries(&self, order: &[String]) -> Vec<RegionEntry> {
        order
            .iter()
            .filter_map(|name| {
                let r = self.regions.get(name)?;
                Some(RegionEntry {
                    func: name.clone(),
                    mins: r.dims.iter().map(|d| d.min.as_ref().map(|e| e.to_string())).collect(),
                    maxs: r.dims.iter().map(|d| d.max.as_ref().map(|e| e.to_string())).collect(),
                })
            })
            .collect()
    }
}

// ── Footprint of one stage ──────────────────────────────────────────────────

/// Regions read and written by stage `stage` of `func` when its pure
/// variables range over `stage_box`. Reductions range over their RDom and
/// are refined by its predicates.
pub fn stage_footprint(
    func: &Func,
    stage: usize,
    stage_box: &Region,
    funcs: &BTreeSet<String>,
    ctx: &mut BoundsCtx,
) -> Touched {
    let Some(def) = func.definitions.get(stage) else {
        return Touched::default();
    };
    let mut scope = Scope::new();
    let mut pushed = Vec::new();
    for i in func.pure_dims(stage) {
        let iv = stage_box
            .dims
            .get(i)
            .cloned()
            .unwrap_or_else(Interval::everything);
        scope.push(&func.args[i], iv);
        pushed.push(func.args[i].clone());
    }
    if let Some(rdom) = &def.rdom {
        for r in &rdom.vars {
            let lo = bounds_of_expr(&r.min, &scope, ctx).min;
            let last = simplify(&(&r.min + &r.extent - 1));
            let hi = bounds_of_expr(&last, &scope, ctx).max;
            scope.push(&r.name, Interval { min: lo, max: hi });
            pushed.push(r.name.clone());
        }
    }
    let predicate = def
        .rdom
        .as_ref()
        .filter(|r| !r.predicates.is_empty())
        .map(|r| all_of(r.predicates.iter().cloned()));
    let provide = Stmt::Provide(Provide {
        func: func.name.clone(),
        stage,
        args: def.args.clone(),
        values: def.values.clone(),
        predicate,
        predicate_loads: true,
    });
    let touched = boxes_touched(&provide, funcs, &mut scope, ctx);
    for name in pushed.iter().rev() {
        scope.pop(name);
    }
    touched
}

// ── Declared bounds ─────────────────────────────────────────────────────────

/// Apply `func`'s `.bound()` and `.estimate()` declarations to `region`.
/// A Bound replaces the inferred interval; an Estimate fills only ends
/// that inference left open. Remaining open ends are E0100, one per
/// offending call site.
pub fn apply_declared_bounds(
    func: &Func,
    region: Region,
    uses: &[UnboundedUse],
) -> Result<Region, Vec<Diagnostic>> {
    let mut errors: Vec<Diagnostic> = Vec::new();
    let mut dims = Vec::with_capacity(region.dims.len());
    for (i, iv) in region.dims.into_iter().enumerate() {
        let resolved = match func.declared_bound(i) {
            Some(b) if b.kind == BoundKind::Bound => {
                Interval::bounded(Expr::Int(b.min), Expr::Int(b.min + b.extent - 1))
            }
            Some(b) => Interval {
                min: iv.min.or(Some(Expr::Int(b.min))),
                max: iv.max.or(Some(Expr::Int(b.min + b.extent - 1))),
            },
            None if iv.is_bounded() => iv,
            None => {
                let before = errors.len();
                let mut seen = BTreeSet::new();
                for u in uses.iter().filter(|u| u.dim == i) {
                    if seen.insert((u.site.to_string(), u.call.clone())) {
                        errors.push(unbounded(func, i, u.site.clone(), u.call.clone()));
                    }
                }
                if errors.len() == before {
                    errors.push(unbounded(
                        func,
                        i,
                        Site::func(&func.name),
                        format!("bounds of {}", iv),
                    ));
                }
                iv
            }
        };
        dims.push(resolved);
    }
    if errors.is_empty() {
        Ok(Region::new(dims))
    } else {
        Err(errors)
    }
}

fn unbounded(func: &Func, dim: usize, site: Site, call: String) -> Diagnostic {
    LowerError::UnboundedRegion {
        func: func.name.clone(),
        dim,
        site,
        call,
    }
    .into()
}

/// Fill open ends of an input's region from its shape.
fn clamp_to_shape(func: &Func, region: Region) -> Region {
    let Some(shape) = func.input_shape() else {
        return region;
    };
    let dims = region
        .dims
        .into_iter()
        .enumerate()
        .map(|(i, iv)| {
            let lo = shape.mins.get(i).copied().unwrap_or(0);
            let ext = shape.extents.get(i).copied().unwrap_or(1);
            Interval {
                min: iv.min.or(Some(Expr::Int(lo))),
                max: iv.max.or(Some(Expr::Int(lo + ext - 1))),
            }
        })
        .collect();
    Region::new(dims)
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Infer root-level regions for every Func in `order`.
pub fn infer_regions(pipeline: &Pipeline, order: &[String]) -> RegionResult {
    let mut ctx = BoundsCtx::for_pipeline(pipeline);
    let mut required: BTreeMap<String, Touched> = BTreeMap::new();
    let mut regions: BTreeMap<String, Region> = BTreeMap::new();
    let mut diagnostics = Vec::new();
    let funcs: BTreeSet<String> = order.iter().cloned().collect();

    for o in &pipeline.outputs {
        let t = required.entry(o.func.clone()).or_default();
        let req = Region::from_const(&o.mins, &o.extents);
        let merged = match t.regions.get(&o.func) {
            Some(r) => r.union(&req),
            None => req,
        };
        t.regions.insert(o.func.clone(), merged);
    }

    for name in order.iter().rev() {
        let Some(func) = pipeline.func(name) else {
            continue;
        };
        let Some(t) = required.remove(name) else {
            continue;
        };
        let Some(region) = t.regions.get(name).cloned() else {
            continue;
        };
        if func.is_input() {
            regions.insert(name.clone(), clamp_to_shape(func, region));
            continue;
        }
        let uses = t.unbounded.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let mut acc = match apply_declared_bounds(func, region, uses) {
            Ok(r) => r,
            Err(errs) => {
                diagnostics.extend(errs);
                continue;
            }
        };

        for k in (0..func.num_stages()).rev() {
            let footprint = stage_footprint(func, k, &acc, &funcs, &mut ctx);
            for (callee, r) in footprint.regions {
                if callee == *name {
                    if k > 0 {
                        acc = acc.union(&r);
                    }
                    continue;
                }
                let entry = required.entry(callee.clone()).or_default();
                let merged = match entry.regions.get(&callee) {
                    Some(prev) => prev.union(&r),
                    None => r,
                };
                entry.regions.insert(callee, merged);
            }
            for (callee, uses) in footprint.unbounded {
                if callee != *name {
                    let entry = required.entry(callee.clone()).or_default();
                    entry.unbounded.entry(callee).or_default().extend(uses);
                }
            }
        }
        debug!(func = %name, region = %acc, "inferred region");
        regions.insert(name.clone(), acc);
    }

    RegionResult {
        regions,
        diagnostics,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
