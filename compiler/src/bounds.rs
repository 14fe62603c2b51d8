// bounds.rs — Symbolic and constant interval analysis
//
// `bounds_of_expr` computes a symbolic interval for an expression given
// intervals for the variables in scope; variables not in scope stay
// symbolic (a point interval). `boxes_touched` walks a statement and
// collects, per Func, the region every call site (and store) may access.
// `const_bounds_of_expr` is the numeric counterpart used for storage
// sizing and fold analysis.
//
// Preconditions: expressions reference only variables bound in scope or
//                bound outside the analyzed statement.
// Postconditions: every returned interval contains every value the
//                 expression can take (soundness); overflow widens to
//                 unbounded and is recorded in `BoundsCtx::overflows`.
// Failure modes: none (unboundedness is reported, not failed on).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::Site;
use crate::expr::{self, BinOp, CmpOp, Expr, ScalarType};
use crate::func::Pipeline;
use crate::interval::ConstInterval;
use crate::nest::Stmt;
use crate::simplify::simplify;

// ── Scope ───────────────────────────────────────────────────────────────

/// Name → value stack; inner bindings shadow outer ones until popped.
#[derive(Debug, Clone)]
pub struct Scope<T> {
    table: BTreeMap<String, Vec<T>>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Scope {
            table: BTreeMap::new(),
        }
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: T) {
        self.table.entry(name.to_string()).or_default().push(value);
    }

    pub fn pop(&mut self, name: &str) {
        if let Some(stack) = self.table.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.table.remove(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.table.get(name).and_then(|s| s.last())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.table.keys().cloned().collect()
    }
}

// ── Symbolic intervals ──────────────────────────────────────────────────

/// `[min, max]` with symbolic ends; `None` means unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

impl Interval {
    pub fn everything() -> Self {
        Interval {
            min: None,
            max: None,
        }
    }

    pub fn point(e: Expr) -> Self {
        Interval {
            min: Some(e.clone()),
            max: Some(e),
        }
    }

    pub fn bounded(min: Expr, max: Expr) -> Self {
        Interval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn from_const(c: &ConstInterval) -> Self {
        Interval {
            min: c.min.map(Expr::Int),
            max: c.max.map(Expr::Int),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    pub fn is_point(&self) -> bool {
        self.min.is_some() && self.min == self.max
    }

    /// Smallest interval containing both.
    pub fn union(&self, other: &Interval) -> Interval {
        Interval {
            min: match (&self.min, &other.min) {
                (Some(a), Some(b)) => Some(simplify(&expr::min(a, b))),
                _ => None,
            },
            max: match (&self.max, &other.max) {
                (Some(a), Some(b)) => Some(simplify(&expr::max(a, b))),
                _ => None,
            },
        }
    }

    /// Intersection; known ends win over unbounded ones.
    pub fn intersect(&self, other: &Interval) -> Interval {
        Interval {
            min: match (&self.min, &other.min) {
                (Some(a), Some(b)) => Some(simplify(&expr::max(a, b))),
                (Some(v), None) | (None, Some(v)) => Some(v.clone()),
                (None, None) => None,
            },
            max: match (&self.max, &other.max) {
                (Some(a), Some(b)) => Some(simplify(&expr::min(a, b))),
                (Some(v), None) | (None, Some(v)) => Some(v.clone()),
                (None, None) => None,
            },
        }
    }

    /// `max - min + 1`, when bounded.
    pub fn extent(&self) -> Option<Expr> {
        match (&self.min, &self.max) {
            (Some(lo), Some(hi)) => Some(simplify(&(hi - lo + 1))),
            _ => None,
        }
    }

    fn simplified(self) -> Interval {
        Interval {
            min: self.min.map(|e| simplify(&e)),
            max: self.max.map(|e| simplify(&e)),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.min {
            Some(e) => write!(f, "[{}, ", e)?,
            None => write!(f, "[-inf, ")?,
        }
        match &self.max {
            Some(e) => write!(f, "{}]", e),
            None => write!(f, "+inf]"),
        }
    }
}

/// A box: one interval per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub dims: Vec<Interval>,
}

impl Region {
    pub fn new(dims: Vec<Interval>) -> Self {
        Region { dims }
    }

    pub fn from_const(mins: &[i64], extents: &[i64]) -> Self {
        Region {
            dims: mins
                .iter()
                .zip(extents)
                .map(|(m, e)| Interval::bounded(Expr::Int(*m), Expr::Int(m + e - 1)))
                .collect(),
        }
    }

    pub fn union(&self, other: &Region) -> Region {
        Region {
            dims: self
                .dims
                .iter()
                .zip(&other.dims)
                .map(|(a, b)| a.union(b))
                .collect(),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.dims.iter().all(Interval::is_bounded)
    }

    pub fn unbounded_dims(&self) -> Vec<usize> {
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.is_bounded())
            .map(|(i, _)| i)
            .collect()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

// ── Analysis context ────────────────────────────────────────────────────

/// Pipeline facts consulted by interval analysis.
#[derive(Debug, Clone, Default)]
pub struct BoundsCtx {
    /// Declared value ranges of Funcs.
    pub value_ranges: BTreeMap<String, ConstInterval>,
    /// Declared ranges of params.
    pub param_ranges: BTreeMap<String, ConstInterval>,
    /// Expressions whose interval overflowed and was widened.
    pub overflows: Vec<Expr>,
}

impl BoundsCtx {
    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        let value_ranges = pipeline
            .funcs
            .iter()
            .filter_map(|f| {
                f.value_range
                    .map(|(lo, hi)| (f.name.clone(), ConstInterval::bounded(lo, hi)))
            })
            .collect();
        let param_ranges = pipeline
            .params
            .iter()
            .filter_map(|p| {
                p.range
                    .map(|(lo, hi)| (p.name.clone(), ConstInterval::bounded(lo, hi)))
            })
            .collect();
        BoundsCtx {
            value_ranges,
            param_ranges,
            overflows: Vec::new(),
        }
    }

    /// Range of values a call may return.
    pub fn call_value_range(&self, func: &str, ty: ScalarType) -> ConstInterval {
        if let Some(r) = self.value_ranges.get(func) {
            return *r;
        }
        if ty.is_narrow() || ty == ScalarType::Bool {
            ConstInterval::of_type(ty)
        } else {
            ConstInterval::EVERYTHING
        }
    }

    fn param_range(&self, name: &str, ty: ScalarType) -> ConstInterval {
        if let Some(r) = self.param_ranges.get(name) {
            return *r;
        }
        if ty.is_narrow() || ty == ScalarType::Bool {
            ConstInterval::of_type(ty)
        } else {
            ConstInterval::EVERYTHING
        }
    }
}

// ── Symbolic bounds of expressions ──────────────────────────────────────

fn uses_scope(e: &Expr, scope: &Scope<Interval>) -> bool {
    let mut found = false;
    e.walk(&mut |n| match n {
        Expr::Var(v) => found |= scope.contains(v),
        Expr::Call(_) => found = true,
        _ => {}
    });
    found
}

/// Sound symbolic interval of `e` over the variables in `scope`.
pub fn bounds_of_expr(e: &Expr, scope: &Scope<Interval>, ctx: &mut BoundsCtx) -> Interval {
    if !uses_scope(e, scope) {
        return Interval::point(e.clone());
    }
    match e {
        Expr::Int(_) | Expr::Bool(_) | Expr::Param { .. } => Interval::point(e.clone()),
        Expr::Var(v) => scope
            .get(v)
            .cloned()
            .unwrap_or_else(|| Interval::point(e.clone())),
        Expr::Call(c) => Interval::from_const(&ctx.call_value_range(&c.func, c.ty)),
        Expr::Cast { ty, value } => {
            let iv = bounds_of_expr(value, scope, ctx);
            cast_interval(*ty, iv, e, ctx)
        }
        Expr::Bin { op, a, b } => {
            let ia = bounds_of_expr(a, scope, ctx);
            let ib = bounds_of_expr(b, scope, ctx);
            let result = bin_interval(*op, &ia, &ib).simplified();
            if matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul) {
                check_overflow(result, e, ctx)
            } else {
                result
            }
        }
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => match simplify(cond) {
            Expr::Bool(true) => bounds_of_expr(then_value, scope, ctx),
            Expr::Bool(false) => bounds_of_expr(else_value, scope, ctx),
            _ => bounds_of_expr(then_value, scope, ctx)
                .union(&bounds_of_expr(else_value, scope, ctx)),
        },
        Expr::Cmp { .. } | Expr::And(..) | Expr::Or(..) | Expr::Not(_) => {
            Interval::bounded(Expr::Int(0), Expr::Int(1))
        }
    }
}

fn cast_interval(ty: ScalarType, iv: Interval, e: &Expr, ctx: &mut BoundsCtx) -> Interval {
    if iv.is_point() {
        let end = iv.min.unwrap_or(Expr::Int(0));
        return Interval::point(simplify(&expr::cast(ty, end)));
    }
    let fits = |end: &Option<Expr>| match end.as_ref().and_then(Expr::as_int) {
        Some(v) => Some(ty.can_represent(v)),
        None => None,
    };
    match (fits(&iv.min), fits(&iv.max)) {
        (Some(true), Some(true)) => iv,
        _ if ty.is_narrow() || ty == ScalarType::Bool => {
            Interval::from_const(&ConstInterval::of_type(ty))
        }
        (Some(false), _) | (_, Some(false)) => {
            ctx.overflows.push(e.clone());
            Interval::everything()
        }
        _ => iv,
    }
}

/// Widen an interval whose constant ends do not fit the expression type.
fn check_overflow(iv: Interval, e: &Expr, ctx: &mut BoundsCtx) -> Interval {
    let ty = e.ty();
    if ty.bits() >= 64 {
        return iv;
    }
    let bad = |end: &Option<Expr>| {
        end.as_ref()
            .and_then(Expr::as_int)
            .is_some_and(|v| !ty.can_represent(v))
    };
    if bad(&iv.min) || bad(&iv.max) {
        ctx.overflows.push(e.clone());
        if ty.is_narrow() {
            Interval::from_const(&ConstInterval::of_type(ty))
        } else {
            Interval::everything()
        }
    } else {
        iv
    }
}

fn both(a: &Option<Expr>, b: &Option<Expr>, f: impl Fn(&Expr, &Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        _ => None,
    }
}

fn either(a: &Option<Expr>, b: &Option<Expr>, f: impl Fn(&Expr, &Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

fn const_of(iv: &Interval) -> Option<i64> {
    if iv.is_point() {
        iv.min.as_ref().and_then(Expr::as_int)
    } else {
        None
    }
}

fn min_all(es: Vec<Expr>) -> Expr {
    es.into_iter().reduce(expr::min).unwrap_or(Expr::Int(0))
}

fn max_all(es: Vec<Expr>) -> Expr {
    es.into_iter().reduce(expr::max).unwrap_or(Expr::Int(0))
}

fn bin_interval(op: BinOp, a: &Interval, b: &Interval) -> Interval {
    match op {
        BinOp::Add => Interval {
            min: both(&a.min, &b.min, |x, y| x + y),
            max: both(&a.max, &b.max, |x, y| x + y),
        },
        BinOp::Sub => Interval {
            min: both(&a.min, &b.max, |x, y| x - y),
            max: both(&a.max, &b.min, |x, y| x - y),
        },
        BinOp::Mul => mul_interval(a, b),
        BinOp::Div => div_interval(a, b),
        BinOp::Mod => mod_interval(a, b),
        BinOp::Min => Interval {
            min: both(&a.min, &b.min, |x, y| expr::min(x, y)),
            max: either(&a.max, &b.max, |x, y| expr::min(x, y)),
        },
        BinOp::Max => Interval {
            min: either(&a.min, &b.min, |x, y| expr::max(x, y)),
            max: both(&a.max, &b.max, |x, y| expr::max(x, y)),
        },
    }
}

fn scale(a: &Interval, k: i64) -> Interval {
    if k == 0 {
        return Interval::point(Expr::Int(0));
    }
    let mul = |e: &Option<Expr>| e.as_ref().map(|x| x * k);
    if k > 0 {
        Interval {
            min: mul(&a.min),
            max: mul(&a.max),
        }
    } else {
        Interval {
            min: mul(&a.max),
            max: mul(&a.min),
        }
    }
}

fn mul_interval(a: &Interval, b: &Interval) -> Interval {
    if let Some(k) = const_of(b) {
        return scale(a, k);
    }
    if let Some(k) = const_of(a) {
        return scale(b, k);
    }
    match (&a.min, &a.max, &b.min, &b.max) {
        (Some(a0), Some(a1), Some(b0), Some(b1)) => {
            let products = vec![a0 * b0, a0 * b1, a1 * b0, a1 * b1];
            Interval::bounded(min_all(products.clone()), max_all(products))
        }
        _ => Interval::everything(),
    }
}

fn div_interval(a: &Interval, b: &Interval) -> Interval {
    if let Some(k) = const_of(b) {
        let div = |e: &Option<Expr>| e.as_ref().map(|x| x / k);
        return match k {
            0 => Interval::point(Expr::Int(0)),
            k if k > 0 => Interval {
                min: div(&a.min),
                max: div(&a.max),
            },
            _ => Interval {
                min: div(&a.max),
                max: div(&a.min),
            },
        };
    }
    let positive_divisor = matches!(
        (b.min.as_ref().and_then(Expr::as_int), &b.max),
        (Some(lo), Some(_)) if lo > 0
    );
    if positive_divisor {
        if let (Some(a0), Some(a1), Some(b0), Some(b1)) = (&a.min, &a.max, &b.min, &b.max) {
            let q = vec![a0 / b0, a0 / b1, a1 / b0, a1 / b1];
            return Interval::bounded(min_all(q.clone()), max_all(q));
        }
    }
    match (&a.min, &a.max) {
        (Some(a0), Some(a1)) => {
            let m = expr::max(a1.clone(), Expr::Int(0) - a0.clone());
            Interval::bounded(Expr::Int(0) - m.clone(), m)
        }
        _ => Interval::everything(),
    }
}

fn mod_interval(a: &Interval, b: &Interval) -> Interval {
    let a_nonneg = a
        .min
        .as_ref()
        .and_then(Expr::as_int)
        .is_some_and(|v| v >= 0);
    if let Some(k) = const_of(b) {
        if k == 0 {
            return Interval::point(Expr::Int(0));
        }
        let k = k.checked_abs().unwrap_or(i64::MAX);
        if a_nonneg {
            if let Some(a1) = a.max.as_ref().and_then(Expr::as_int) {
                if a1 < k {
                    return a.clone();
                }
            }
        }
        return Interval::bounded(Expr::Int(0), Expr::Int(k - 1));
    }
    let max = match (&b.min, &b.max) {
        (Some(b0), Some(b1)) => Some(max_all(vec![
            b1 - 1,
            Expr::Int(0) - b0.clone() - 1,
            Expr::Int(0),
        ])),
        _ if a_nonneg => a.max.clone(),
        _ => None,
    };
    Interval {
        min: Some(Expr::Int(0)),
        max,
    }
}

// ── Scope refinement by conditions ──────────────────────────────────────

/// Tighten the intervals of in-scope variables constrained by `cond`
/// (or by its negation when `positive` is false). Returns the names
/// pushed, to be popped with `unrefine`.
pub fn refine(
    scope: &mut Scope<Interval>,
    cond: &Expr,
    positive: bool,
    ctx: &mut BoundsCtx,
) -> Vec<String> {
    let mut pushed = Vec::new();
    refine_into(scope, cond, positive, ctx, &mut pushed);
    pushed
}

pub fn unrefine(scope: &mut Scope<Interval>, pushed: &[String]) {
    for name in pushed.iter().rev() {
        scope.pop(name);
    }
}

fn refine_into(
    scope: &mut Scope<Interval>,
    cond: &Expr,
    positive: bool,
    ctx: &mut BoundsCtx,
    pushed: &mut Vec<String>,
) {
    match cond {
        Expr::And(a, b) if positive => {
            refine_into(scope, a, true, ctx, pushed);
            refine_into(scope, b, true, ctx, pushed);
        }
        Expr::Or(a, b) if !positive => {
            refine_into(scope, a, false, ctx, pushed);
            refine_into(scope, b, false, ctx, pushed);
        }
        Expr::Not(a) => refine_into(scope, a, !positive, ctx, pushed),
        Expr::Cmp { op, a, b } => {
            // Normalize to `lhs op rhs` holding.
            let (op, lhs, rhs) = match (op, positive) {
                (op, true) => (*op, a.as_ref(), b.as_ref()),
                (CmpOp::Lt, false) => (CmpOp::Le, b.as_ref(), a.as_ref()),
                (CmpOp::Le, false) => (CmpOp::Lt, b.as_ref(), a.as_ref()),
                (CmpOp::Eq, false) => (CmpOp::Ne, a.as_ref(), b.as_ref()),
                (CmpOp::Ne, false) => (CmpOp::Eq, a.as_ref(), b.as_ref()),
            };
            if let Expr::Var(v) = lhs {
                if scope.contains(v) && !rhs.uses_var(v) {
                    let rb = bounds_of_expr(rhs, scope, ctx);
                    let limit = match op {
                        CmpOp::Lt => Interval {
                            min: None,
                            max: rb.max.map(|m| m - 1),
                        },
                        CmpOp::Le => Interval {
                            min: None,
                            max: rb.max,
                        },
                        CmpOp::Eq => rb,
                        CmpOp::Ne => return,
                    };
                    push_refined(scope, v, &limit, pushed);
                }
            }
            if let Expr::Var(v) = rhs {
                if scope.contains(v) && !lhs.uses_var(v) {
                    let lb = bounds_of_expr(lhs, scope, ctx);
                    let limit = match op {
                        CmpOp::Lt => Interval {
                            min: lb.min.map(|m| m + 1),
                            max: None,
                        },
                        CmpOp::Le => Interval {
                            min: lb.min,
                            max: None,
                        },
                        CmpOp::Eq => lb,
                        CmpOp::Ne => return,
                    };
                    push_refined(scope, v, &limit, pushed);
                }
            }
        }
        _ => {}
    }
}

fn push_refined(scope: &mut Scope<Interval>, v: &str, limit: &Interval, pushed: &mut Vec<String>) {
    let current = scope.get(v).cloned().unwrap_or_else(Interval::everything);
    scope.push(v, current.intersect(limit));
    pushed.push(v.to_string());
}

// ── Regions touched by a statement ──────────────────────────────────────

/// A call site whose region could not be bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnboundedUse {
    pub site: Site,
    pub call: String,
    pub dim: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Touched {
    pub regions: BTreeMap<String, Region>,
    pub unbounded: BTreeMap<String, Vec<UnboundedUse>>,
}

impl Touched {
    pub fn region(&self, func: &str) -> Option<&Region> {
        self.regions.get(func)
    }
}

/// Regions of the Funcs in `funcs` read or written anywhere in `stmt`.
/// Variables bound outside `stmt` stay symbolic unless present in `scope`.
pub fn boxes_touched(
    stmt: &Stmt,
    funcs: &BTreeSet<String>,
    scope: &mut Scope<Interval>,
    ctx: &mut BoundsCtx,
) -> Touched {
    let mut walker = TouchWalker {
        funcs,
        ctx,
        touched: Touched::default(),
        site: Site::Pipeline,
    };
    walker.stmt(stmt, scope);
    walker.touched
}

/// Regions of the Funcs in `funcs` read anywhere in `e`.
pub fn boxes_required_by_expr(
    e: &Expr,
    funcs: &BTreeSet<String>,
    scope: &mut Scope<Interval>,
    ctx: &mut BoundsCtx,
    site: Site,
) -> Touched {
    let mut walker = TouchWalker {
        funcs,
        ctx,
        touched: Touched::default(),
        site,
    };
    walker.expr(e, scope);
    walker.touched
}

struct TouchWalker<'a> {
    funcs: &'a BTreeSet<String>,
    ctx: &'a mut BoundsCtx,
    touched: Touched,
    site: Site,
}

impl TouchWalker<'_> {
    fn record(&mut self, func: &str, args: &[Expr], call: String, scope: &Scope<Interval>) {
        let region = Region::new(
            args.iter()
                .map(|a| bounds_of_expr(a, scope, self.ctx))
                .collect(),
        );
        for dim in region.unbounded_dims() {
            self.touched
                .unbounded
                .entry(func.to_string())
                .or_default()
                .push(UnboundedUse {
                    site: self.site.clone(),
                    call: call.clone(),
                    dim,
                });
        }
        let merged = match self.touched.regions.get(func) {
            Some(prev) => prev.union(&region),
            None => region,
        };
        self.touched.regions.insert(func.to_string(), merged);
    }

    fn expr(&mut self, e: &Expr, scope: &mut Scope<Interval>) {
        e.walk(&mut |n| {
            if let Expr::Call(c) = n {
                if self.funcs.contains(&c.func) {
                    self.record(&c.func, &c.args, n.to_string(), scope);
                }
            }
        });
    }

    fn stmt(&mut self, s: &Stmt, scope: &mut Scope<Interval>) {
        match s {
            Stmt::For(l) => {
                self.expr(&l.min, scope);
                self.expr(&l.extent, scope);
                let lo = bounds_of_expr(&l.min, scope, self.ctx).min;
                let last = simplify(&(&l.min + &l.extent - 1));
                let hi = bounds_of_expr(&last, scope, self.ctx).max;
                scope.push(&l.name, Interval { min: lo, max: hi });
                self.stmt(&l.body, scope);
                scope.pop(&l.name);
            }
            Stmt::Let { name, value, body } => {
                self.expr(value, scope);
                let iv = bounds_of_expr(value, scope, self.ctx);
                scope.push(name, iv);
                self.stmt(body, scope);
                scope.pop(name);
            }
            Stmt::If {
                cond,
                then_case,
                else_case,
            } => {
                self.expr(cond, scope);
                let pushed = refine(scope, cond, true, self.ctx);
                self.stmt(then_case, scope);
                unrefine(scope, &pushed);
                if let Some(e) = else_case {
                    let pushed = refine(scope, cond, false, self.ctx);
                    self.stmt(e, scope);
                    unrefine(scope, &pushed);
                }
            }
            Stmt::Produce(p) => {
                let pushed = match &p.guard {
                    Some(g) => {
                        self.expr(&g.condition, scope);
                        refine(scope, &g.condition, true, self.ctx)
                    }
                    None => Vec::new(),
                };
                self.stmt(&p.body, scope);
                unrefine(scope, &pushed);
            }
            Stmt::Provide(p) => {
                let saved = std::mem::replace(&mut self.site, Site::stage(&p.func, p.stage));
                let pushed = match (&p.predicate, p.predicate_loads) {
                    (Some(pred), true) => {
                        self.expr(pred, scope);
                        refine(scope, pred, true, self.ctx)
                    }
                    (Some(pred), false) => {
                        self.expr(pred, scope);
                        Vec::new()
                    }
                    (None, _) => Vec::new(),
                };
                for v in &p.values {
                    self.expr(v, scope);
                }
                for a in &p.args {
                    self.expr(a, scope);
                }
                if self.funcs.contains(&p.func) {
                    let call = format!("store to {}", p.func);
                    self.record(&p.func, &p.args, call, scope);
                }
                unrefine(scope, &pushed);
                self.site = saved;
            }
            Stmt::Realize(r) => {
                for d in &r.dims {
                    self.expr(&d.min, scope);
                    self.expr(&d.extent, scope);
                }
                self.stmt(&r.body, scope);
            }
            Stmt::Atomic(a) => self.stmt(&a.body, scope),
            Stmt::Block(items) => {
                for item in items {
                    self.stmt(item, scope);
                }
            }
        }
    }
}

// ── Constant bounds ─────────────────────────────────────────────────────

/// Numeric interval of `e` given numeric intervals for variables in
/// `scope`; variables not in scope are unbounded.
pub fn const_bounds_of_expr(
    e: &Expr,
    scope: &Scope<ConstInterval>,
    ctx: &mut BoundsCtx,
) -> ConstInterval {
    match e {
        Expr::Int(v) => ConstInterval::single(*v),
        Expr::Bool(b) => ConstInterval::single(*b as i64),
        Expr::Var(v) => scope.get(v).copied().unwrap_or(ConstInterval::EVERYTHING),
        Expr::Param { name, ty } => ctx.param_range(name, *ty),
        Expr::Call(c) => ctx.call_value_range(&c.func, c.ty),
        Expr::Cast { ty, value } => {
            let (iv, widened) = const_bounds_of_expr(value, scope, ctx).cast(*ty);
            if widened && !ty.is_narrow() {
                ctx.overflows.push(e.clone());
            }
            iv
        }
        Expr::Bin { op, a, b } => {
            let ia = const_bounds_of_expr(a, scope, ctx);
            let ib = const_bounds_of_expr(b, scope, ctx);
            let result = match op {
                BinOp::Add => ia.add(&ib),
                BinOp::Sub => ia.sub(&ib),
                BinOp::Mul => ia.mul(&ib),
                BinOp::Div => ia.div(&ib),
                BinOp::Mod => ia.rem(&ib),
                BinOp::Min => ia.min(&ib),
                BinOp::Max => ia.max(&ib),
            };
            let overflowed_i64 = matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul)
                && ((ia.min.is_some() && ib.min.is_some() && result.min.is_none())
                    || (ia.max.is_some() && ib.max.is_some() && result.max.is_none()));
            if overflowed_i64 {
                ctx.overflows.push(e.clone());
            }
            let ty = e.ty();
            if ty.bits() < 64 && matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul) {
                let (iv, widened) = result.cast(ty);
                if widened {
                    ctx.overflows.push(e.clone());
                }
                iv
            } else {
                result
            }
        }
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => {
            let c = const_bounds_of_expr(cond, scope, ctx);
            match c.as_single() {
                Some(0) => const_bounds_of_expr(else_value, scope, ctx),
                Some(_) => const_bounds_of_expr(then_value, scope, ctx),
                None => const_bounds_of_expr(then_value, scope, ctx)
                    .union(&const_bounds_of_expr(else_value, scope, ctx)),
            }
        }
        Expr::Cmp { op, a, b } => {
            let ia = const_bounds_of_expr(a, scope, ctx);
            let ib = const_bounds_of_expr(b, scope, ctx);
            let decided = match op {
                CmpOp::Lt => decide(
                    ia.max.zip(ib.min).map(|(x, y)| x < y),
                    ia.min.zip(ib.max).map(|(x, y)| x >= y),
                ),
                CmpOp::Le => decide(
                    ia.max.zip(ib.min).map(|(x, y)| x <= y),
                    ia.min.zip(ib.max).map(|(x, y)| x > y),
                ),
                CmpOp::Eq | CmpOp::Ne => {
                    let same = ia.as_single().zip(ib.as_single()).map(|(x, y)| x == y);
                    let disjoint = ia.intersect(&ib).is_none();
                    let eq = match (same, disjoint) {
                        (Some(s), _) => Some(s),
                        (None, true) => Some(false),
                        _ => None,
                    };
                    if *op == CmpOp::Eq {
                        eq
                    } else {
                        eq.map(|v| !v)
                    }
                }
            };
            match decided {
                Some(v) => ConstInterval::single(v as i64),
                None => ConstInterval::bounded(0, 1),
            }
        }
        Expr::And(..) | Expr::Or(..) | Expr::Not(_) => match simplify(e) {
            Expr::Bool(v) => ConstInterval::single(v as i64),
            _ => ConstInterval::bounded(0, 1),
        },
    }
}

fn decide(always: Option<bool>, never: Option<bool>) -> Option<bool> {
    match (always, never) {
        (Some(true), _) => Some(true),
        (_, Some(true)) => Some(false),
        _ => None,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{var, Call};
    use crate::nest::{For, ForType, Provide};

    fn scope_with(vars: &[(&str, i64, i64)]) -> Scope<Interval> {
        let mut s = Scope::new();
        for (v, lo, hi) in vars {
            s.push(v, Interval::bounded(Expr::Int(*lo), Expr::Int(*hi)));
        }
        s
    }

    fn call(func: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(Call {
            func: func.into(),
            args,
            value_index: 0,
            ty: ScalarType::I32,
        })
    }

    #[test]
    fn affine_bounds() {
        let scope = scope_with(&[("x", 0, 9)]);
        let mut ctx = BoundsCtx::default();
        let iv = bounds_of_expr(&(var("x") * 2 + 1), &scope, &mut ctx);
        assert_eq!(iv, Interval::bounded(Expr::Int(1), Expr::Int(19)));
        let iv = bounds_of_expr(&(Expr::Int(10) - var("x")), &scope, &mut ctx);
        assert_eq!(iv, Interval::bounded(Expr::Int(1), Expr::Int(10)));
    }

    #[test]
    fn free_variables_stay_symbolic() {
        let scope = scope_with(&[("x", 0, 3)]);
        let mut ctx = BoundsCtx::default();
        let iv = bounds_of_expr(&(var("x") + var("y")), &scope, &mut ctx);
        assert_eq!(iv.min, Some(var("y")));
        assert_eq!(iv.max, Some(simplify(&(var("y") + 3))));
    }

    #[test]
    fn select_is_union_of_branches() {
        let scope = scope_with(&[("x", 0, 9)]);
        let mut ctx = BoundsCtx::default();
        let e = expr::select(expr::lt(var("x"), 5), var("x") + 100, var("x"));
        let iv = bounds_of_expr(&e, &scope, &mut ctx);
        assert_eq!(iv, Interval::bounded(Expr::Int(0), Expr::Int(109)));
    }

    #[test]
    fn call_values_use_type_or_declared_range() {
        let scope = scope_with(&[("x", 0, 9)]);
        let mut ctx = BoundsCtx::default();
        let narrow = Expr::Call(Call {
            func: "im".into(),
            args: vec![var("x")],
            value_index: 0,
            ty: ScalarType::UInt(8),
        });
        let iv = bounds_of_expr(&narrow, &scope, &mut ctx);
        assert_eq!(iv, Interval::bounded(Expr::Int(0), Expr::Int(255)));
        let wide = call("g", vec![var("x")]);
        assert!(!bounds_of_expr(&wide, &scope, &mut ctx).is_bounded());
        ctx.value_ranges
            .insert("g".into(), ConstInterval::bounded(-1, 1));
        assert!(bounds_of_expr(&wide, &scope, &mut ctx).is_bounded());
    }

    #[test]
    fn overflow_widens_and_is_recorded() {
        let scope = scope_with(&[("x", 0, 10_000)]);
        let mut ctx = BoundsCtx::default();
        let iv = bounds_of_expr(&(var("x") * 1_000_000), &scope, &mut ctx);
        assert!(!iv.is_bounded());
        assert_eq!(ctx.overflows.len(), 1);
    }

    #[test]
    fn refinement_by_condition() {
        let mut scope = scope_with(&[("x", 0, 99)]);
        let mut ctx = BoundsCtx::default();
        let cond = expr::and(expr::lt(var("x"), 10), expr::le(3, var("x")));
        let pushed = refine(&mut scope, &cond, true, &mut ctx);
        assert_eq!(
            scope.get("x"),
            Some(&Interval::bounded(Expr::Int(3), Expr::Int(9)))
        );
        unrefine(&mut scope, &pushed);
        let pushed = refine(&mut scope, &expr::lt(var("x"), 10), false, &mut ctx);
        assert_eq!(
            scope.get("x"),
            Some(&Interval::bounded(Expr::Int(10), Expr::Int(99)))
        );
        unrefine(&mut scope, &pushed);
        assert_eq!(
            scope.get("x"),
            Some(&Interval::bounded(Expr::Int(0), Expr::Int(99)))
        );
    }

    #[test]
    fn boxes_touched_through_loops_and_lets() {
        // for x in [0, 10): let t = x + 1; out(x) = f(t - 1) + f(t + 1)
        let body = Stmt::let_stmt(
            "t",
            var("x") + 1,
            Stmt::Provide(Provide {
                func: "out".into(),
                stage: 0,
                args: vec![var("x")],
                values: vec![call("f", vec![var("t") - 1]) + call("f", vec![var("t") + 1])],
                predicate: None,
                predicate_loads: false,
            }),
        );
        let s = Stmt::For(For {
            name: "x".into(),
            min: Expr::Int(0),
            extent: Expr::Int(10),
            for_type: ForType::Serial,
            body: Box::new(body),
        });
        let funcs: BTreeSet<String> = ["f".to_string()].into_iter().collect();
        let mut ctx = BoundsCtx::default();
        let touched = boxes_touched(&s, &funcs, &mut Scope::new(), &mut ctx);
        let r = touched.region("f").cloned();
        assert_eq!(
            r,
            Some(Region::new(vec![Interval::bounded(
                Expr::Int(0),
                Expr::Int(11)
            )]))
        );
        assert!(touched.region("out").is_none());
    }

    #[test]
    fn unbounded_use_names_site() {
        let s = Stmt::Provide(Provide {
            func: "h".into(),
            stage: 0,
            args: vec![var("x")],
            values: vec![call("f", vec![call("g", vec![var("x")])])],
            predicate: None,
            predicate_loads: false,
        });
        let funcs: BTreeSet<String> = ["f".to_string()].into_iter().collect();
        let mut scope = scope_with(&[("x", 0, 9)]);
        let touched = boxes_touched(&s, &funcs, &mut scope, &mut BoundsCtx::default());
        let uses = &touched.unbounded["f"];
        assert_eq!(uses[0].site, Site::stage("h", 0));
        assert_eq!(uses[0].call, "f(g(x))");
    }

    #[test]
    fn const_bounds_basic() {
        let mut scope = Scope::new();
        scope.push("x", ConstInterval::bounded(0, 9));
        let mut ctx = BoundsCtx::default();
        let e = expr::min(var("x") * 3, 20) % 8;
        assert_eq!(
            const_bounds_of_expr(&e, &scope, &mut ctx),
            ConstInterval::bounded(0, 7)
        );
        let e = expr::select(expr::lt(var("x"), 100), 1, 1000);
        assert_eq!(
            const_bounds_of_expr(&e, &scope, &mut ctx),
            ConstInterval::single(1)
        );
        assert!(const_bounds_of_expr(&var("y"), &scope, &mut ctx).is_everything());
    }
}
