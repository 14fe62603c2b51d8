// skip.rs — Stage skipping
//
// Guards the produce block of a Func with a condition that is true
// whenever any value it produces there may be read. The condition is
// built from the selects and ifs its consumers read it under, relaxed
// over the loops between the produce and the reads, and over calls to
// Funcs that are not yet computed when the guard is evaluated.
//
// Preconditions: `nest` comes from the storage pass; `order` is the
//                realization order.
// Postconditions: a guard is added only where its condition is not
//                 provably true; skipping never changes the output.
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::bounds::{bounds_of_expr, BoundsCtx, Interval, Scope};
use crate::expr::{self, CmpOp, Expr};
use crate::func::Pipeline;
use crate::nest::{LoopNest, SkipGuard, SkipKind, Stmt};
use crate::simplify::simplify;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipReport {
    pub func: String,
    pub condition: String,
    pub kind: SkipKind,
}

#[derive(Debug)]
pub struct SkipResult {
    pub nest: LoopNest,
    pub guards: Vec<SkipReport>,
}

/// Where a produce or realize sits: pre-order position and the loops
/// around it, outermost first.
#[derive(Debug, Clone, Default)]
struct Placement {
    position: usize,
    loops: Vec<String>,
}

/// Guard every skippable produce block in `nest`.
pub fn skip_stages(nest: LoopNest, pipeline: &Pipeline, order: &[String]) -> SkipResult {
    let mut body = nest.body;
    let mut guards = Vec::new();
    let mut bounds = BoundsCtx::for_pipeline(pipeline);

    for name in order.iter().rev() {
        let Some(func) = pipeline.func(name) else {
            continue;
        };
        if func.is_input() || pipeline.is_output(name) {
            continue;
        }
        let (produces, realizes) = placements(&body);
        let (Some(at), Some(storage)) = (produces.get(name), realizes.get(name)) else {
            continue;
        };
        // Values kept across iterations of a loop between storage and
        // compute may be read by later iterations.
        if at.loops.len() != storage.loops.len() {
            continue;
        }
        let ready: BTreeSet<String> = produces
            .iter()
            .filter(|(other, p)| {
                *other != name && p.position < at.position && at.loops.starts_with(&p.loops)
            })
            .map(|(other, _)| other.clone())
            .chain(
                pipeline
                    .funcs
                    .iter()
                    .filter(|f| f.is_input())
                    .map(|f| f.name.clone()),
            )
            .collect();

        let site = match at.loops.last() {
            Some(l) => body.find_loop(l).map(|lp| &*lp.body),
            None => Some(&body),
        };
        let Some(site) = site else {
            continue;
        };
        let mut ctx = UseCtx {
            func: name,
            ready: &ready,
            bounds: &mut bounds,
        };
        let used = ctx.stmt_use(site);
        let used = ctx.relax(&used, &Scope::new(), true);
        let condition = simplify(&used);
        if condition.as_bool() == Some(true) {
            continue;
        }
        let kind = if condition.has_calls() {
            SkipKind::DataDependent
        } else {
            SkipKind::Static
        };
        debug!(func = %name, condition = %condition, kind = ?kind, "stage guarded");
        guards.push(SkipReport {
            func: name.clone(),
            condition: condition.to_string(),
            kind,
        });
        body = set_guard(body, name, SkipGuard { condition, kind });
    }

    SkipResult {
        nest: LoopNest {
            body,
            outputs: nest.outputs,
        },
        guards,
    }
}

fn placements(body: &Stmt) -> (BTreeMap<String, Placement>, BTreeMap<String, Placement>) {
    fn walk(
        s: &Stmt,
        loops: &mut Vec<String>,
        counter: &mut usize,
        produces: &mut BTreeMap<String, Placement>,
        realizes: &mut BTreeMap<String, Placement>,
    ) {
        *counter += 1;
        let here = Placement {
            position: *counter,
            loops: loops.clone(),
        };
        match s {
            Stmt::Produce(p) => {
                produces.insert(p.func.clone(), here);
            }
            Stmt::Realize(r) => {
                realizes.insert(r.func.clone(), here);
            }
            _ => {}
        }
        if let Stmt::For(l) = s {
            loops.push(l.name.clone());
        }
        for c in s.children() {
            walk(c, loops, counter, produces, realizes);
        }
        if let Stmt::For(_) = s {
            loops.pop();
        }
    }
    let mut produces = BTreeMap::new();
    let mut realizes = BTreeMap::new();
    walk(body, &mut Vec::new(), &mut 0, &mut produces, &mut realizes);
    (produces, realizes)
}

fn set_guard(s: Stmt, func: &str, guard: SkipGuard) -> Stmt {
    let mut guard = Some(guard);
    set_guard_inner(s, func, &mut guard)
}

fn set_guard_inner(s: Stmt, func: &str, guard: &mut Option<SkipGuard>) -> Stmt {
    match s {
        Stmt::Produce(mut p) if p.func == func => {
            p.guard = guard.take();
            Stmt::Produce(p)
        }
        other => other.map_children(&mut |c| set_guard_inner(c, func, guard)),
    }
}

// ── Use conditions ──────────────────────────────────────────────────────────

struct UseCtx<'a> {
    func: &'a str,
    /// Funcs whose values are final when the guard is evaluated.
    ready: &'a BTreeSet<String>,
    bounds: &'a mut BoundsCtx,
}

impl UseCtx<'_> {
    /// Condition under which `s` may read `func`.
    fn stmt_use(&mut self, s: &Stmt) -> Expr {
        match s {
            Stmt::Produce(p) if p.func == self.func => Expr::Bool(false),
            Stmt::Produce(p) => {
                let body = self.stmt_use(&p.body);
                match &p.guard {
                    Some(g) => expr::or(
                        self.expr_use(&g.condition),
                        expr::and(g.condition.clone(), body),
                    ),
                    None => body,
                }
            }
            Stmt::Provide(p) => {
                let reads = expr::any_of(
                    p.values
                        .iter()
                        .chain(p.args.iter())
                        .map(|e| self.expr_use(e))
                        .collect::<Vec<_>>(),
                );
                match (&p.predicate, p.predicate_loads) {
                    (Some(pred), true) => {
                        expr::or(self.expr_use(pred), expr::and(pred.clone(), reads))
                    }
                    (Some(pred), false) => expr::or(self.expr_use(pred), reads),
                    (None, _) => reads,
                }
            }
            Stmt::For(l) => {
                let body = self.stmt_use(&l.body);
                let mut scope = Scope::new();
                let last = simplify(&(&l.min + &l.extent - 1));
                scope.push(&l.name, Interval::bounded(l.min.clone(), last));
                let relaxed = self.relax(&body, &scope, true);
                expr::or(
                    expr::or(self.expr_use(&l.min), self.expr_use(&l.extent)),
                    relaxed,
                )
            }
            Stmt::Let { name, value, body } => {
                let inner = self.stmt_use(body).substitute_var(name, value);
                expr::or(self.expr_use(value), inner)
            }
            Stmt::If {
                cond,
                then_case,
                else_case,
            } => {
                let then_use = expr::and(cond.clone(), self.stmt_use(then_case));
                let else_use = match else_case {
                    Some(e) => expr::and(expr::not(cond.clone()), self.stmt_use(e)),
                    None => Expr::Bool(false),
                };
                expr::any_of([self.expr_use(cond), then_use, else_use])
            }
            Stmt::Realize(r) => self.stmt_use(&r.body),
            Stmt::Atomic(a) => self.stmt_use(&a.body),
            Stmt::Block(items) => {
                expr::any_of(items.iter().map(|i| self.stmt_use(i)).collect::<Vec<_>>())
            }
        }
    }

    /// Condition under which evaluating `e` reads `func`. Select arms
    /// are evaluated lazily.
    fn expr_use(&mut self, e: &Expr) -> Expr {
        if !e.calls_func(self.func) {
            return Expr::Bool(false);
        }
        match e {
            Expr::Call(c) if c.func == self.func => Expr::Bool(true),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                let then_use = expr::and((**cond).clone(), self.expr_use(then_value));
                let else_use = expr::and(expr::not((**cond).clone()), self.expr_use(else_value));
                expr::any_of([self.expr_use(cond), then_use, else_use])
            }
            _ => {
                let mut parts = Vec::new();
                e.for_each_child(|c: &Expr| parts.push(c.clone()));
                expr::any_of(parts.iter().map(|c| self.expr_use(c)).collect::<Vec<_>>())
            }
        }
    }

    fn needs_relax(&self, e: &Expr, scope: &Scope<Interval>) -> bool {
        let mut found = false;
        e.walk(&mut |n| match n {
            Expr::Var(v) => found |= scope.contains(v),
            Expr::Call(c) => found |= !self.ready.contains(&c.func),
            _ => {}
        });
        found
    }

    /// An upper bound (`positive`) or lower bound (`!positive`) of the
    /// truth of `e` free of the variables in `scope` and of calls to
    /// Funcs that are not ready.
    fn relax(&mut self, e: &Expr, scope: &Scope<Interval>, positive: bool) -> Expr {
        if !self.needs_relax(e, scope) {
            return e.clone();
        }
        match e {
            Expr::And(a, b) => {
                let (a, b) = (self.relax(a, scope, positive), self.relax(b, scope, positive));
                expr::and(a, b)
            }
            Expr::Or(a, b) => {
                let (a, b) = (self.relax(a, scope, positive), self.relax(b, scope, positive));
                expr::or(a, b)
            }
            Expr::Not(a) => expr::not(self.relax(a, scope, !positive)),
            Expr::Cmp { op, a, b } => {
                let ia = bounds_of_expr(a, scope, self.bounds);
                let ib = bounds_of_expr(b, scope, self.bounds);
                relax_cmp(*op, &ia, &ib, positive).unwrap_or(Expr::Bool(positive))
            }
            _ => Expr::Bool(positive),
        }
    }
}

/// Whether `a op b` may hold (`positive`) or must hold (`!positive`) for
/// some / all values in the given intervals.
fn relax_cmp(op: CmpOp, a: &Interval, b: &Interval, positive: bool) -> Option<Expr> {
    let (amin, amax) = (a.min.clone(), a.max.clone());
    let (bmin, bmax) = (b.min.clone(), b.max.clone());
    Some(match (op, positive) {
        (CmpOp::Lt, true) => expr::lt(amin?, bmax?),
        (CmpOp::Lt, false) => expr::lt(amax?, bmin?),
        (CmpOp::Le, true) => expr::le(amin?, bmax?),
        (CmpOp::Le, false) => expr::le(amax?, bmin?),
        (CmpOp::Eq, true) => expr::and(expr::le(amin?, bmax?), expr::le(bmin?, amax?)),
        (CmpOp::Eq, false) => expr::and(expr::eq(amax?, bmin?), expr::eq(amin?, bmax?)),
        (CmpOp::Ne, true) => Expr::Bool(true),
        (CmpOp::Ne, false) => expr::or(expr::lt(amax?, bmin?), expr::lt(bmax?, amin?)),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{param, var, ScalarType};
    use crate::func::Func;
    use crate::lower::build_loop_nest;

    fn order(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn diamond() -> Pipeline {
        let f1 = Func::new("f1", &["x"]).define(var("x") + 1).compute_root();
        let f2 = Func::new("f2", &["x"]).define(f1.call([var("x")]) * 2).compute_root();
        let f3 = Func::new("f3", &["x"]).define(f1.call([var("x")]) * 3).compute_root();
        let f4 = Func::new("f4", &["x"]).define(
            expr::select(param("toggle1", ScalarType::Bool), f2.call([var("x")]), 0)
                + expr::select(param("toggle2", ScalarType::Bool), f3.call([var("x")]), 0),
        );
        Pipeline::new()
            .with_param("toggle1", ScalarType::Bool, None)
            .with_param("toggle2", ScalarType::Bool, None)
            .with_func(f1)
            .with_func(f2)
            .with_func(f3)
            .with_func(f4)
            .output("f4", &[0], &[10])
    }

    #[test]
    fn toggles_guard_whole_stages() {
        let p = diamond();
        let ord = order(&["f1", "f2", "f3", "f4"]);
        let synth = build_loop_nest(&p, &ord);
        let result = skip_stages(synth.nest, &p, &ord);
        let by_func: BTreeMap<&str, &SkipReport> =
            result.guards.iter().map(|g| (g.func.as_str(), g)).collect();
        assert_eq!(by_func["f2"].condition, "toggle1");
        assert_eq!(by_func["f3"].condition, "toggle2");
        assert_eq!(by_func["f1"].condition, "(toggle1 || toggle2)");
        assert!(result.guards.iter().all(|g| g.kind == SkipKind::Static));
    }

    #[test]
    fn row_flag_gives_data_dependent_guard() {
        let flag = Func::new("flag", &["y"]).define(var("y") % 2).compute_root();
        let f2 = Func::new("f2", &["x", "y"])
            .define(var("x") + var("y"))
            .compute_at("out", "y");
        let out = Func::new("out", &["x", "y"]).define(expr::select(
            expr::gt(flag.call([var("y")]), 0),
            f2.call([var("x"), var("y")]),
            0,
        ));
        let p = Pipeline::new()
            .with_func(flag)
            .with_func(f2)
            .with_func(out)
            .output("out", &[0, 0], &[4, 4]);
        let ord = order(&["flag", "f2", "out"]);
        let synth = build_loop_nest(&p, &ord);
        let result = skip_stages(synth.nest, &p, &ord);
        assert_eq!(result.guards.len(), 1, "{:?}", result.guards);
        assert_eq!(result.guards[0].func, "f2");
        assert_eq!(result.guards[0].kind, SkipKind::DataDependent);
        assert!(result.guards[0].condition.contains("flag(out.s0.y)"));
    }

    #[test]
    fn loop_dependent_reads_relax_to_loop_range() {
        let f = Func::new("f", &["x"]).define(var("x")).compute_root();
        let out = Func::new("out", &["x"]).define(expr::select(
            expr::lt(var("x"), 100),
            f.call([var("x")]),
            0,
        ));
        let p = Pipeline::new()
            .with_func(f)
            .with_func(out)
            .output("out", &[0], &[10]);
        let ord = order(&["f", "out"]);
        let synth = build_loop_nest(&p, &ord);
        let result = skip_stages(synth.nest, &p, &ord);
        // x < 100 holds somewhere in [0, 9], so f is always needed.
        assert!(result.guards.is_empty(), "{:?}", result.guards);
    }
}
