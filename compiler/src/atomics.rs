// atomics.rs — Race and atomicity classification of parallel updates
//
// For every update stage with a parallel (or vectorized/GPU) loop of its
// own, decides how concurrent iterations must be synchronized:
//   - none, when each parallel loop variable maps to disjoint store
//     locations and the update only reads back the location it writes;
//   - unchecked, when the stage allows race conditions (W0301);
//   - one atomic read-modify-write per tuple component, when `atomic()` is
//     requested and every component is `self op e` with `e` independent of
//     the Func's other components;
//   - one mutex around the whole store otherwise (W0300 when the stage
//     carries no `atomic()` request).
//
// Preconditions: `nest` comes from synthesis (any later refinement pass is
//                fine); Provide args use the stage's qualified names.
// Postconditions: every racing Provide is wrapped in exactly one Atomic.
// Failure modes: none; anything not provably safe gets a mutex.
// Side effects: none.

use serde::Serialize;
use tracing::debug;

use crate::bounds::{bounds_of_expr, BoundsCtx, Interval, Scope};
use crate::diag::{codes, Diagnostic, Site};
use crate::expr::{BinOp, Expr};
use crate::func::Pipeline;
use crate::nest::{Atomic, AtomicOp, ForType, LoopNest, Provide, Stmt, Synchronization};
use crate::simplify::{const_difference, linearize, simplify};

/// Synchronization chosen for one parallel update stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSync {
    pub func: String,
    pub stage: usize,
    /// Parallel loops of the stage, outermost first.
    pub loops: Vec<String>,
    pub sync: Synchronization,
}

#[derive(Debug)]
pub struct AtomicsResult {
    pub nest: LoopNest,
    pub stages: Vec<StageSync>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Classify every parallel update in `nest` and wrap racing stores.
pub fn insert_atomics(nest: LoopNest, pipeline: &Pipeline) -> AtomicsResult {
    let mut ctx = AtomicsCtx {
        pipeline,
        bounds: BoundsCtx::for_pipeline(pipeline),
        frames: Vec::new(),
        stages: Vec::new(),
        diagnostics: Vec::new(),
    };
    let body = ctx.visit(nest.body);
    AtomicsResult {
        nest: LoopNest {
            body,
            outputs: nest.outputs,
        },
        stages: ctx.stages,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────

enum Frame {
    Loop {
        name: String,
        min: Expr,
        extent: Expr,
        for_type: ForType,
    },
    Let(String, Expr),
}

struct AtomicsCtx<'a> {
    pipeline: &'a Pipeline,
    bounds: BoundsCtx,
    /// Loops and lets enclosing the current statement, outermost first.
    frames: Vec<Frame>,
    stages: Vec<StageSync>,
    diagnostics: Vec<Diagnostic>,
}

impl AtomicsCtx<'_> {
    fn visit(&mut self, s: Stmt) -> Stmt {
        match s {
            Stmt::For(mut f) => {
                self.frames.push(Frame::Loop {
                    name: f.name.clone(),
                    min: f.min.clone(),
                    extent: f.extent.clone(),
                    for_type: f.for_type,
                });
                let body = self.visit(*f.body);
                self.frames.pop();
                f.body = Box::new(body);
                Stmt::For(f)
            }
            Stmt::Let { name, value, body } => {
                self.frames.push(Frame::Let(name.clone(), value.clone()));
                let body = self.visit(*body);
                self.frames.pop();
                Stmt::Let {
                    name,
                    value,
                    body: Box::new(body),
                }
            }
            Stmt::Provide(p) if p.stage > 0 => self.classify(p),
            other => other.map_children(&mut |c| self.visit(c)),
        }
    }

    /// Substitute every enclosing let, innermost first.
    fn resolve(&self, e: &Expr) -> Expr {
        let mut out = e.clone();
        for frame in self.frames.iter().rev() {
            if let Frame::Let(name, value) = frame {
                out = out.substitute_var(name, value);
            }
        }
        simplify(&out)
    }

    fn classify(&mut self, p: Provide) -> Stmt {
        let prefix = format!("{}.s{}.", p.func, p.stage);
        let parallel: Vec<usize> = self
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Frame::Loop { name, for_type, .. }
                    if for_type.is_parallel() && name.starts_with(&prefix) =>
                {
                    Some(i)
                }
                _ => None,
            })
            .collect();
        if parallel.is_empty() {
            return Stmt::Provide(p);
        }
        let Some(schedule) = self
            .pipeline
            .func(&p.func)
            .and_then(|f| f.definitions.get(p.stage))
            .map(|d| d.schedule.clone())
        else {
            return Stmt::Provide(p);
        };

        let args: Vec<Expr> = p.args.iter().map(|a| self.resolve(a)).collect();
        let values: Vec<Expr> = p.values.iter().map(|v| self.resolve(v)).collect();
        let loops: Vec<String> = parallel
            .iter()
            .filter_map(|&i| match &self.frames[i] {
                Frame::Loop { name, .. } => Some(name.clone()),
                Frame::Let(..) => None,
            })
            .collect();

        let reads_local = values
            .iter()
            .all(|v| self_loads(v, &p.func).iter().all(|args_read| args_read == &args));
        let disjoint = reads_local && parallel.iter().all(|&i| self.disjoint_in(i, &args));

        let site = Site::stage(&p.func, p.stage);
        let sync = if disjoint {
            Synchronization::None
        } else if schedule.allow_race_conditions {
            self.diagnostics.push(
                Diagnostic::warning(
                    codes::W0301,
                    site,
                    format!("parallel update of `{}` may race; accepted unchecked", p.func),
                )
                .with_hint("remove allow_race_conditions() to synchronize the update"),
            );
            Synchronization::Unchecked
        } else {
            let trust = schedule.atomic == Some(true);
            let ops = schedule
                .atomic
                .and_then(|_| atomic_ops(&p.func, &args, &values, trust));
            match ops {
                Some(ops) => Synchronization::Atomic { ops },
                None => {
                    if schedule.atomic.is_none() {
                        self.diagnostics.push(
                            Diagnostic::warning(
                                codes::W0300,
                                site,
                                format!(
                                    "parallel update of `{}` may race; guarded by a mutex",
                                    p.func
                                ),
                            )
                            .with_hint("mark the update atomic() or serialize the parallel loop"),
                        );
                    }
                    Synchronization::Mutex {
                        name: format!("{}.s{}.mutex", p.func, p.stage),
                    }
                }
            }
        };
        debug!(func = %p.func, stage = p.stage, sync = ?sync, "parallel update classified");
        self.stages.push(StageSync {
            func: p.func.clone(),
            stage: p.stage,
            loops,
            sync: sync.clone(),
        });
        match sync {
            Synchronization::None => Stmt::Provide(p),
            sync => Stmt::Atomic(Atomic {
                func: p.func.clone(),
                stage: p.stage,
                sync,
                body: Box::new(Stmt::Provide(p)),
            }),
        }
    }

    /// True if distinct iterations of the loop at `frames[at]` store to
    /// disjoint locations: some coordinate is `a * v + rest` where `rest`
    /// spans fewer than `|a|` values over the loops nested inside.
    fn disjoint_in(&mut self, at: usize, args: &[Expr]) -> bool {
        let Frame::Loop { name, .. } = &self.frames[at] else {
            return false;
        };
        let name = name.clone();
        let mut scope = Scope::new();
        for frame in &self.frames[at + 1..] {
            if let Frame::Loop { name, min, extent, .. } = frame {
                let lo = self.resolve(min);
                let hi = simplify(&(&lo + &self.resolve(extent) - 1));
                scope.push(name, Interval::bounded(lo, hi));
            }
        }
        let atom = Expr::Var(name.clone());
        for arg in args {
            let Some(mut lin) = linearize(arg) else {
                continue;
            };
            let a = lin.coefficient(&atom);
            if a == 0 || lin.terms.keys().any(|t| *t != atom && t.uses_var(&name)) {
                continue;
            }
            lin.terms.remove(&atom);
            let rest = bounds_of_expr(&lin.to_expr(), &scope, &mut self.bounds);
            let span = match (&rest.min, &rest.max) {
                (Some(lo), Some(hi)) => const_difference(hi, lo),
                _ => None,
            };
            if span.is_some_and(|s| s < a.saturating_abs()) {
                return true;
            }
        }
        false
    }
}

// ── Component classification ────────────────────────────────────────────

/// Argument lists (simplified) of every load from `func` inside `e`.
fn self_loads(e: &Expr, func: &str) -> Vec<Vec<Expr>> {
    let mut out = Vec::new();
    e.walk(&mut |n| {
        if let Expr::Call(c) = n {
            if c.func == func {
                out.push(c.args.iter().map(simplify).collect());
            }
        }
    });
    out
}

fn is_own_load(e: &Expr, func: &str, index: usize, args: &[Expr]) -> bool {
    match e {
        Expr::Call(c) => {
            c.func == func
                && c.value_index == index
                && c.args.len() == args.len()
                && c.args.iter().zip(args).all(|(a, b)| simplify(a) == *b)
        }
        _ => false,
    }
}

/// Whether `rest` may be combined atomically into component `index`.
/// Loads of other components couple the tuple; loads of the same
/// component elsewhere are accepted only when associativity is trusted.
fn independent(rest: &Expr, func: &str, index: usize, trust: bool) -> bool {
    let mut ok = true;
    rest.walk(&mut |n| {
        if let Expr::Call(c) = n {
            if c.func == func && (c.value_index != index || !trust) {
                ok = false;
            }
        }
    });
    ok
}

fn component_op(
    func: &str,
    index: usize,
    args: &[Expr],
    value: &Expr,
    trust: bool,
) -> Option<AtomicOp> {
    let own = |e: &Expr| is_own_load(e, func, index, args);
    let ok = |rest: &Expr| independent(rest, func, index, trust);
    match value {
        Expr::Bin { op: BinOp::Sub, a, b } if own(a) => ok(b).then_some(AtomicOp::Sub),
        Expr::Bin { op, a, b } if matches!(op, BinOp::Mul | BinOp::Min | BinOp::Max) => {
            let rest = if own(a) {
                b
            } else if own(b) {
                a
            } else {
                return None;
            };
            let op = match op {
                BinOp::Mul => AtomicOp::Mul,
                BinOp::Min => AtomicOp::Min,
                _ => AtomicOp::Max,
            };
            ok(rest).then_some(op)
        }
        Expr::And(a, b) | Expr::Or(a, b) => {
            let rest = if own(a) {
                b
            } else if own(b) {
                a
            } else {
                return None;
            };
            let op = if matches!(value, Expr::And(..)) {
                AtomicOp::And
            } else {
                AtomicOp::Or
            };
            ok(rest).then_some(op)
        }
        _ => {
            let lin = linearize(value)?;
            let (load, coeff) = lin.terms.iter().find(|(t, _)| own(t))?;
            if *coeff != 1 {
                return None;
            }
            let mut rest = lin.clone();
            rest.terms.remove(load);
            ok(&rest.to_expr()).then_some(AtomicOp::Add)
        }
    }
}

/// One atomic op per tuple component, or `None` if any component needs
/// to observe another component's old value.
fn atomic_ops(func: &str, args: &[Expr], values: &[Expr], trust: bool) -> Option<Vec<AtomicOp>> {
    values
        .iter()
        .enumerate()
        .map(|(j, v)| component_op(func, j, args, v, trust))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
