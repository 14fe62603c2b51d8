// nest.rs — Loop-nest IR produced by lowering
//
// A lowered pipeline is a single `Stmt` tree: loops, lets, storage
// realizations, produce blocks, stores (`Provide`), conditionals and
// atomic sections. Loop names are fully qualified (`f.s0.x`), so every
// loop, let and bound variable in the tree has a distinct name.
//
// Preconditions: none (types and traversal helpers).
// Postconditions: `verify_nest` accepts every nest `build_loop_nest`
//   returns for a valid schedule.
// Failure modes: `verify_nest` reports structural violations as E0600.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, Diagnostic, Site};
use crate::expr::{Expr, ScalarType};

// ── Loop kinds ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForType {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    GpuBlock,
    GpuThread,
}

impl ForType {
    /// Iterations may run concurrently.
    pub fn is_parallel(self) -> bool {
        matches!(
            self,
            ForType::Parallel | ForType::Vectorized | ForType::GpuBlock | ForType::GpuThread
        )
    }

    fn keyword(self) -> &'static str {
        match self {
            ForType::Serial => "for",
            ForType::Parallel => "parallel",
            ForType::Vectorized => "vectorized",
            ForType::Unrolled => "unrolled",
            ForType::GpuBlock => "gpu_block",
            ForType::GpuThread => "gpu_thread",
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────────

/// How one realized dimension maps logical coordinates onto storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageReduction {
    /// Full extent.
    None,
    /// Circular buffer: coordinate `c` lives at `c mod factor`.
    Fold { factor: i64 },
    /// Non-overlapping sliding window: coordinate `c` lives at `c - base`,
    /// with `base` evaluated at the access.
    Window { extent: i64, base: Expr },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDim {
    /// Logical region, evaluated where the realization begins.
    pub min: Expr,
    pub extent: Expr,
    /// Constant upper bound of `extent`, filled by the storage pass.
    pub alloc_extent: Option<i64>,
    pub reduction: StorageReduction,
}

impl StorageDim {
    /// Number of storage slots actually allocated for this dimension.
    pub fn physical_extent(&self) -> Option<i64> {
        match &self.reduction {
            StorageReduction::None => self.alloc_extent,
            StorageReduction::Fold { factor } => Some(*factor),
            StorageReduction::Window { extent, .. } => Some(*extent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realize {
    pub func: String,
    pub types: Vec<ScalarType>,
    pub dims: Vec<StorageDim>,
    /// Storage order, innermost (fastest varying) dimension first.
    pub storage_order: Vec<usize>,
    pub memoize: bool,
    pub body: Box<Stmt>,
}

// ── Stage-skipping guards ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipKind {
    /// Depends only on loop variables and params.
    Static,
    /// Reads values of previously computed Funcs.
    DataDependent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipGuard {
    pub condition: Expr,
    pub kind: SkipKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Produce {
    pub func: String,
    pub is_async: bool,
    pub guard: Option<SkipGuard>,
    pub body: Box<Stmt>,
}

// ── Stores ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provide {
    pub func: String,
    pub stage: usize,
    pub args: Vec<Expr>,
    pub values: Vec<Expr>,
    /// The store happens only where this holds.
    pub predicate: Option<Expr>,
    /// Loads in `values` are also guarded by the predicate.
    pub predicate_loads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Add,
    Sub,
    Mul,
    Min,
    Max,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Synchronization {
    /// Iterations provably write disjoint locations.
    None,
    /// One atomic read-modify-write per tuple component.
    Atomic { ops: Vec<AtomicOp> },
    /// The whole store (all tuple components) runs under one lock.
    Mutex { name: String },
    /// Races explicitly allowed.
    Unchecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atomic {
    pub func: String,
    pub stage: usize,
    pub sync: Synchronization,
    pub body: Box<Stmt>,
}

// ── Statements ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct For {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
    pub for_type: ForType,
    pub body: Box<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    For(For),
    Let {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    Realize(Realize),
    Produce(Produce),
    Provide(Provide),
    If {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Atomic(Atomic),
    Block(Vec<Stmt>),
}

impl Stmt {
    pub fn no_op() -> Stmt {
        Stmt::Block(Vec::new())
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, Stmt::Block(v) if v.is_empty())
    }

    /// Sequence two statements, flattening nested blocks.
    pub fn then(self, next: Stmt) -> Stmt {
        let mut items = match self {
            Stmt::Block(v) => v,
            s => vec![s],
        };
        match next {
            Stmt::Block(v) => items.extend(v),
            s => items.push(s),
        }
        if items.len() == 1 {
            items.pop().unwrap_or_else(Stmt::no_op)
        } else {
            Stmt::Block(items)
        }
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::Let {
            name: name.into(),
            value,
            body: Box::new(body),
        }
    }

    pub fn if_then(cond: Expr, then_case: Stmt) -> Stmt {
        Stmt::If {
            cond,
            then_case: Box::new(then_case),
            else_case: None,
        }
    }

    /// Direct child statements.
    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Stmt::For(f) => vec![&*f.body],
            Stmt::Let { body, .. } => vec![&**body],
            Stmt::Realize(r) => vec![&*r.body],
            Stmt::Produce(p) => vec![&*p.body],
            Stmt::Atomic(a) => vec![&*a.body],
            Stmt::Provide(_) => vec![],
            Stmt::If {
                then_case,
                else_case,
                ..
            } => {
                let mut v: Vec<&Stmt> = vec![&**then_case];
                if let Some(e) = else_case {
                    v.push(&**e);
                }
                v
            }
            Stmt::Block(items) => items.iter().collect(),
        }
    }

    /// Expressions held directly by this node (not its children).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::For(f) => vec![&f.min, &f.extent],
            Stmt::Let { value, .. } => vec![value],
            Stmt::Realize(r) => r.dims.iter().flat_map(|d| [&d.min, &d.extent]).collect(),
            Stmt::Produce(p) => p.guard.iter().map(|g| &g.condition).collect(),
            Stmt::Provide(p) => p
                .args
                .iter()
                .chain(p.values.iter())
                .chain(p.predicate.iter())
                .collect(),
            Stmt::If { cond, .. } => vec![cond],
            Stmt::Atomic(_) | Stmt::Block(_) => vec![],
        }
    }

    /// Pre-order traversal.
    pub fn walk(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        for c in self.children() {
            c.walk(f);
        }
    }

    /// True if any expression in the tree calls `func`.
    pub fn calls_func(&self, func: &str) -> bool {
        let mut found = false;
        self.walk(&mut |s| {
            found |= s.exprs().iter().any(|e| e.calls_func(func));
        });
        found
    }

    /// True if `func` is called anywhere in this tree outside the loop
    /// named `loop_name`.
    pub fn calls_func_outside_loop(&self, loop_name: &str, func: &str) -> bool {
        if let Stmt::For(l) = self {
            if l.name == loop_name {
                return false;
            }
        }
        self.exprs().iter().any(|e| e.calls_func(func))
            || self
                .children()
                .into_iter()
                .any(|c| c.calls_func_outside_loop(loop_name, func))
    }

    pub fn has_loop(&self, name: &str) -> bool {
        self.find_loop(name).is_some()
    }

    pub fn find_loop(&self, name: &str) -> Option<&For> {
        match self {
            Stmt::For(f) if f.name == name => Some(f),
            _ => self.children().into_iter().find_map(|c| c.find_loop(name)),
        }
    }

    pub fn find_produce(&self, func: &str) -> Option<&Produce> {
        match self {
            Stmt::Produce(p) if p.func == func => Some(p),
            _ => self.children().into_iter().find_map(|c| c.find_produce(func)),
        }
    }

    pub fn find_realize(&self, func: &str) -> Option<&Realize> {
        match self {
            Stmt::Realize(r) if r.func == func => Some(r),
            _ => self.children().into_iter().find_map(|c| c.find_realize(func)),
        }
    }

    /// Rebuild this node with `f` applied to each direct child statement.
    pub fn map_children(self, f: &mut dyn FnMut(Stmt) -> Stmt) -> Stmt {
        match self {
            Stmt::For(mut l) => {
                l.body = Box::new(f(*l.body));
                Stmt::For(l)
            }
            Stmt::Let { name, value, body } => Stmt::Let {
                name,
                value,
                body: Box::new(f(*body)),
            },
            Stmt::Realize(mut r) => {
                r.body = Box::new(f(*r.body));
                Stmt::Realize(r)
            }
            Stmt::Produce(mut p) => {
                p.body = Box::new(f(*p.body));
                Stmt::Produce(p)
            }
            Stmt::Atomic(mut a) => {
                a.body = Box::new(f(*a.body));
                Stmt::Atomic(a)
            }
            Stmt::If {
                cond,
                then_case,
                else_case,
            } => Stmt::If {
                cond,
                then_case: Box::new(f(*then_case)),
                else_case: else_case.map(|e| Box::new(f(*e))),
            },
            Stmt::Block(items) => Stmt::Block(items.into_iter().map(f).collect()),
            p @ Stmt::Provide(_) => p,
        }
    }

    /// Replace the body of the loop named `name` with `f(body)`.
    /// Returns the rebuilt tree and whether the loop was found.
    pub fn map_loop_body(self, name: &str, f: &mut dyn FnMut(Stmt) -> Stmt) -> (Stmt, bool) {
        let mut found = false;
        let out = map_loop_body_inner(self, name, f, &mut found);
        (out, found)
    }
}

fn map_loop_body_inner(
    s: Stmt,
    name: &str,
    f: &mut dyn FnMut(Stmt) -> Stmt,
    found: &mut bool,
) -> Stmt {
    match s {
        Stmt::For(mut l) if l.name == name => {
            *found = true;
            l.body = Box::new(f(*l.body));
            Stmt::For(l)
        }
        other => other.map_children(&mut |c| {
            if *found {
                c
            } else {
                map_loop_body_inner(c, name, f, found)
            }
        }),
    }
}

// ── Lowered pipeline ────────────────────────────────────────────────────

/// The concrete region an output Func is realized over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRegion {
    pub func: String,
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
}

/// A fully lowered pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopNest {
    pub body: Stmt,
    pub outputs: Vec<OutputRegion>,
}

// ── Verification certificate ────────────────────────────────────────────

/// Machine-checkable evidence that a lowered nest is well formed.
#[derive(Debug, Clone)]
pub struct NestCert {
    /// N1: every Provide lies inside the Produce of its Func.
    pub provides_inside_produce: bool,
    /// N2: every Produce lies inside the Realize of its Func.
    pub produces_inside_realize: bool,
    /// N3: loop and let names are unique along every path.
    pub names_unique: bool,
    /// N4: every realized dimension has a constant allocation extent.
    pub storage_sized: bool,
    /// N5: every call site targets a Func that is realized or an input.
    pub calls_resolved: bool,
}

impl crate::pass::StageCert for NestCert {
    fn all_pass(&self) -> bool {
        self.provides_inside_produce
            && self.produces_inside_realize
            && self.names_unique
            && self.storage_sized
            && self.calls_resolved
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("N1_provides_inside_produce", self.provides_inside_produce),
            ("N2_produces_inside_realize", self.produces_inside_realize),
            ("N3_names_unique", self.names_unique),
            ("N4_storage_sized", self.storage_sized),
            ("N5_calls_resolved", self.calls_resolved),
        ]
    }
}

#[derive(Default)]
struct VerifyCtx {
    realized: Vec<String>,
    producing: Vec<String>,
    bound: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    cert: Option<NestCert>,
}

/// Check structural invariants of a lowered nest. `inputs` names the
/// pipeline's input images, which are never realized.
pub fn verify_nest(nest: &LoopNest, inputs: &BTreeSet<String>) -> (NestCert, Vec<Diagnostic>) {
    let mut ctx = VerifyCtx {
        cert: Some(NestCert {
            provides_inside_produce: true,
            produces_inside_realize: true,
            names_unique: true,
            storage_sized: true,
            calls_resolved: true,
        }),
        ..Default::default()
    };
    verify_stmt(&nest.body, inputs, &mut ctx);
    let cert = ctx.cert.unwrap_or(NestCert {
        provides_inside_produce: false,
        produces_inside_realize: false,
        names_unique: false,
        storage_sized: false,
        calls_resolved: false,
    });
    (cert, ctx.diagnostics)
}

fn verify_fail(ctx: &mut VerifyCtx, site: Site, msg: String, pick: fn(&mut NestCert)) {
    if let Some(cert) = ctx.cert.as_mut() {
        pick(cert);
    }
    ctx.diagnostics
        .push(Diagnostic::error(codes::E0600, site, msg));
}

fn verify_stmt(s: &Stmt, inputs: &BTreeSet<String>, ctx: &mut VerifyCtx) {
    for e in s.exprs() {
        for callee in e.called_funcs() {
            if !inputs.contains(&callee) && !ctx.realized.contains(&callee) {
                verify_fail(
                    ctx,
                    Site::func(&callee),
                    format!("call to `{}` outside its realization", callee),
                    |c| c.calls_resolved = false,
                );
            }
        }
    }
    match s {
        Stmt::For(f) => {
            check_fresh(&f.name, ctx);
            ctx.bound.push(f.name.clone());
            verify_stmt(&f.body, inputs, ctx);
            ctx.bound.pop();
        }
        Stmt::Let { name, body, .. } => {
            check_fresh(name, ctx);
            ctx.bound.push(name.clone());
            verify_stmt(body, inputs, ctx);
            ctx.bound.pop();
        }
        Stmt::Realize(r) => {
            if r.dims.iter().any(|d| d.physical_extent().is_none()) {
                verify_fail(
                    ctx,
                    Site::func(&r.func),
                    format!("realization of `{}` has no constant allocation size", r.func),
                    |c| c.storage_sized = false,
                );
            }
            ctx.realized.push(r.func.clone());
            verify_stmt(&r.body, inputs, ctx);
            ctx.realized.pop();
        }
        Stmt::Produce(p) => {
            if !ctx.realized.contains(&p.func) {
                verify_fail(
                    ctx,
                    Site::func(&p.func),
                    format!("produce of `{}` outside its realization", p.func),
                    |c| c.produces_inside_realize = false,
                );
            }
            ctx.producing.push(p.func.clone());
            verify_stmt(&p.body, inputs, ctx);
            ctx.producing.pop();
        }
        Stmt::Provide(p) => {
            if !ctx.producing.contains(&p.func) {
                verify_fail(
                    ctx,
                    Site::stage(&p.func, p.stage),
                    format!("store to `{}` outside its produce", p.func),
                    |c| c.provides_inside_produce = false,
                );
            }
        }
        _ => {
            for c in s.children() {
                verify_stmt(c, inputs, ctx);
            }
        }
    }
}

fn check_fresh(name: &str, ctx: &mut VerifyCtx) {
    if ctx.bound.iter().any(|b| b == name) {
        verify_fail(
            ctx,
            Site::Loop(name.to_string()),
            format!("`{}` is bound twice on one path", name),
            |c| c.names_unique = false,
        );
    }
}

// ── Display ─────────────────────────────────────────────────────────────

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_stmt(self, f, 0)
    }
}

impl fmt::Display for LoopNest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outputs {
            write!(f, "output {}", o.func)?;
            for (m, e) in o.mins.iter().zip(&o.extents) {
                write!(f, " [{}, {})", m, m + e)?;
            }
            writeln!(f)?;
        }
        write!(f, "{}", self.body)
    }
}

fn fmt_stmt(s: &Stmt, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    match s {
        Stmt::For(l) => {
            writeln!(
                f,
                "{}{} {} in [{}, {} + {}) {{",
                pad,
                l.for_type.keyword(),
                l.name,
                l.min,
                l.min,
                l.extent
            )?;
            fmt_stmt(&l.body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Let { name, value, body } => {
            writeln!(f, "{}let {} = {}", pad, name, value)?;
            fmt_stmt(body, f, depth)
        }
        Stmt::Realize(r) => {
            write!(f, "{}realize {}(", pad, r.func)?;
            for (i, d) in r.dims.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "[{}, extent {}]", d.min, d.extent)?;
                match &d.reduction {
                    StorageReduction::None => {}
                    StorageReduction::Fold { factor } => write!(f, " fold {}", factor)?,
                    StorageReduction::Window { extent, base } => {
                        write!(f, " window {} at {}", extent, base)?
                    }
                }
            }
            writeln!(f, ") {{")?;
            fmt_stmt(&r.body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Produce(p) => {
            write!(f, "{}produce {}", pad, p.func)?;
            if p.is_async {
                write!(f, " async")?;
            }
            if let Some(g) = &p.guard {
                let kind = match g.kind {
                    SkipKind::Static => "static",
                    SkipKind::DataDependent => "data-dependent",
                };
                write!(f, " if {} ({})", g.condition, kind)?;
            }
            writeln!(f, " {{")?;
            fmt_stmt(&p.body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Provide(p) => {
            write!(f, "{}{}(", pad, p.func)?;
            for (i, a) in p.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", a)?;
            }
            write!(f, ") = ")?;
            if p.values.len() == 1 {
                write!(f, "{}", p.values[0])?;
            } else {
                write!(f, "{{")?;
                for (i, v) in p.values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")?;
            }
            if let Some(pred) = &p.predicate {
                let what = if p.predicate_loads { "loads+store" } else { "store" };
                write!(f, " if {} ({})", pred, what)?;
            }
            writeln!(f)
        }
        Stmt::If {
            cond,
            then_case,
            else_case,
        } => {
            writeln!(f, "{}if {} {{", pad, cond)?;
            fmt_stmt(then_case, f, depth + 1)?;
            if let Some(e) = else_case {
                writeln!(f, "{}}} else {{", pad)?;
                fmt_stmt(e, f, depth + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        Stmt::Atomic(a) => {
            let how = match &a.sync {
                Synchronization::None => "none".to_string(),
                Synchronization::Atomic { ops } => format!("atomic {:?}", ops),
                Synchronization::Mutex { name } => format!("mutex {}", name),
                Synchronization::Unchecked => "unchecked".to_string(),
            };
            writeln!(f, "{}atomic({}) {{", pad, how)?;
            fmt_stmt(&a.body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Block(items) => {
            for item in items {
                fmt_stmt(item, f, depth)?;
            }
            Ok(())
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{var, Call};
    use crate::pass::StageCert;

    fn provide(func: &str, arg: Expr) -> Stmt {
        Stmt::Provide(Provide {
            func: func.into(),
            stage: 0,
            args: vec![arg],
            values: vec![Expr::Int(1)],
            predicate: None,
            predicate_loads: false,
        })
    }

    fn for_loop(name: &str, extent: i64, body: Stmt) -> Stmt {
        Stmt::For(For {
            name: name.into(),
            min: Expr::Int(0),
            extent: Expr::Int(extent),
            for_type: ForType::Serial,
            body: Box::new(body),
        })
    }

    fn realize(func: &str, body: Stmt) -> Stmt {
        Stmt::Realize(Realize {
            func: func.into(),
            types: vec![ScalarType::I32],
            dims: vec![StorageDim {
                min: Expr::Int(0),
                extent: Expr::Int(4),
                alloc_extent: Some(4),
                reduction: StorageReduction::None,
            }],
            storage_order: vec![0],
            memoize: false,
            body: Box::new(body),
        })
    }

    fn produce(func: &str, body: Stmt) -> Stmt {
        Stmt::Produce(Produce {
            func: func.into(),
            is_async: false,
            guard: None,
            body: Box::new(body),
        })
    }

    fn nest(body: Stmt) -> LoopNest {
        LoopNest {
            body,
            outputs: vec![],
        }
    }

    #[test]
    fn then_flattens_blocks() {
        let a = provide("f", var("x"));
        let b = provide("g", var("x"));
        let s = Stmt::no_op().then(a.clone()).then(b.clone());
        assert_eq!(s, Stmt::Block(vec![a.clone(), b]));
        assert_eq!(Stmt::no_op().then(a.clone()), a);
    }

    #[test]
    fn map_loop_body_finds_named_loop() {
        let s = for_loop("g.s0.y", 4, for_loop("g.s0.x", 4, provide("g", var("g.s0.x"))));
        let (out, found) = s.map_loop_body("g.s0.y", &mut |body| {
            provide("f", var("g.s0.y")).then(body)
        });
        assert!(found);
        let l = out.find_loop("g.s0.y").map(|l| (*l.body).clone());
        assert!(matches!(l, Some(Stmt::Block(ref v)) if v.len() == 2));
        let (_, found) = out.map_loop_body("nope", &mut |b| b);
        assert!(!found);
    }

    #[test]
    fn verify_accepts_well_formed_nest() {
        let body = realize("f", produce("f", for_loop("f.s0.x", 4, provide("f", var("f.s0.x")))));
        let (cert, diags) = verify_nest(&nest(body), &BTreeSet::new());
        assert!(cert.all_pass(), "{:?}", diags);
    }

    #[test]
    fn verify_rejects_provide_outside_produce() {
        let body = realize("f", for_loop("f.s0.x", 4, provide("f", var("f.s0.x"))));
        let (cert, diags) = verify_nest(&nest(body), &BTreeSet::new());
        assert!(!cert.provides_inside_produce);
        assert_eq!(diags[0].code, Some(codes::E0600));
    }

    #[test]
    fn verify_rejects_shadowed_loop() {
        let body = realize(
            "f",
            produce("f", for_loop("x", 2, for_loop("x", 2, provide("f", var("x"))))),
        );
        let (cert, _) = verify_nest(&nest(body), &BTreeSet::new());
        assert!(!cert.names_unique);
    }

    #[test]
    fn verify_rejects_unrealized_call() {
        let call = Expr::Call(Call {
            func: "g".into(),
            args: vec![var("x")],
            value_index: 0,
            ty: ScalarType::I32,
        });
        let mut store = provide("f", var("x"));
        if let Stmt::Provide(p) = &mut store {
            p.values = vec![call];
        }
        let body = realize("f", produce("f", for_loop("x", 2, store)));
        let (cert, _) = verify_nest(&nest(body.clone()), &BTreeSet::new());
        assert!(!cert.calls_resolved);
        let inputs: BTreeSet<String> = ["g".to_string()].into_iter().collect();
        let (cert, _) = verify_nest(&nest(body), &inputs);
        assert!(cert.all_pass());
    }

    #[test]
    fn display_is_indented() {
        let body = produce("f", for_loop("f.s0.x", 4, provide("f", var("f.s0.x"))));
        let text = format!("{}", body);
        assert_eq!(
            text,
            "produce f {\n  for f.s0.x in [0, 0 + 4) {\n    f(f.s0.x) = 1\n  }\n}\n"
        );
    }
}
