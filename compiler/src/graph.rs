// graph.rs — Call graph and realization order of a pipeline
//
// Indexes Funcs by declaration order, records who calls whom, checks that
// every call, param and definition is well formed, and orders the Funcs
// reachable from the outputs producers-first.
//
// Preconditions: none.
// Postconditions: `order` lists every Func the outputs depend on exactly
//                 once, callees before callers, ties broken by declaration
//                 order. Self-references of update definitions are not
//                 edges.
// Failure modes: undefined callee/param, arity or tuple-index mismatch,
//                duplicate names, and cycles → E0101; malformed
//                definitions → E0205.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::diag::{codes, Diagnostic, Site};
use crate::expr::Expr;
use crate::func::{Func, FuncKind, Pipeline};
use crate::id::{FuncId, IdAllocator};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FuncGraph {
    /// Func names indexed by `FuncId`.
    pub names: Vec<String>,
    /// Callees of each Func, self excluded.
    pub callees: Vec<BTreeSet<FuncId>>,
    /// Funcs whose updates read their own earlier values.
    pub self_recursive: BTreeSet<FuncId>,
}

impl FuncGraph {
    pub fn id(&self, name: &str) -> Option<FuncId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn name(&self, id: FuncId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn callees_of(&self, id: FuncId) -> &BTreeSet<FuncId> {
        &self.callees[id.0 as usize]
    }

    /// Funcs calling `id`, in declaration order.
    pub fn consumers_of(&self, id: FuncId) -> Vec<FuncId> {
        (0..self.names.len() as u32)
            .map(FuncId)
            .filter(|c| self.callees[c.0 as usize].contains(&id))
            .collect()
    }
}

#[derive(Debug)]
pub struct GraphResult {
    pub graph: FuncGraph,
    /// Realization order: producers first.
    pub order: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for FuncGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names.iter().enumerate() {
            let callees: Vec<&str> = self.callees[i]
                .iter()
                .map(|c| self.name(*c))
                .collect();
            writeln!(f, "{} <- [{}]", name, callees.join(", "))?;
        }
        Ok(())
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Build the call graph of `pipeline` and its realization order.
pub fn build_graph(pipeline: &Pipeline) -> GraphResult {
    let mut ctx = GraphCtx::new(pipeline);
    ctx.index_funcs();
    ctx.check_definitions();
    if ctx.diagnostics.iter().any(Diagnostic::is_error) {
        return ctx.build_result(Vec::new());
    }
    let order = ctx.realization_order();
    ctx.build_result(order)
}

// ── Internal context ────────────────────────────────────────────────────────

struct GraphCtx<'a> {
    pipeline: &'a Pipeline,
    graph: FuncGraph,
    ids: BTreeMap<String, FuncId>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> GraphCtx<'a> {
    fn new(pipeline: &'a Pipeline) -> Self {
        GraphCtx {
            pipeline,
            graph: FuncGraph::default(),
            ids: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn error(&mut self, code: crate::diag::DiagCode, site: Site, message: String) {
        self.diagnostics
            .push(Diagnostic::error(code, site, message));
    }

    fn build_result(self, order: Vec<String>) -> GraphResult {
        GraphResult {
            graph: self.graph,
            order,
            diagnostics: self.diagnostics,
        }
    }

    fn index_funcs(&mut self) {
        let mut alloc = IdAllocator::new();
        let pipeline = self.pipeline;
        for func in &pipeline.funcs {
            let id = alloc.alloc_func();
            if self.ids.insert(func.name.clone(), id).is_some() {
                self.error(
                    codes::E0101,
                    Site::func(&func.name),
                    format!("Func `{}` is defined more than once", func.name),
                );
            }
            self.graph.names.push(func.name.clone());
            self.graph.callees.push(BTreeSet::new());
        }
    }

    // ── Definition checks ───────────────────────────────────────────────

    fn check_definitions(&mut self) {
        let pipeline = self.pipeline;
        for (i, func) in pipeline.funcs.iter().enumerate() {
            let id = FuncId(i as u32);
            if func.types.is_empty() {
                self.error(
                    codes::E0205,
                    Site::func(&func.name),
                    format!("`{}` has no value types", func.name),
                );
            }
            match &func.kind {
                FuncKind::Input(shape) => {
                    if shape.mins.len() != func.args.len()
                        || shape.extents.len() != func.args.len()
                        || shape.extents.iter().any(|e| *e < 0)
                    {
                        self.error(
                            codes::E0205,
                            Site::func(&func.name),
                            format!("input `{}` has a malformed shape", func.name),
                        );
                    }
                    continue;
                }
                FuncKind::Computed => {}
            }
            if func.definitions.is_empty() {
                self.error(
                    codes::E0205,
                    Site::func(&func.name),
                    format!("`{}` is called or realized but never defined", func.name),
                );
                continue;
            }
            for (stage, def) in func.definitions.iter().enumerate() {
                let site = Site::stage(&func.name, stage);
                if def.args.len() != func.args.len() {
                    self.error(
                        codes::E0205,
                        site.clone(),
                        format!(
                            "stage {} of `{}` stores {} coordinates but `{}` has {} dimensions",
                            stage,
                            func.name,
                            def.args.len(),
                            func.name,
                            func.args.len()
                        ),
                    );
                }
                if def.values.len() != func.types.len() {
                    self.error(
                        codes::E0205,
                        site.clone(),
                        format!(
                            "stage {} of `{}` defines {} values but `{}` has {} tuple components",
                            stage,
                            func.name,
                            def.values.len(),
                            func.name,
                            func.types.len()
                        ),
                    );
                }
                if stage > 0 {
                    self.check_update_vars(func, stage, site.clone());
                }
                let mut exprs: Vec<&Expr> = def.args.iter().chain(&def.values).collect();
                if let Some(rdom) = &def.rdom {
                    exprs.extend(rdom.predicates.iter());
                    for r in &rdom.vars {
                        exprs.push(&r.min);
                        exprs.push(&r.extent);
                    }
                }
                for e in exprs {
                    self.check_expr(id, e, &site);
                }
            }
        }
    }

    /// Pure variables of an update may only appear at their own position.
    fn check_update_vars(&mut self, func: &Func, stage: usize, site: Site) {
        let def = &func.definitions[stage];
        let pure = func.pure_dims(stage);
        let pure_names: BTreeSet<String> = pure.iter().map(|&i| func.args[i].clone()).collect();
        for (i, arg) in def.args.iter().enumerate() {
            if pure.contains(&i) {
                continue;
            }
            for name in pure_names.iter().filter(|n| arg.uses_var(n)) {
                self.error(
                    codes::E0205,
                    site.clone(),
                    format!(
                        "pure variable `{}` of `{}` appears at position {} of stage {}",
                        name, func.name, i, stage
                    ),
                );
            }
        }
        let rvars: BTreeSet<String> = def
            .rdom
            .iter()
            .flat_map(|r| r.vars.iter().map(|v| v.name.clone()))
            .collect();
        let mut free = BTreeSet::new();
        for e in def.args.iter().chain(&def.values) {
            free.extend(e.free_vars());
        }
        for v in free {
            if !rvars.contains(&v) && !pure_names.contains(&v) {
                self.error(
                    codes::E0205,
                    site.clone(),
                    format!(
                        "stage {} of `{}` uses `{}`, which is neither a pure variable at its own position nor a reduction variable",
                        stage, func.name, v
                    ),
                );
            }
        }
    }

    fn check_expr(&mut self, id: FuncId, e: &Expr, site: &Site) {
        let mut problems = Vec::new();
        e.walk(&mut |n| match n {
            Expr::Call(c) => {
                match self.pipeline.func(&c.func) {
                    None => problems.push(format!("call to undefined Func `{}`", c.func)),
                    Some(callee) => {
                        if callee.args.len() != c.args.len() {
                            problems.push(format!(
                                "`{}` has {} dimensions but is called with {} arguments",
                                c.func,
                                callee.args.len(),
                                c.args.len()
                            ));
                        }
                        if c.value_index >= callee.types.len().max(1) {
                            problems.push(format!(
                                "`{}` has no tuple component {}",
                                c.func, c.value_index
                            ));
                        }
                    }
                }
            }
            Expr::Param { name, .. } => {
                if self.pipeline.param(name).is_none() {
                    problems.push(format!("undefined param `{}`", name));
                }
            }
            _ => {}
        });
        for msg in problems {
            self.error(codes::E0101, site.clone(), msg);
        }
        for callee in e.called_funcs() {
            match self.ids.get(&callee) {
                Some(&cid) if cid == id => {
                    self.graph.self_recursive.insert(id);
                }
                Some(&cid) => {
                    self.graph.callees[id.0 as usize].insert(cid);
                }
                None => {}
            }
        }
    }

    // ── Ordering ────────────────────────────────────────────────────────

    /// Funcs reachable from the outputs.
    fn live_funcs(&self) -> BTreeSet<FuncId> {
        let mut live = BTreeSet::new();
        let mut stack: Vec<FuncId> = self
            .pipeline
            .outputs
            .iter()
            .filter_map(|o| self.ids.get(&o.func).copied())
            .collect();
        while let Some(id) = stack.pop() {
            if live.insert(id) {
                stack.extend(self.graph.callees_of(id).iter().copied());
            }
        }
        live
    }

    /// Kahn's algorithm over live Funcs; the ready set is ordered by id.
    fn realization_order(&mut self) -> Vec<String> {
        let live = self.live_funcs();
        let mut pending: BTreeMap<FuncId, usize> = live
            .iter()
            .map(|&id| (id, self.graph.callees_of(id).len()))
            .collect();
        let mut ready: BTreeSet<FuncId> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(live.len());
        while let Some(id) = ready.pop_first() {
            pending.remove(&id);
            order.push(id);
            for consumer in self.graph.consumers_of(id) {
                if let Some(n) = pending.get_mut(&consumer) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }
        if !pending.is_empty() {
            for cycle in detect_cycles(&self.graph, &live) {
                let names: Vec<&str> = cycle.iter().map(|c| self.graph.name(*c)).collect();
                let first = names.first().copied().unwrap_or_default().to_string();
                let msg = format!("cyclic pipeline: {} -> {}", names.join(" -> "), first);
                self.error(codes::E0101, Site::func(first), msg);
            }
            return Vec::new();
        }
        let names: Vec<String> = order
            .iter()
            .map(|id| self.graph.name(*id).to_string())
            .collect();
        debug!(order = ?names, "realization order");
        names
    }
}

/// All cycles among `live` Funcs, found by depth-first search.
fn detect_cycles(graph: &FuncGraph, live: &BTreeSet<FuncId>) -> Vec<Vec<FuncId>> {
    let mut cycles = Vec::new();
    let mut state: BTreeMap<FuncId, u8> = BTreeMap::new(); // 1 = on path, 2 = done
    let mut path = Vec::new();
    for &id in live {
        if !state.contains_key(&id) {
            dfs_cycle(id, graph, &mut state, &mut path, &mut cycles);
        }
    }
    cycles
}

fn dfs_cycle(
    node: FuncId,
    graph: &FuncGraph,
    state: &mut BTreeMap<FuncId, u8>,
    path: &mut Vec<FuncId>,
    cycles: &mut Vec<Vec<FuncId>>,
) {
    state.insert(node, 1);
    path.push(node);
    for &next in graph.callees_of(node) {
        match state.get(&next).copied().unwrap_or(0) {
            0 => dfs_cycle(next, graph, state, path, cycles),
            1 => {
                if let Some(pos) = path.iter().position(|&n| n == next) {
                    cycles.push(path[pos..].to_vec());
                }
            }
            _ => {}
        }
    }
    path.pop();
    state.insert(node, 2);
}

// ── Tests ───────────────────────────────────────────────────────────────────
