// inline.rs — Substitute inlined Funcs into their call sites
//
// Preconditions: `order` is the realization order from `graph`; schedules
//                have been checked (inlined Funcs have a single stage).
// Postconditions: no definition of a remaining Func calls an inlined
//                 Func; the returned order omits inlined Funcs.
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeMap;

use tracing::debug;

use crate::expr::{cast, Expr};
use crate::func::{Func, FuncKind, Pipeline};
use crate::schedule::LoopLevel;

#[derive(Debug, Clone)]
pub struct InlineResult {
    pub pipeline: Pipeline,
    /// Realization order without inlined Funcs.
    pub order: Vec<String>,
    pub inlined: Vec<String>,
}

pub fn is_inlined(pipeline: &Pipeline, func: &Func) -> bool {
    matches!(func.kind, FuncKind::Computed)
        && func.schedule.compute_level == LoopLevel::Inlined
        && func.definitions.len() == 1
        && !pipeline.is_output(&func.name)
}

/// Inline every Func scheduled `Inlined`, in realization order so that
/// inlined producers are expanded before their inlined consumers.
pub fn inline_funcs(pipeline: &Pipeline, order: &[String]) -> InlineResult {
    let mut out = pipeline.clone();
    let mut inlined = Vec::new();
    for name in order {
        let Some(func) = out.func(name) else {
            continue;
        };
        if !is_inlined(&out, func) {
            continue;
        }
        let func = func.clone();
        for other in out.funcs.iter_mut().filter(|f| f.name != func.name) {
            for def in &mut other.definitions {
                for e in def.args.iter_mut().chain(def.values.iter_mut()) {
                    *e = inline_calls(e, &func);
                }
                if let Some(rdom) = &mut def.rdom {
                    for p in &mut rdom.predicates {
                        *p = inline_calls(p, &func);
                    }
                }
            }
        }
        debug!(func = %func.name, "inlined");
        inlined.push(func.name.clone());
    }
    let order = order
        .iter()
        .filter(|n| !inlined.contains(n))
        .cloned()
        .collect();
    InlineResult {
        pipeline: out,
        order,
        inlined,
    }
}

/// Replace calls to `func` in `e` by its pure definition.
pub fn inline_calls(e: &Expr, func: &Func) -> Expr {
    let Some(def) = func.definitions.first() else {
        return e.clone();
    };
    e.replace_calls(&func.name, &mut |call, args| {
        let map: BTreeMap<String, Expr> = func.args.iter().cloned().zip(args).collect();
        let value = def
            .values
            .get(call.value_index)
            .cloned()
            .unwrap_or(Expr::Int(0))
            .substitute(&map);
        if value.ty() == call.ty {
            value
        } else {
            cast(call.ty, value)
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
