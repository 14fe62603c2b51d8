// func.rs — Pipeline data model: Funcs, definitions, reduction domains
//
// A `Pipeline` is a set of Funcs (computed or input images), scalar
// params and the output regions to realize. Funcs carry their own
// definitions (pure + updates) and schedule directives. Builders consume
// and return `self` so pipelines read top to bottom.
//
// Preconditions: none.
// Postconditions: none.
// Failure modes: none (well-formedness is checked by `graph` and `schedule`).
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::expr::{Call, Expr, ScalarType};
use crate::schedule::{FoldRequest, FuncSchedule, LoopLevel, StageSchedule};

// ── Reduction domains ───────────────────────────────────────────────────

/// One reduction variable iterating `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RVar {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
}

/// A reduction domain: RVars (innermost first) and optional predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RDom {
    pub vars: Vec<RVar>,
    pub predicates: Vec<Expr>,
}

impl RDom {
    /// Constant ranges `(name, min, extent)`, innermost first.
    pub fn new(ranges: &[(&str, i64, i64)]) -> Self {
        RDom {
            vars: ranges
                .iter()
                .map(|(name, min, extent)| RVar {
                    name: name.to_string(),
                    min: Expr::Int(*min),
                    extent: Expr::Int(*extent),
                })
                .collect(),
            predicates: Vec::new(),
        }
    }

    pub fn from_vars(vars: Vec<RVar>) -> Self {
        RDom {
            vars,
            predicates: Vec::new(),
        }
    }

    /// Restrict the domain to points where `pred` holds.
    pub fn where_(mut self, pred: Expr) -> Self {
        self.predicates.push(pred);
        self
    }
}

// ── Definitions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub args: Vec<Expr>,
    pub values: Vec<Expr>,
    pub rdom: Option<RDom>,
    pub schedule: StageSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundKind {
    /// Exact region to compute, overriding inference.
    Bound,
    /// Fallback used only when inference yields an unbounded region.
    Estimate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredBound {
    pub var: String,
    pub min: i64,
    pub extent: i64,
    pub kind: BoundKind,
}

/// Region an input image is defined over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncKind {
    Computed,
    Input(InputShape),
}

// ── Func ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub args: Vec<String>,
    /// Tuple component types.
    pub types: Vec<ScalarType>,
    pub kind: FuncKind,
    /// `definitions[0]` is the pure definition, the rest are updates.
    pub definitions: Vec<Definition>,
    pub schedule: FuncSchedule,
    pub bounds: Vec<DeclaredBound>,
    /// Declared range of every value this Func produces.
    pub value_range: Option<(i64, i64)>,
}

impl Func {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Func {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            types: vec![ScalarType::I32],
            kind: FuncKind::Computed,
            definitions: Vec::new(),
            schedule: FuncSchedule::default(),
            bounds: Vec::new(),
            value_range: None,
        }
    }

    /// An input image of type `ty` defined over `[mins, mins + extents)`.
    pub fn input(name: &str, ty: ScalarType, mins: &[i64], extents: &[i64]) -> Self {
        let args: Vec<String> = (0..mins.len()).map(|i| format!("_{}", i)).collect();
        Func {
            name: name.to_string(),
            args,
            types: vec![ty],
            kind: FuncKind::Input(InputShape {
                mins: mins.to_vec(),
                extents: extents.to_vec(),
            }),
            definitions: Vec::new(),
            schedule: FuncSchedule {
                compute_level: LoopLevel::Root,
                ..FuncSchedule::default()
            },
            bounds: Vec::new(),
            value_range: None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, FuncKind::Input(_))
    }

    pub fn input_shape(&self) -> Option<&InputShape> {
        match &self.kind {
            FuncKind::Input(shape) => Some(shape),
            FuncKind::Computed => None,
        }
    }

    // ── Definitions ─────────────────────────────────────────────────────

    /// Pure definition with a single value.
    pub fn define(self, value: impl Into<Expr>) -> Self {
        self.define_tuple(vec![value.into()])
    }

    /// Pure definition with one value per tuple component.
    pub fn define_tuple(mut self, values: Vec<Expr>) -> Self {
        if self.types.len() != values.len() {
            self.types = vec![ScalarType::I32; values.len()];
        }
        let args = self.args.iter().map(|a| Expr::Var(a.clone())).collect();
        let def = Definition {
            args,
            values,
            rdom: None,
            schedule: StageSchedule::default(),
        };
        if self.definitions.is_empty() {
            self.definitions.push(def);
        } else {
            self.definitions[0] = def;
        }
        self
    }

    pub fn typed(mut self, types: &[ScalarType]) -> Self {
        self.types = types.to_vec();
        self
    }

    /// Update definition without a reduction domain.
    pub fn update(mut self, args: Vec<Expr>, values: Vec<Expr>) -> Self {
        self.definitions.push(Definition {
            args,
            values,
            rdom: None,
            schedule: StageSchedule::default(),
        });
        self
    }

    /// Update definition iterating over `rdom`.
    pub fn update_over(mut self, rdom: RDom, args: Vec<Expr>, values: Vec<Expr>) -> Self {
        self.definitions.push(Definition {
            args,
            values,
            rdom: Some(rdom),
            schedule: StageSchedule::default(),
        });
        self
    }

    pub fn value_range(mut self, min: i64, max: i64) -> Self {
        self.value_range = Some((min, max));
        self
    }

    // ── Call sites ──────────────────────────────────────────────────────

    /// Call returning tuple component 0.
    pub fn call(&self, args: impl IntoIterator<Item = Expr>) -> Expr {
        self.call_component(args, 0)
    }

    pub fn call_component(&self, args: impl IntoIterator<Item = Expr>, index: usize) -> Expr {
        Expr::Call(Call {
            func: self.name.clone(),
            args: args.into_iter().collect(),
            value_index: index,
            ty: self.types.get(index).copied().unwrap_or(ScalarType::I32),
        })
    }

    // ── Stage structure ─────────────────────────────────────────────────

    pub fn num_stages(&self) -> usize {
        self.definitions.len()
    }

    /// Argument positions that are pure variables in stage `stage`.
    pub fn pure_dims(&self, stage: usize) -> Vec<usize> {
        if stage == 0 {
            return (0..self.args.len()).collect();
        }
        let Some(def) = self.definitions.get(stage) else {
            return Vec::new();
        };
        (0..self.args.len())
            .filter(|&i| def.args.get(i) == Some(&Expr::Var(self.args[i].clone())))
            .collect()
    }

    /// Initial loop variables of a stage, innermost first, flagged when
    /// they are reduction variables. Updates iterate RVars innermost.
    pub fn stage_vars(&self, stage: usize) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        if let Some(rdom) = self.definitions.get(stage).and_then(|d| d.rdom.as_ref()) {
            out.extend(rdom.vars.iter().map(|r| (r.name.clone(), true)));
        }
        out.extend(
            self.pure_dims(stage)
                .into_iter()
                .map(|i| (self.args[i].clone(), false)),
        );
        out
    }

    // ── Schedule builders ───────────────────────────────────────────────

    /// Modify the loop schedule of stage `k`.
    pub fn stage(mut self, k: usize, f: impl FnOnce(StageSchedule) -> StageSchedule) -> Self {
        if let Some(def) = self.definitions.get_mut(k) {
            def.schedule = f(std::mem::take(&mut def.schedule));
        }
        self
    }

    pub fn compute_root(mut self) -> Self {
        self.schedule.compute_level = LoopLevel::Root;
        self
    }

    pub fn compute_inline(mut self) -> Self {
        self.schedule.compute_level = LoopLevel::Inlined;
        self
    }

    /// Compute inside the loop over `var` of the pure stage of `func`.
    pub fn compute_at(mut self, func: &str, var: &str) -> Self {
        self.schedule.compute_level = LoopLevel::at(func, var);
        self
    }

    pub fn compute_at_stage(mut self, func: &str, stage: usize, var: &str) -> Self {
        self.schedule.compute_level = LoopLevel::At {
            func: func.to_string(),
            stage,
            var: var.to_string(),
        };
        self
    }

    pub fn store_root(mut self) -> Self {
        self.schedule.store_level = Some(LoopLevel::Root);
        self
    }

    pub fn store_at(mut self, func: &str, var: &str) -> Self {
        self.schedule.store_level = Some(LoopLevel::at(func, var));
        self
    }

    pub fn bound(mut self, var: &str, min: i64, extent: i64) -> Self {
        self.bounds.push(DeclaredBound {
            var: var.to_string(),
            min,
            extent,
            kind: BoundKind::Bound,
        });
        self
    }

    pub fn estimate(mut self, var: &str, min: i64, extent: i64) -> Self {
        self.bounds.push(DeclaredBound {
            var: var.to_string(),
            min,
            extent,
            kind: BoundKind::Estimate,
        });
        self
    }

    pub fn fold_storage(mut self, var: &str, factor: i64) -> Self {
        self.schedule.folds.push(FoldRequest {
            var: var.to_string(),
            factor,
        });
        self
    }

    /// Storage order, innermost first.
    pub fn reorder_storage(mut self, vars: &[&str]) -> Self {
        self.schedule.storage_order = Some(vars.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn memoize(mut self) -> Self {
        self.schedule.memoize = true;
        self
    }

    pub fn async_(mut self) -> Self {
        self.schedule.is_async = true;
        self
    }

    /// Declared bound or estimate for argument position `dim`.
    pub fn declared_bound(&self, dim: usize) -> Option<&DeclaredBound> {
        let var = self.args.get(dim)?;
        let mut found = None;
        for b in self.bounds.iter().filter(|b| &b.var == var) {
            if b.kind == BoundKind::Bound || found.is_none() {
                found = Some(b);
            }
        }
        found
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────

/// A scalar parameter with an optional declared range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: ScalarType,
    pub range: Option<(i64, i64)>,
}

/// Region of an output Func to realize: `[mins, mins + extents)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub func: String,
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub funcs: Vec<Func>,
    pub params: Vec<Param>,
    pub outputs: Vec<OutputRequest>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_func(mut self, f: Func) -> Self {
        self.funcs.push(f);
        self
    }

    pub fn with_param(mut self, name: &str, ty: ScalarType, range: Option<(i64, i64)>) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
            range,
        });
        self
    }

    pub fn output(mut self, func: &str, mins: &[i64], extents: &[i64]) -> Self {
        self.outputs.push(OutputRequest {
            func: func.to_string(),
            mins: mins.to_vec(),
            extents: extents.to_vec(),
        });
        self
    }

    pub fn func(&self, name: &str) -> Option<&Func> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn func_mut(&mut self, name: &str) -> Option<&mut Func> {
        self.funcs.iter_mut().find(|f| f.name == name)
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.func == name)
    }

    pub fn output_request(&self, name: &str) -> Option<&OutputRequest> {
        self.outputs.iter().find(|o| o.func == name)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
