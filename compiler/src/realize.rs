// realize.rs — Reference interpreter for lowered loop nests
//
// Executes a `LoopNest` over integer buffers. Every storage slot remembers
// the logical coordinate last stored into it, so reading a folded or
// windowed slot that has since been overwritten is reported instead of
// silently returning the wrong value. Parallel, vectorized and GPU loops
// run sequentially in index order; atomic sections run their body.
//
// Preconditions: `nest` passed verification; every input image and every
//                param the nest reads is supplied.
// Postconditions: `outputs` holds the requested window of every output,
//                 one buffer per tuple component; `stores` counts executed
//                 stores per Func.
// Failure modes: `RealizeError` on missing inputs/params, out-of-bounds
//                access, and uninitialized or stale reads.
// Side effects: none.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::expr::{div_euclid, mod_euclid, BinOp, CmpOp, Expr, ScalarType};
use crate::nest::{LoopNest, OutputRegion, Provide, Realize, Stmt, StorageReduction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealizeError {
    #[error("`{func}` accessed at {coords:?}, outside its realized region")]
    OutOfBounds { func: String, coords: Vec<i64> },

    #[error("`{func}` read at {coords:?} before any value was stored there")]
    UninitializedRead { func: String, coords: Vec<i64> },

    #[error("`{func}` read at {coords:?}, but its storage slot holds {holds:?}")]
    StaleRead {
        func: String,
        coords: Vec<i64>,
        holds: Vec<i64>,
    },

    #[error("input image `{0}` was not supplied")]
    MissingInput(String),

    #[error("param `{0}` has no value")]
    MissingParam(String),

    #[error("variable `{0}` is not bound")]
    UnboundVar(String),
}

// ── Buffers ─────────────────────────────────────────────────────────────

/// A dense integer image over `[mins, mins + extents)`, dimension 0
/// innermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
    pub data: Vec<i64>,
}

impl Buffer {
    pub fn new(mins: &[i64], extents: &[i64]) -> Self {
        let len = extents.iter().map(|&e| e.max(0) as usize).product();
        Buffer {
            mins: mins.to_vec(),
            extents: extents.to_vec(),
            data: vec![0; len],
        }
    }

    pub fn from_fn(mins: &[i64], extents: &[i64], mut f: impl FnMut(&[i64]) -> i64) -> Self {
        let mut buf = Buffer::new(mins, extents);
        let mut i = 0;
        for_each_point(mins, extents, &mut |p| {
            buf.data[i] = f(p);
            i += 1;
        });
        buf
    }

    fn offset(&self, coords: &[i64]) -> Option<usize> {
        if coords.len() != self.mins.len() {
            return None;
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for ((&c, &m), &e) in coords.iter().zip(&self.mins).zip(&self.extents) {
            let rel = c - m;
            if rel < 0 || rel >= e {
                return None;
            }
            offset += rel as usize * stride;
            stride *= e as usize;
        }
        Some(offset)
    }

    pub fn get(&self, coords: &[i64]) -> Option<i64> {
        self.offset(coords).map(|i| self.data[i])
    }

    pub fn set(&mut self, coords: &[i64], value: i64) -> bool {
        match self.offset(coords) {
            Some(i) => {
                self.data[i] = value;
                true
            }
            None => false,
        }
    }
}

/// Visit every point of a box in storage order (dimension 0 fastest).
fn for_each_point(mins: &[i64], extents: &[i64], f: &mut dyn FnMut(&[i64])) {
    if extents.iter().any(|&e| e <= 0) {
        return;
    }
    let mut p = mins.to_vec();
    loop {
        f(&p);
        let mut d = 0;
        loop {
            if d == p.len() {
                return;
            }
            p[d] += 1;
            if p[d] < mins[d] + extents[d] {
                break;
            }
            p[d] = mins[d];
            d += 1;
        }
    }
}

/// Result of running a nest.
#[derive(Debug, Clone, Default)]
pub struct Realization {
    pub outputs: BTreeMap<String, Vec<Buffer>>,
    pub stores: BTreeMap<String, u64>,
}

impl Realization {
    /// Component 0 of an output.
    pub fn output(&self, func: &str) -> Option<&Buffer> {
        self.outputs.get(func).and_then(|c| c.first())
    }

    pub fn store_count(&self, func: &str) -> u64 {
        self.stores.get(func).copied().unwrap_or(0)
    }
}

/// Run `nest` with the given input images and param values.
pub fn realize(
    nest: &LoopNest,
    inputs: &BTreeMap<String, Buffer>,
    params: &BTreeMap<String, i64>,
) -> Result<Realization, RealizeError> {
    let mut m = Machine {
        inputs,
        params,
        requests: &nest.outputs,
        env: Vec::new(),
        allocs: BTreeMap::new(),
        result: Realization::default(),
    };
    m.exec(&nest.body)?;
    Ok(m.result)
}

// ── Storage ─────────────────────────────────────────────────────────────

enum Mapping {
    Direct,
    Fold(i64),
    Window { extent: i64, base: Expr },
}

struct AllocDim {
    min: i64,
    extent: i64,
    mapping: Mapping,
}

impl AllocDim {
    fn physical(&self) -> i64 {
        match &self.mapping {
            Mapping::Direct => self.extent,
            Mapping::Fold(f) => *f,
            Mapping::Window { extent, .. } => *extent,
        }
    }
}

struct Allocation {
    types: Vec<ScalarType>,
    dims: Vec<AllocDim>,
    strides: Vec<usize>,
    /// One vector per tuple component.
    values: Vec<Vec<i64>>,
    /// Logical coordinate held by each slot.
    tags: Vec<Option<Vec<i64>>>,
}

// ── Interpreter ─────────────────────────────────────────────────────────

struct Machine<'a> {
    inputs: &'a BTreeMap<String, Buffer>,
    params: &'a BTreeMap<String, i64>,
    requests: &'a [OutputRegion],
    env: Vec<(String, i64)>,
    allocs: BTreeMap<String, Allocation>,
    result: Realization,
}

impl Machine<'_> {
    fn exec(&mut self, s: &Stmt) -> Result<(), RealizeError> {
        match s {
            Stmt::For(f) => {
                let min = self.eval(&f.min)?;
                let extent = self.eval(&f.extent)?;
                for i in min..min.saturating_add(extent) {
                    self.env.push((f.name.clone(), i));
                    let r = self.exec(&f.body);
                    self.env.pop();
                    r?;
                }
                Ok(())
            }
            Stmt::Let { name, value, body } => {
                let v = self.eval(value)?;
                self.env.push((name.clone(), v));
                let r = self.exec(body);
                self.env.pop();
                r
            }
            Stmt::Realize(r) => self.exec_realize(r),
            Stmt::Produce(p) => {
                if let Some(guard) = &p.guard {
                    if self.eval(&guard.condition)? == 0 {
                        return Ok(());
                    }
                }
                self.exec(&p.body)
            }
            Stmt::Provide(p) => self.exec_provide(p),
            Stmt::If {
                cond,
                then_case,
                else_case,
            } => {
                if self.eval(cond)? != 0 {
                    self.exec(then_case)
                } else if let Some(e) = else_case {
                    self.exec(e)
                } else {
                    Ok(())
                }
            }
            Stmt::Atomic(a) => self.exec(&a.body),
            Stmt::Block(items) => {
                for item in items {
                    self.exec(item)?;
                }
                Ok(())
            }
        }
    }

    fn exec_realize(&mut self, r: &Realize) -> Result<(), RealizeError> {
        let mut dims = Vec::with_capacity(r.dims.len());
        for d in &r.dims {
            let min = self.eval(&d.min)?;
            let extent = self.eval(&d.extent)?.max(0);
            let mapping = match &d.reduction {
                StorageReduction::None => Mapping::Direct,
                StorageReduction::Fold { factor } => Mapping::Fold(*factor),
                StorageReduction::Window { extent, base } => Mapping::Window {
                    extent: *extent,
                    base: base.clone(),
                },
            };
            dims.push(AllocDim {
                min,
                extent,
                mapping,
            });
        }
        let mut order: Vec<usize> = r.storage_order.clone();
        if order.len() != dims.len() {
            order = (0..dims.len()).collect();
        }
        let mut strides = vec![0usize; dims.len()];
        let mut stride = 1usize;
        for &d in &order {
            strides[d] = stride;
            stride *= dims[d].physical().max(0) as usize;
        }
        let alloc = Allocation {
            types: r.types.clone(),
            dims,
            strides,
            values: vec![vec![0; stride]; r.types.len().max(1)],
            tags: vec![None; stride],
        };
        let outer = self.allocs.insert(r.func.clone(), alloc);
        let mut run = self.exec(&r.body);
        if run.is_ok() {
            run = self.copy_out(&r.func);
        }
        match outer {
            Some(prev) => {
                self.allocs.insert(r.func.clone(), prev);
            }
            None => {
                self.allocs.remove(&r.func);
            }
        }
        run
    }

    /// Copy the requested window of an output before its storage goes away.
    fn copy_out(&mut self, func: &str) -> Result<(), RealizeError> {
        let Some(req) = self.requests.iter().find(|o| o.func == func) else {
            return Ok(());
        };
        let components = self.allocs.get(func).map_or(1, |a| a.values.len());
        let mut bufs: Vec<Buffer> = (0..components)
            .map(|_| Buffer::new(&req.mins, &req.extents))
            .collect();
        let mut points = Vec::new();
        for_each_point(&req.mins, &req.extents, &mut |p| points.push(p.to_vec()));
        for p in points {
            for (k, buf) in bufs.iter_mut().enumerate() {
                let v = self.load(func, &p, k)?;
                buf.set(&p, v);
            }
        }
        self.result.outputs.insert(func.to_string(), bufs);
        Ok(())
    }

    fn exec_provide(&mut self, p: &Provide) -> Result<(), RealizeError> {
        if p.predicate_loads {
            if let Some(pred) = &p.predicate {
                if self.eval(pred)? == 0 {
                    return Ok(());
                }
            }
        }
        let mut coords = Vec::with_capacity(p.args.len());
        for a in &p.args {
            coords.push(self.eval(a)?);
        }
        let mut values = Vec::with_capacity(p.values.len());
        for v in &p.values {
            values.push(self.eval(v)?);
        }
        if !p.predicate_loads {
            if let Some(pred) = &p.predicate {
                if self.eval(pred)? == 0 {
                    return Ok(());
                }
            }
        }
        let slot = self.slot(&p.func, &coords)?;
        let Some(alloc) = self.allocs.get_mut(&p.func) else {
            return Err(RealizeError::OutOfBounds {
                func: p.func.clone(),
                coords,
            });
        };
        for (k, v) in values.into_iter().enumerate() {
            let ty = alloc.types.get(k).copied().unwrap_or(ScalarType::I32);
            if let Some(component) = alloc.values.get_mut(k) {
                component[slot] = ty.wrap(v);
            }
        }
        alloc.tags[slot] = Some(coords);
        *self.result.stores.entry(p.func.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Physical slot of a logical coordinate.
    fn slot(&self, func: &str, coords: &[i64]) -> Result<usize, RealizeError> {
        let oob = || RealizeError::OutOfBounds {
            func: func.to_string(),
            coords: coords.to_vec(),
        };
        let alloc = self.allocs.get(func).ok_or_else(oob)?;
        if coords.len() != alloc.dims.len() {
            return Err(oob());
        }
        let mut slot = 0usize;
        for ((&c, d), &stride) in coords.iter().zip(&alloc.dims).zip(&alloc.strides) {
            if c < d.min || c >= d.min + d.extent {
                return Err(oob());
            }
            let phys = match &d.mapping {
                Mapping::Direct => c - d.min,
                Mapping::Fold(f) => mod_euclid(c, *f),
                Mapping::Window { base, .. } => c - self.eval(base)?,
            };
            if phys < 0 || phys >= d.physical() {
                return Err(oob());
            }
            slot += phys as usize * stride;
        }
        Ok(slot)
    }

    fn load(&self, func: &str, coords: &[i64], index: usize) -> Result<i64, RealizeError> {
        if let Some(input) = self.inputs.get(func) {
            if !self.allocs.contains_key(func) {
                return input.get(coords).ok_or_else(|| RealizeError::OutOfBounds {
                    func: func.to_string(),
                    coords: coords.to_vec(),
                });
            }
        }
        if !self.allocs.contains_key(func) {
            return Err(RealizeError::MissingInput(func.to_string()));
        }
        let slot = self.slot(func, coords)?;
        let Some(alloc) = self.allocs.get(func) else {
            return Err(RealizeError::MissingInput(func.to_string()));
        };
        match &alloc.tags[slot] {
            None => Err(RealizeError::UninitializedRead {
                func: func.to_string(),
                coords: coords.to_vec(),
            }),
            Some(held) if held.as_slice() != coords => Err(RealizeError::StaleRead {
                func: func.to_string(),
                coords: coords.to_vec(),
                holds: held.clone(),
            }),
            Some(_) => Ok(alloc.values.get(index).map_or(0, |c| c[slot])),
        }
    }

    fn eval(&self, e: &Expr) -> Result<i64, RealizeError> {
        Ok(match e {
            Expr::Int(v) => *v,
            Expr::Bool(b) => *b as i64,
            Expr::Var(name) => self
                .env
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| RealizeError::UnboundVar(name.clone()))?,
            Expr::Param { name, ty } => ty.wrap(
                self.params
                    .get(name)
                    .copied()
                    .ok_or_else(|| RealizeError::MissingParam(name.clone()))?,
            ),
            Expr::Cast { ty, value } => ty.wrap(self.eval(value)?),
            Expr::Bin { op, a, b } => {
                let x = self.eval(a)?;
                let y = self.eval(b)?;
                let v = match op {
                    BinOp::Add => x.wrapping_add(y),
                    BinOp::Sub => x.wrapping_sub(y),
                    BinOp::Mul => x.wrapping_mul(y),
                    BinOp::Div => div_euclid(x, y),
                    BinOp::Mod => mod_euclid(x, y),
                    BinOp::Min => x.min(y),
                    BinOp::Max => x.max(y),
                };
                e.ty().wrap(v)
            }
            Expr::Cmp { op, a, b } => {
                let x = self.eval(a)?;
                let y = self.eval(b)?;
                let v = match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Eq => x == y,
                    CmpOp::Ne => x != y,
                };
                v as i64
            }
            Expr::And(a, b) => (self.eval(a)? != 0 && self.eval(b)? != 0) as i64,
            Expr::Or(a, b) => (self.eval(a)? != 0 || self.eval(b)? != 0) as i64,
            Expr::Not(a) => (self.eval(a)? == 0) as i64,
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                if self.eval(cond)? != 0 {
                    self.eval(then_value)?
                } else {
                    self.eval(else_value)?
                }
            }
            Expr::Call(c) => {
                let mut coords = Vec::with_capacity(c.args.len());
                for a in &c.args {
                    coords.push(self.eval(a)?);
                }
                self.load(&c.func, &coords, c.value_index)?
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
