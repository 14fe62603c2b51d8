// id.rs — Stable identifiers for Funcs and their stages
//
// IDs are allocated in declaration order when a pipeline is indexed and
// are used wherever a deterministic tie-break is needed (realization
// order, report ordering).

use std::fmt;

/// Stable identifier for a Func, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// A definition of a Func: stage 0 is the pure definition, stage k >= 1 the
/// k-th update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId {
    pub func: FuncId,
    pub stage: u32,
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_func: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_func(&mut self) -> FuncId {
        let id = FuncId(self.next_func);
        self.next_func += 1;
        id
    }
}
