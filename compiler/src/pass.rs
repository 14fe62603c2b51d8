// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the lowering passes, their dependency edges, and the artifacts
// they produce. Used by the pipeline runner to compute minimal pass
// subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each lowering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    Inline,
    Order,
    Regions,
    Synthesize,
    Storage,
    SkipStages,
    Atomics,
    Verify,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Graph,        // FuncGraph
    ScheduleCert, // ScheduleCert
    Inlined,      // Pipeline
    Order,        // Vec<String>
    Regions,      // RegionResult
    Nest,         // LoopNest
    StageStates,  // BTreeMap<(String, usize), StageState>
    Storage,      // Vec<StorageDecision>
    Guards,       // Vec<SkipReport>
    Sync,         // Vec<StageSync>
    NestCert,     // NestCert
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable postconditions of a pass.
pub trait StageCert {
    fn all_pass(&self) -> bool;

    /// Named obligations and whether each holds, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a lowering pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::Graph, ArtifactId::ScheduleCert],
            invalidation_key: "pipeline",
            invariants: "callees defined, no cycles, S1-S6 obligations verified",
        },
        PassId::Inline => PassDescriptor {
            name: "inline",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Inlined],
            invalidation_key: "pipeline + graph",
            invariants: "no call to an inlined Func remains",
        },
        PassId::Order => PassDescriptor {
            name: "order",
            inputs: &[PassId::Inline],
            outputs: &[ArtifactId::Order],
            invalidation_key: "inlined pipeline",
            invariants: "producers precede consumers, ties in declaration order",
        },
        PassId::Regions => PassDescriptor {
            name: "regions",
            inputs: &[PassId::Order],
            outputs: &[ArtifactId::Regions],
            invalidation_key: "inlined pipeline + order",
            invariants: "every Func region covers all of its consumers' reads",
        },
        PassId::Synthesize => PassDescriptor {
            name: "synthesize",
            inputs: &[PassId::Order],
            outputs: &[ArtifactId::Nest, ArtifactId::StageStates],
            invalidation_key: "inlined pipeline + order",
            invariants: "every stage NestBuilt, bound lets outside each produce",
        },
        PassId::Storage => PassDescriptor {
            name: "storage",
            inputs: &[PassId::Synthesize],
            outputs: &[ArtifactId::Nest, ArtifactId::Storage],
            invalidation_key: "nest + storage options",
            invariants: "allocations sized, folds never smaller than the live window",
        },
        PassId::SkipStages => PassDescriptor {
            name: "skip_stages",
            inputs: &[PassId::Storage],
            outputs: &[ArtifactId::Nest, ArtifactId::Guards],
            invalidation_key: "nest + order",
            invariants: "guards are true wherever a produced value is read",
        },
        PassId::Atomics => PassDescriptor {
            name: "atomics",
            inputs: &[PassId::SkipStages],
            outputs: &[ArtifactId::Nest, ArtifactId::Sync],
            invalidation_key: "nest + stage schedules",
            invariants: "racing parallel updates are synchronized",
        },
        PassId::Verify => PassDescriptor {
            name: "verify",
            inputs: &[PassId::Atomics],
            outputs: &[ArtifactId::NestCert],
            invalidation_key: "nest",
            invariants: "N1-N5 obligations verified",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 9] = [
    PassId::Validate,
    PassId::Inline,
    PassId::Order,
    PassId::Regions,
    PassId::Synthesize,
    PassId::Storage,
    PassId::SkipStages,
    PassId::Atomics,
    PassId::Verify,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
