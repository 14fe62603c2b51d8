// error.rs — Fatal lowering errors
//
// The failures that abort lowering before a loop nest is returned. Passes
// construct these and convert them into `Diagnostic`s (code, site, hint)
// so they flow through the same reporting path as every other diagnostic.
//
// Preconditions: none.
// Postconditions: `code()` is stable per variant.
// Failure modes: none.
// Side effects: none.

use thiserror::Error;

use crate::diag::{codes, DiagCode, Diagnostic, Site};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    /// A required region could not be bounded and nothing clamps it.
    #[error("region of `{func}` required by {site} is unbounded in dimension {dim} (at `{call}`)")]
    UnboundedRegion {
        func: String,
        dim: usize,
        site: Site,
        call: String,
    },

    /// A Func is consumed outside the loop it is computed in.
    #[error("`{func}` is computed at {level}, which does not enclose all of its uses")]
    UsedOutsideComputeLevel { func: String, level: String },

    /// Storage is placed inside the loop the Func is computed at.
    #[error("`{func}` is stored at {store} but computed at {compute}, outside its storage")]
    ComputeOutsideStore {
        func: String,
        store: String,
        compute: String,
    },

    /// A vectorized or unrolled loop has no constant extent.
    #[error("loop `{loop_name}` is {kind} but its extent `{extent}` is not a constant")]
    NonConstantExtent {
        func: String,
        stage: usize,
        loop_name: String,
        kind: &'static str,
        extent: String,
    },

    /// Explicit fold requested where the footprint is not monotonic.
    #[error("cannot fold storage of `{func}` in `{var}`: {reason}")]
    NonMonotonicFold {
        func: String,
        var: String,
        reason: String,
    },

    /// Explicit fold factor smaller than the live window.
    #[error("fold factor {factor} for `{func}` in `{var}` is smaller than the {needed} values live at once")]
    FoldFactorTooSmall {
        func: String,
        var: String,
        factor: i64,
        needed: i64,
    },
}

impl LowerError {
    pub fn code(&self) -> DiagCode {
        match self {
            LowerError::UnboundedRegion { .. } => codes::E0100,
            LowerError::UsedOutsideComputeLevel { .. } => codes::E0201,
            LowerError::ComputeOutsideStore { .. } => codes::E0200,
            LowerError::NonConstantExtent { .. } => codes::E0204,
            LowerError::NonMonotonicFold { .. } => codes::E0300,
            LowerError::FoldFactorTooSmall { .. } => codes::E0301,
        }
    }

    pub fn site(&self) -> Site {
        match self {
            LowerError::UnboundedRegion { site, .. } => site.clone(),
            LowerError::NonConstantExtent { func, stage, .. } => Site::stage(func, *stage),
            LowerError::UsedOutsideComputeLevel { func, .. }
            | LowerError::ComputeOutsideStore { func, .. }
            | LowerError::NonMonotonicFold { func, .. }
            | LowerError::FoldFactorTooSmall { func, .. } => Site::func(func),
        }
    }
}

impl From<LowerError> for Diagnostic {
    fn from(err: LowerError) -> Self {
        let diag = Diagnostic::error(err.code(), err.site(), err.to_string());
        match &err {
            LowerError::UnboundedRegion { func, .. } => diag
                .with_hint(format!(
                    "declare `.bound()` or `.estimate()` on `{}`, or a value range for the index",
                    func
                ))
                .with_related(Site::func(func), "producer"),
            LowerError::UsedOutsideComputeLevel { func, .. } => diag.with_hint(format!(
                "compute `{}` at a loop enclosing every consumer, or compute_root()",
                func
            )),
            LowerError::NonMonotonicFold { .. } => {
                diag.with_hint("remove the fold_storage directive for this dimension")
            }
            LowerError::FoldFactorTooSmall { needed, .. } => {
                diag.with_hint(format!("use a fold factor of at least {}", needed))
            }
            _ => diag,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_region_names_call_site() {
        let err = LowerError::UnboundedRegion {
            func: "lut".into(),
            dim: 0,
            site: Site::stage("out", 0),
            call: "lut(input(x))".into(),
        };
        assert_eq!(err.code(), codes::E0100);
        let diag = Diagnostic::from(err);
        assert_eq!(
            diag.to_string(),
            "error[E0100]: region of `lut` required by out.s0 is unbounded in dimension 0 (at `lut(input(x))`)\n  \
             hint: declare `.bound()` or `.estimate()` on `lut`, or a value range for the index"
        );
    }

    #[test]
    fn fold_errors_carry_codes() {
        let err = LowerError::FoldFactorTooSmall {
            func: "f".into(),
            var: "y".into(),
            factor: 2,
            needed: 3,
        };
        assert_eq!(err.code(), codes::E0301);
        assert_eq!(err.site(), Site::func("f"));
        let err = LowerError::NonMonotonicFold {
            func: "f".into(),
            var: "y".into(),
            reason: "footprint is not monotonic".into(),
        };
        assert_eq!(Diagnostic::from(err).code, Some(codes::E0300));
    }
}
