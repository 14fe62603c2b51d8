// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all lowering phases.
// Diagnostics point at a `Site` (a Func, one of its stages, or a loop)
// rather than a source span, since pipelines are built programmatically.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`, `W0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Required region is unbounded and no bound or estimate clamps it.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Pipeline graph is malformed (undefined callee, cycle, arity mismatch).
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Store level is not at or outside the compute level.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// A Func is used outside the loop it is computed at.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// compute_at / store_at names a loop that does not exist.
    pub const E0202: DiagCode = DiagCode("E0202");
    /// Illegal tail strategy for the loop being split.
    pub const E0203: DiagCode = DiagCode("E0203");
    /// Vectorized / unrolled loop without a constant extent.
    pub const E0204: DiagCode = DiagCode("E0204");
    /// Invalid definition, directive or output request (unknown var, illegal
    /// reorder, inline with updates).
    pub const E0205: DiagCode = DiagCode("E0205");
    /// GPU thread loop not nested inside a GPU block loop.
    pub const E0206: DiagCode = DiagCode("E0206");
    /// Storage folding requested on a dimension that is not monotonic.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Storage folding factor smaller than the footprint of one iteration.
    pub const E0301: DiagCode = DiagCode("E0301");
    /// Post-lowering nest verification failed.
    pub const E0600: DiagCode = DiagCode("E0600");
    /// Interval arithmetic overflowed and was widened to unbounded.
    pub const W0100: DiagCode = DiagCode("W0100");
    /// Parallel update needs synchronization that was not requested; a mutex was inserted.
    pub const W0300: DiagCode = DiagCode("W0300");
    /// Races explicitly allowed; update left unsynchronized.
    pub const W0301: DiagCode = DiagCode("W0301");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Site ─────────────────────────────────────────────────────────────────

/// The pipeline location a diagnostic refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Site {
    Pipeline,
    Func(String),
    Stage { func: String, stage: usize },
    Loop(String),
}

impl Site {
    pub fn func(name: impl Into<String>) -> Self {
        Site::Func(name.into())
    }

    pub fn stage(func: impl Into<String>, stage: usize) -> Self {
        Site::Stage {
            func: func.into(),
            stage,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Pipeline => write!(f, "<pipeline>"),
            Site::Func(name) => write!(f, "{}", name),
            Site::Stage { func, stage } => write!(f, "{}.s{}", func, stage),
            Site::Loop(name) => write!(f, "loop {}", name),
        }
    }
}

// ── Related site ─────────────────────────────────────────────────────────

/// A secondary location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSite {
    pub site: Site,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a propagated failure.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub site: Option<Site>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any lowering phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub site: Site,
    pub message: String,
    pub hint: Option<String>,
    pub related_sites: Vec<RelatedSite>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related sites, or causes.
    pub fn new(level: DiagLevel, site: Site, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            site,
            message: message.into(),
            hint: None,
            related_sites: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, site: Site, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, site, message).with_code(code)
    }

    pub fn warning(code: DiagCode, site: Site, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, site, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related site.
    pub fn with_related(mut self, site: Site, label: impl Into<String>) -> Self {
        self.related_sites.push(RelatedSite {
            site,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, site: Option<Site>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            site,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        for cause in &self.cause_chain {
            match &cause.site {
                Some(site) => write!(f, "\n  cause: {} (at {})", cause.message, site)?,
                None => write!(f, "\n  cause: {}", cause.message)?,
            }
        }
        Ok(())
    }
}

/// True if any diagnostic in `diags` is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, Site::Pipeline, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(codes::W0300, Site::stage("hist", 1), "mutex inserted");
        assert_eq!(format!("{d}"), "warning[W0300]: mutex inserted");
    }

    #[test]
    fn display_with_cause() {
        let d = Diagnostic::error(codes::E0100, Site::func("f"), "unbounded")
            .with_cause("call f(g(x))", Some(Site::stage("h", 0)));
        assert_eq!(
            format!("{d}"),
            "error[E0100]: unbounded\n  cause: call f(g(x)) (at h.s0)"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::new(DiagLevel::Error, Site::func("f"), "bad fold")
            .with_code(codes::E0300)
            .with_hint("remove fold_storage")
            .with_related(Site::Loop("g.s0.y".into()), "folded over this loop")
            .with_cause("min is not monotonic", None);

        assert_eq!(d.code, Some(codes::E0300));
        assert_eq!(d.hint.as_deref(), Some("remove fold_storage"));
        assert_eq!(d.related_sites.len(), 1);
        assert_eq!(d.cause_chain.len(), 1);
        assert!(has_errors(&[d]));
    }
}
