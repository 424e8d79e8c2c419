//! User-facing diagnostics that never change the result of a pass.

use std::fmt;

use crate::utils::error::ReportableError;
use crate::utils::metadata::Span;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// A function was marked as a tail-modulo-cons candidate but its body
    /// contains no call that the expansion can use.
    UnusedTmcAttribute,
    /// The TMC rewrite moved a tail call to an unspecialized callee into
    /// non-tail position.
    TmcBreaksTailcall,
    /// A call annotated as an expected tail call is not in tail position
    /// after all rewrites.
    ExpectTailcall,
    /// A function required to become a static continuation could not be
    /// turned into one.
    InliningImpossible,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnusedTmcAttribute => {
                write!(f, "this function is marked @tail_mod_cons but is never applied in TMC position")
            }
            Warning::TmcBreaksTailcall => {
                write!(f, "the TMC transformation moved this call out of tail position")
            }
            Warning::ExpectTailcall => write!(f, "expected tailcall"),
            Warning::InliningImpossible => {
                write!(f, "this function cannot be compiled into a static continuation")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Emitted {
    pub warning: Warning,
    pub span: Span,
}

impl fmt::Display for Emitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.warning.fmt(f)
    }
}
impl std::error::Error for Emitted {}
impl ReportableError for Emitted {
    fn get_labels(&self) -> Vec<(Span, String)> {
        vec![(self.span.clone(), self.warning.to_string())]
    }
    fn is_warning(&self) -> bool {
        true
    }
}

/// Append-only sink the passes write into. Owned by the host; a pass only
/// ever pushes.
#[derive(Debug, Default)]
pub struct Warnings {
    items: Vec<Emitted>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, span: Span, warning: Warning) {
        log::debug!("warning at {:?}: {}", span, warning);
        self.items.push(Emitted { warning, span });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Emitted> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, warning: &Warning) -> bool {
        self.items.iter().any(|e| e.warning == *warning)
    }
}
