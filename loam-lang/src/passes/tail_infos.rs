//! Final traversal recording which calls are in tail position, for
//! downstream tooling, and checking `@tailcall` expectations.

use crate::interner::LamNodeId;
use crate::lambda::traverse::tail_classified_children;
use crate::lambda::{Lam, TailcallHint};
use crate::utils::metadata::Span;
use crate::warnings::{Warning, Warnings};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Tail,
    Stack,
}

/// Append-only sink of call-site annotations, owned by the host.
#[derive(Debug, Default)]
pub struct CallAnnotations {
    items: Vec<(Span, CallKind)>,
}

impl CallAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, span: Span, kind: CallKind) {
        self.items.push((span, kind));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Span, CallKind)> {
        self.items.iter()
    }
}

/// Record an annotation for every application and method call, and warn
/// about `@tailcall true` sites that did not end up in tail position.
pub fn emit(warnings: &mut Warnings, annotations: &mut CallAnnotations, lam: LamNodeId) {
    walk(true, &mut Some(annotations), warnings, lam);
}

/// Expectation checking only, for builds that do not record annotations.
pub fn check_expectations(warnings: &mut Warnings, lam: LamNodeId) {
    walk(true, &mut None, warnings, lam);
}

fn walk(
    is_tail: bool,
    annotations: &mut Option<&mut CallAnnotations>,
    warnings: &mut Warnings,
    lam: LamNodeId,
) {
    let kind = if is_tail { CallKind::Tail } else { CallKind::Stack };
    match lam.to_lam() {
        Lam::Apply(ap) => {
            if let Some(sink) = annotations {
                sink.record(ap.loc.clone(), kind);
            }
            if ap.tailcall == TailcallHint::Expect(true) && !is_tail {
                warnings.warn(ap.loc.clone(), Warning::ExpectTailcall);
            }
        }
        Lam::Send(_, _, _, loc) => {
            if let Some(sink) = annotations {
                sink.record(loc.clone(), kind);
            }
        }
        _ => {}
    }
    for (child, child_tail) in tail_classified_children(lam) {
        walk(is_tail && child_tail, annotations, warnings, child);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::lambda::Apply;
    use crate::{app, int, seq, var};

    #[test]
    fn tail_and_stack_calls_are_classified()  {
        let f = ident("f");
        let g = ident("g");
        // g () is discarded (stack), f () is the result (tail).
        let input = seq!(app!(var!(g), vec![int!(0)]), app!(var!(f), vec![int!(0)]));
        let mut warnings = Warnings::new();
        let mut annotations = CallAnnotations::new();
        emit(&mut warnings, &mut annotations, input);
        let kinds: Vec<CallKind> = annotations.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, vec![CallKind::Stack, CallKind::Tail]);
    }

    #[test]
    fn broken_expectation_warns() {
        let f = ident("f");
        let call = Lam::Apply(Apply {
            func: var!(f),
            args: vec![int!(0)],
            loc: crate::dummy_span!(),
            tailcall: TailcallHint::Expect(true),
            inlined: Default::default(),
        })
        .into_id_without_span();
        // The annotated call is in discarded position.
        let input = seq!(call, int!(1));
        let mut warnings = Warnings::new();
        check_expectations(&mut warnings, input);
        assert!(warnings.contains(&Warning::ExpectTailcall));
    }
}
