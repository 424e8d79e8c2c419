pub mod default_wrappers;
pub mod exits;
pub mod lets;
pub mod local_functions;
pub mod tail_infos;
pub mod tmc;

use crate::interner::{Ident, LamNodeId};
use crate::lambda::{Constant, FunctionKind, Lam, LetKind, Lfunction, Prim, ValueKind};
use crate::warnings::Warnings;

/// Read-only compilation flags, passed explicitly to the pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Compiling to native code: more aggressive let-simplification and the
    /// local-function promotion.
    pub native_code: bool,
    /// Debug build; together with bytecode this disables most rewrites.
    pub debug: bool,
    /// Record tail-call annotations for downstream tooling.
    pub annotations: bool,
    /// Treat every function bound in a `Letrec` as a TMC candidate.
    pub force_tmc: bool,
}

impl Config {
    pub fn optimize(&self) -> bool {
        self.native_code || !self.debug
    }
}

/// Run the whole pipeline on the body of one compilation unit.
///
/// The order is fixed: promoting local functions first creates catches the
/// exit pass can contract, let simplification cleans up bindings the earlier
/// stages introduce, and TMC runs last so that it duplicates already-clean
/// bodies.
pub fn optimize(
    config: &Config,
    warnings: &mut Warnings,
    annotations: &mut tail_infos::CallAnnotations,
    lam: LamNodeId,
) -> Result<LamNodeId, tmc::Error> {
    let lam = if config.optimize() {
        local_functions::promote(warnings, lam)
    } else {
        lam
    };
    let lam = exits::simplify(config.optimize(), lam);
    let lam = lets::simplify(config.optimize(), lam);
    let lam = tmc::expand(config.force_tmc, warnings, lam)?;
    if config.annotations {
        tail_infos::emit(warnings, annotations, lam);
    } else {
        tail_infos::check_expectations(warnings, lam);
    }
    Ok(lam)
}

/// The argument list of an exact (fully-applied, non-partial) application of
/// `lf`, unpacking the tuple of a `Tupled` call. `None` when the call is
/// partial, over-applied, or otherwise inexact.
pub fn exact_application(lf: &Lfunction, args: &[LamNodeId]) -> Option<Vec<LamNodeId>> {
    match lf.kind {
        FunctionKind::Curried => {
            if lf.params.len() == args.len() {
                Some(args.to_vec())
            } else {
                None
            }
        }
        FunctionKind::Tupled => match args {
            [arg] => match arg.to_lam() {
                Lam::Prim(Prim::Makeblock(_, _, _), fields, _)
                    if fields.len() == lf.params.len() =>
                {
                    Some(fields.clone())
                }
                Lam::Const(Constant::Block(_, fields)) if fields.len() == lf.params.len() => {
                    Some(
                        fields
                            .iter()
                            .map(|c| Lam::Const(c.clone()).into_id(arg.to_span()))
                            .collect(),
                    )
                }
                _ => None,
            },
            _ => None,
        },
    }
}

/// Bind each parameter to its argument with a `Let(Strict)` cascade, first
/// argument outermost, so the arguments still evaluate left to right.
pub fn beta_reduce(
    params: &[(Ident, ValueKind)],
    body: LamNodeId,
    args: &[LamNodeId],
) -> LamNodeId {
    debug_assert_eq!(params.len(), args.len());
    params
        .iter()
        .zip(args)
        .rev()
        .fold(body, |acc, ((param, kind), arg)| {
            Lam::Let(LetKind::Strict, *kind, *param, *arg, acc).into_id(arg.to_span())
        })
}
