//! Tail-modulo-cons expansion.
//!
//! For each `Letrec`-bound function marked as a candidate, this pass emits a
//! second, destination-passing-style definition of arity +2 whose first two
//! parameters name a block and an offset to write the result into. Inside
//! candidate bodies, a recursive call sitting immediately under constructor
//! applications becomes a tail call to the DPS companion: the constructor is
//! allocated up front with a placeholder in the hole, the partial block is
//! written to the current destination, and the callee fills the hole.
//!
//! The traversal builds a `Choice` per subterm: a plan that can be
//! materialized either in direct style or in DPS. Constructor applications
//! on the way to a recursive call are not allocated one by one; they are
//! pushed onto a list of deferred frames and collapsed into a single
//! allocation at the leaf, so `x :: y :: f e` costs one write to the parent
//! destination rather than two.

use std::collections::HashMap;
use std::fmt;

use crate::interner::{Ident, LamNodeId, Symbol, ToSymbol};
use crate::lambda::traverse::{duplicate, try_shallow_map};
use crate::lambda::{
    Apply, AssignMode, Constant, DebugEvent, FunctionKind, Lam, LetKind, Lfunction, Mutability,
    Prim, Switch, TailcallHint, ValueKind,
};
use crate::utils::error::ReportableError;
use crate::utils::metadata::Span;
use crate::warnings::{Warning, Warnings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Several arguments of one constructor application contain candidate
    /// calls and no `@tailcall` annotation picks one of them.
    AmbiguousConstructorArguments(Span),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AmbiguousConstructorArguments(_) => write!(
                f,
                "several arguments of this constructor application are TMC calls; \
                 annotate exactly one of them with @tailcall"
            ),
        }
    }
}
impl std::error::Error for Error {}
impl ReportableError for Error {
    fn get_labels(&self) -> Vec<(Span, String)> {
        match self {
            Error::AmbiguousConstructorArguments(span) => {
                vec![(span.clone(), self.to_string())]
            }
        }
    }
}

/// A specialized function visible in the current `Letrec` scope.
#[derive(Clone, Debug)]
struct Special {
    dps_id: Ident,
    arity: usize,
}

type Ctx = HashMap<Ident, Special>;

/// Where a DPS body writes its result.
#[derive(Clone, Debug)]
struct Dst {
    var: Ident,
    offset: Offset,
    loc: Span,
}

#[derive(Clone, Debug)]
enum Offset {
    Lit(i64),
    Var(Ident),
}

impl Offset {
    fn to_lam(&self, span: Span) -> LamNodeId {
        match self {
            Offset::Lit(n) => Lam::Const(Constant::Int(*n)).into_id(span),
            Offset::Var(id) => Lam::Var(*id).into_id(span),
        }
    }
}

/// A deferred constructor frame: a constructor application with a hole.
/// Every `before`/`after` entry is a variable or a constant by the time the
/// frame is pushed, so materializing the frame late cannot reorder effects.
#[derive(Clone, Debug)]
struct Constr {
    tag: u8,
    flag: Mutability,
    shape: Option<Vec<ValueKind>>,
    before: Vec<LamNodeId>,
    after: Vec<LamNodeId>,
    loc: Span,
}

impl Constr {
    fn apply(&self, hole: LamNodeId) -> LamNodeId {
        let mut args = self.before.clone();
        args.push(hole);
        args.extend(self.after.iter().copied());
        Lam::Prim(
            Prim::Makeblock(self.tag, self.flag, self.shape.clone()),
            args,
            self.loc.clone(),
        )
        .into_id(self.loc.clone())
    }

    fn hole_offset(&self) -> i64 {
        self.before.len() as i64
    }
}

/// A subterm with both of its readings.
struct Choice {
    plan: Plan,
    /// Some proper subterm is a candidate call under constructor context.
    has_tmc_calls: bool,
    /// The DPS reading contains strictly more TMC tail calls than the
    /// direct one.
    benefits_from_dps: bool,
    /// The responsible call carries `@tailcall true`.
    explicit_tailcall_request: bool,
    /// How many leaves of the DPS reading materialize the deferred frames;
    /// above one, pushing more frames would duplicate them.
    delayed_use_count: usize,
}

enum Plan {
    /// Terminal subterm. `tail_apply` records a call originally in tail
    /// position, whose demotion in the DPS reading must be reported.
    Return {
        term: LamNodeId,
        tail_apply: Option<Span>,
    },
    /// Call to a specialized candidate.
    TmcCall { dps_id: Ident, ap: Apply },
    /// Constructor application with exactly one TMC-bearing argument.
    Constr {
        tag: u8,
        flag: Mutability,
        shape: Option<Vec<ValueKind>>,
        loc: Span,
        /// Arguments in source order with the chosen one left out, for the
        /// plain direct rebuild.
        before_direct: Vec<LamNodeId>,
        after_direct: Vec<LamNodeId>,
        /// Bindings of the impure neighbors, in evaluation order.
        bindings: Vec<(Ident, LamNodeId)>,
        /// Trivialized neighbors going into the deferred frame.
        before: Vec<LamNodeId>,
        after: Vec<LamNodeId>,
        inner: Box<Choice>,
        span: Span,
    },
    Let {
        kind: LetKind,
        vkind: ValueKind,
        id: Ident,
        def: LamNodeId,
        body: Box<Choice>,
        span: Span,
    },
    Letrec {
        bindings: Vec<(Ident, LamNodeId)>,
        body: Box<Choice>,
        span: Span,
    },
    Seq {
        first: LamNodeId,
        then: Box<Choice>,
        span: Span,
    },
    If {
        cond: LamNodeId,
        then: Box<Choice>,
        els: Box<Choice>,
        span: Span,
    },
    Switch {
        scrut: LamNodeId,
        numconsts: usize,
        consts: Vec<(usize, Choice)>,
        numblocks: usize,
        blocks: Vec<(usize, Choice)>,
        failaction: Option<Box<Choice>>,
        loc: Span,
        span: Span,
    },
    Stringswitch {
        scrut: LamNodeId,
        cases: Vec<(Symbol, Choice)>,
        default: Option<Box<Choice>>,
        loc: Span,
        span: Span,
    },
    Catch {
        body: Box<Choice>,
        label: u32,
        params: Vec<(Ident, ValueKind)>,
        handler: Box<Choice>,
        span: Span,
    },
    Try {
        body: Box<Choice>,
        exn: Ident,
        handler: Box<Choice>,
        span: Span,
    },
    Event {
        inner: Box<Choice>,
        ev: DebugEvent,
        span: Span,
    },
}

impl Choice {
    fn terminal(term: LamNodeId) -> Choice {
        Choice {
            plan: Plan::Return {
                term,
                tail_apply: None,
            },
            has_tmc_calls: false,
            benefits_from_dps: false,
            explicit_tailcall_request: false,
            delayed_use_count: 1,
        }
    }
}

struct Tmc<'w> {
    force: bool,
    warnings: &'w mut Warnings,
}

/// Expand every TMC candidate of the unit.
pub fn expand(force: bool, warnings: &mut Warnings, lam: LamNodeId) -> Result<LamNodeId, Error> {
    log::trace!("tmc_expand");
    let mut pass = Tmc { force, warnings };
    pass.traverse(&Ctx::new(), lam)
}

fn placeholder(span: Span) -> LamNodeId {
    Lam::Const(Constant::Int(0)).into_id(span)
}

fn assign_to_dst(dst: &Dst, value: LamNodeId) -> LamNodeId {
    Lam::Prim(
        Prim::SetfieldComputed(AssignMode::HeapInit),
        vec![
            Lam::Var(dst.var).into_id(dst.loc.clone()),
            dst.offset.to_lam(dst.loc.clone()),
            value,
        ],
        dst.loc.clone(),
    )
    .into_id(dst.loc.clone())
}

fn is_trivial(lam: LamNodeId) -> bool {
    matches!(lam.to_lam(), Lam::Var(_) | Lam::Const(_))
}

fn wrap_bindings(bindings: &[(Ident, LamNodeId)], body: LamNodeId) -> LamNodeId {
    bindings.iter().rev().fold(body, |acc, (id, value)| {
        Lam::Let(LetKind::Strict, ValueKind::Generic, *id, *value, acc).into_id(value.to_span())
    })
}

impl Tmc<'_> {
    /// Rewrite a term in ordinary position: only nested `Letrec`s change.
    fn traverse(&mut self, ctx: &Ctx, lam: LamNodeId) -> Result<LamNodeId, Error> {
        match lam.to_lam() {
            Lam::Letrec(bindings, body) => {
                let (new_ctx, bindings) = self.letrec_bindings(ctx, bindings)?;
                let body = self.traverse(&new_ctx, *body)?;
                Ok(Lam::Letrec(bindings, body).into_id(lam.to_span()))
            }
            _ => try_shallow_map(&mut |c| self.traverse(ctx, c), lam),
        }
    }

    /// Process the bindings of one `Letrec`, specializing candidates.
    fn letrec_bindings(
        &mut self,
        ctx: &Ctx,
        bindings: &[(Ident, LamNodeId)],
    ) -> Result<(Ctx, Vec<(Ident, LamNodeId)>), Error> {
        let mut new_ctx = ctx.clone();
        for (f, value) in bindings {
            if let Some(lf) = candidate_function(self.force, *value) {
                let dps_id = Ident::fresh(format!("{}_dps", f.name).to_symbol());
                new_ctx.insert(
                    *f,
                    Special {
                        dps_id,
                        arity: lf.arity(),
                    },
                );
            }
        }
        let mut out = Vec::new();
        for (f, value) in bindings {
            match candidate_function(self.force, *value) {
                None => out.push((*f, self.traverse(&new_ctx, *value)?)),
                Some(lf) => {
                    let special = new_ctx.get(f).expect("candidate not specialized").clone();
                    let body_choice = self.choice(&new_ctx, true, lf.body)?;
                    if lf.attrs.tmc_candidate && !body_choice.has_tmc_calls {
                        self.warnings
                            .warn(lf.loc.clone(), Warning::UnusedTmcAttribute);
                    }
                    let attrs = crate::lambda::FunctionAttrs {
                        tmc_candidate: false,
                        ..lf.attrs
                    };
                    let direct_body = self.direct(&body_choice)?;
                    let direct_fn = Lam::Function(Lfunction {
                        body: direct_body,
                        attrs,
                        ..lf.clone()
                    })
                    .into_id(value.to_span());

                    let dst_var = Ident::fresh_str("dst");
                    let offset_var = Ident::fresh_str("offset");
                    let dst = Dst {
                        var: dst_var,
                        offset: Offset::Var(offset_var),
                        loc: lf.loc.clone(),
                    };
                    let dps_body = self.dps(&body_choice, true, &dst, &[])?;
                    let mut params = vec![
                        (dst_var, ValueKind::Generic),
                        (offset_var, ValueKind::Int),
                    ];
                    params.extend(lf.params.iter().cloned());
                    let dps_fn = Lam::Function(Lfunction {
                        kind: FunctionKind::Curried,
                        params,
                        return_kind: lf.return_kind,
                        body: dps_body,
                        attrs,
                        loc: lf.loc.clone(),
                    })
                    .into_id(value.to_span());
                    // The two bodies come from one choice; the DPS copy gets
                    // fresh binders so they share no identifiers.
                    let dps_fn = duplicate(dps_fn);
                    out.push((*f, direct_fn));
                    out.push((special.dps_id, dps_fn));
                }
            }
        }
        Ok((new_ctx, out))
    }

    fn choice(&mut self, ctx: &Ctx, tail: bool, lam: LamNodeId) -> Result<Choice, Error> {
        let span = lam.to_span();
        match lam.to_lam() {
            Lam::Apply(ap) => {
                let special = match ap.func.to_lam() {
                    Lam::Var(f) => ctx.get(f),
                    _ => None,
                };
                match special {
                    Some(special)
                        if ap.args.len() == special.arity
                            && ap.tailcall != TailcallHint::Expect(false) =>
                    {
                        let args = ap
                            .args
                            .iter()
                            .map(|a| self.traverse(ctx, *a))
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(Choice {
                            plan: Plan::TmcCall {
                                dps_id: special.dps_id,
                                ap: Apply {
                                    args,
                                    ..ap.clone()
                                },
                            },
                            has_tmc_calls: true,
                            // The DPS reading turns this call into a tail
                            // call; the direct reading cannot.
                            benefits_from_dps: true,
                            explicit_tailcall_request: ap.tailcall
                                == TailcallHint::Expect(true),
                            delayed_use_count: 1,
                        })
                    }
                    _ => {
                        // A call the user opted out of with @tailcall false
                        // is demoted knowingly; don't report it.
                        let report_demotion =
                            tail && ap.tailcall != TailcallHint::Expect(false);
                        let term = self.traverse(ctx, lam)?;
                        Ok(Choice {
                            plan: Plan::Return {
                                term,
                                tail_apply: report_demotion.then(|| ap.loc.clone()),
                            },
                            ..Choice::terminal(term)
                        })
                    }
                }
            }
            Lam::Prim(Prim::Makeblock(tag, flag, shape), args, loc) => {
                self.choice_makeblock(ctx, *tag, *flag, shape.clone(), args, loc.clone(), span)
            }
            Lam::Let(kind, vkind, id, def, body) => {
                let def = self.traverse(ctx, *def)?;
                let body = self.choice(ctx, tail, *body)?;
                Ok(Choice {
                    has_tmc_calls: body.has_tmc_calls,
                    benefits_from_dps: body.benefits_from_dps,
                    explicit_tailcall_request: body.explicit_tailcall_request,
                    delayed_use_count: body.delayed_use_count,
                    plan: Plan::Let {
                        kind: *kind,
                        vkind: *vkind,
                        id: *id,
                        def,
                        body: Box::new(body),
                        span,
                    },
                })
            }
            Lam::Letrec(bindings, body) => {
                let (new_ctx, bindings) = self.letrec_bindings(ctx, bindings)?;
                let body = self.choice(&new_ctx, tail, *body)?;
                Ok(Choice {
                    has_tmc_calls: body.has_tmc_calls,
                    benefits_from_dps: body.benefits_from_dps,
                    explicit_tailcall_request: body.explicit_tailcall_request,
                    delayed_use_count: body.delayed_use_count,
                    plan: Plan::Letrec {
                        bindings,
                        body: Box::new(body),
                        span,
                    },
                })
            }
            Lam::Sequence(a, b) => {
                let first = self.traverse(ctx, *a)?;
                let then = self.choice(ctx, tail, *b)?;
                Ok(Choice {
                    has_tmc_calls: then.has_tmc_calls,
                    benefits_from_dps: then.benefits_from_dps,
                    explicit_tailcall_request: then.explicit_tailcall_request,
                    delayed_use_count: then.delayed_use_count,
                    plan: Plan::Seq {
                        first,
                        then: Box::new(then),
                        span,
                    },
                })
            }
            Lam::Ifthenelse(c, t, e) => {
                let cond = self.traverse(ctx, *c)?;
                let then = self.choice(ctx, tail, *t)?;
                let els = self.choice(ctx, tail, *e)?;
                Ok(Choice {
                    has_tmc_calls: then.has_tmc_calls || els.has_tmc_calls,
                    benefits_from_dps: then.benefits_from_dps || els.benefits_from_dps,
                    explicit_tailcall_request: then.explicit_tailcall_request
                        || els.explicit_tailcall_request,
                    delayed_use_count: then.delayed_use_count + els.delayed_use_count,
                    plan: Plan::If {
                        cond,
                        then: Box::new(then),
                        els: Box::new(els),
                        span,
                    },
                })
            }
            Lam::Switch(scrut, sw, loc) => {
                let scrut = self.traverse(ctx, *scrut)?;
                let consts = sw
                    .consts
                    .iter()
                    .map(|(n, e)| Ok((*n, self.choice(ctx, tail, *e)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let blocks = sw
                    .blocks
                    .iter()
                    .map(|(n, e)| Ok((*n, self.choice(ctx, tail, *e)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let failaction = match sw.failaction {
                    None => None,
                    Some(d) => Some(Box::new(self.choice(ctx, tail, d)?)),
                };
                let arms = consts
                    .iter()
                    .map(|(_, c)| c)
                    .chain(blocks.iter().map(|(_, c)| c))
                    .chain(failaction.iter().map(|c| c.as_ref()));
                let (has, benefits, explicit, duc) = join_arms(arms);
                Ok(Choice {
                    has_tmc_calls: has,
                    benefits_from_dps: benefits,
                    explicit_tailcall_request: explicit,
                    delayed_use_count: duc,
                    plan: Plan::Switch {
                        scrut,
                        numconsts: sw.numconsts,
                        consts,
                        numblocks: sw.numblocks,
                        blocks,
                        failaction,
                        loc: loc.clone(),
                        span,
                    },
                })
            }
            Lam::Stringswitch(scrut, cases, default, loc) => {
                let scrut = self.traverse(ctx, *scrut)?;
                let cases = cases
                    .iter()
                    .map(|(s, e)| Ok((*s, self.choice(ctx, tail, *e)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let default = match default {
                    None => None,
                    Some(d) => Some(Box::new(self.choice(ctx, tail, *d)?)),
                };
                let arms = cases
                    .iter()
                    .map(|(_, c)| c)
                    .chain(default.iter().map(|c| c.as_ref()));
                let (has, benefits, explicit, duc) = join_arms(arms);
                Ok(Choice {
                    has_tmc_calls: has,
                    benefits_from_dps: benefits,
                    explicit_tailcall_request: explicit,
                    delayed_use_count: duc,
                    plan: Plan::Stringswitch {
                        scrut,
                        cases,
                        default,
                        loc: loc.clone(),
                        span,
                    },
                })
            }
            Lam::Staticcatch(body, (label, params), handler) => {
                let body = self.choice(ctx, tail, *body)?;
                let handler = self.choice(ctx, tail, *handler)?;
                Ok(Choice {
                    has_tmc_calls: body.has_tmc_calls || handler.has_tmc_calls,
                    benefits_from_dps: body.benefits_from_dps || handler.benefits_from_dps,
                    explicit_tailcall_request: body.explicit_tailcall_request
                        || handler.explicit_tailcall_request,
                    delayed_use_count: body.delayed_use_count + handler.delayed_use_count,
                    plan: Plan::Catch {
                        body: Box::new(body),
                        label: *label,
                        params: params.clone(),
                        handler: Box::new(handler),
                        span,
                    },
                })
            }
            Lam::Trywith(body, exn, handler) => {
                // The body must return through the handler frame, so its
                // calls are never tail calls of the surrounding function.
                let body = self.choice(ctx, false, *body)?;
                let handler = self.choice(ctx, tail, *handler)?;
                Ok(Choice {
                    has_tmc_calls: body.has_tmc_calls || handler.has_tmc_calls,
                    benefits_from_dps: body.benefits_from_dps || handler.benefits_from_dps,
                    explicit_tailcall_request: body.explicit_tailcall_request
                        || handler.explicit_tailcall_request,
                    delayed_use_count: body.delayed_use_count + handler.delayed_use_count,
                    plan: Plan::Try {
                        body: Box::new(body),
                        exn: *exn,
                        handler: Box::new(handler),
                        span,
                    },
                })
            }
            Lam::Event(e, ev) => {
                let inner = self.choice(ctx, tail, *e)?;
                Ok(Choice {
                    has_tmc_calls: inner.has_tmc_calls,
                    benefits_from_dps: inner.benefits_from_dps,
                    explicit_tailcall_request: inner.explicit_tailcall_request,
                    delayed_use_count: inner.delayed_use_count,
                    plan: Plan::Event {
                        inner: Box::new(inner),
                        ev: ev.clone(),
                        span,
                    },
                })
            }
            // Everything else returns a value directly: variables,
            // constants, other primitives, functions, loops, assignments,
            // raises, sends.
            _ => Ok(Choice::terminal(self.traverse(ctx, lam)?)),
        }
    }

    fn choice_makeblock(
        &mut self,
        ctx: &Ctx,
        tag: u8,
        flag: Mutability,
        shape: Option<Vec<ValueKind>>,
        args: &[LamNodeId],
        loc: Span,
        span: Span,
    ) -> Result<Choice, Error> {
        let choices = args
            .iter()
            .map(|a| self.choice(ctx, false, *a))
            .collect::<Result<Vec<_>, _>>()?;
        let with_calls: Vec<usize> = choices
            .iter()
            .enumerate()
            .filter(|(_, c)| c.has_tmc_calls)
            .map(|(i, _)| i)
            .collect();
        let k = match with_calls.as_slice() {
            [] => {
                let args = choices
                    .iter()
                    .map(|c| self.direct(c))
                    .collect::<Result<Vec<_>, _>>()?;
                let term =
                    Lam::Prim(Prim::Makeblock(tag, flag, shape), args, loc).into_id(span);
                return Ok(Choice::terminal(term));
            }
            [k] => *k,
            _ => {
                let explicit: Vec<usize> = with_calls
                    .iter()
                    .copied()
                    .filter(|i| choices[*i].explicit_tailcall_request)
                    .collect();
                match explicit.as_slice() {
                    [k] => *k,
                    _ => return Err(Error::AmbiguousConstructorArguments(loc)),
                }
            }
        };

        let mut bindings = Vec::new();
        let mut before_direct = Vec::new();
        let mut after_direct = Vec::new();
        let mut before = Vec::new();
        let mut after = Vec::new();
        for (i, c) in choices.iter().enumerate() {
            if i == k {
                continue;
            }
            let direct = self.direct(c)?;
            let trivial = if is_trivial(direct) {
                direct
            } else {
                let b = Ident::fresh_str("arg");
                bindings.push((b, direct));
                Lam::Var(b).into_id(direct.to_span())
            };
            if i < k {
                before_direct.push(direct);
                before.push(trivial);
            } else {
                after_direct.push(direct);
                after.push(trivial);
            }
        }
        let inner = choices.into_iter().nth(k).expect("chosen argument");
        Ok(Choice {
            has_tmc_calls: true,
            // Delaying the construction always pays off: the inner call
            // gets the whole frame chain as one write.
            benefits_from_dps: true,
            explicit_tailcall_request: inner.explicit_tailcall_request,
            delayed_use_count: inner.delayed_use_count,
            plan: Plan::Constr {
                tag,
                flag,
                shape,
                loc,
                before_direct,
                after_direct,
                bindings,
                before,
                after,
                inner: Box::new(inner),
                span,
            },
        })
    }

    /// Materialize the direct reading of a choice.
    fn direct(&mut self, c: &Choice) -> Result<LamNodeId, Error> {
        match &c.plan {
            Plan::Return { term, .. } => Ok(*term),
            Plan::TmcCall { ap, .. } => Ok(Lam::Apply(ap.clone()).into_id(ap.loc.clone())),
            Plan::Constr {
                tag,
                flag,
                shape,
                loc,
                before_direct,
                after_direct,
                bindings,
                before,
                after,
                inner,
                span,
            } => {
                if !inner.benefits_from_dps {
                    let mut args = before_direct.clone();
                    args.push(self.direct(inner)?);
                    args.extend(after_direct.iter().copied());
                    return Ok(Lam::Prim(
                        Prim::Makeblock(*tag, *flag, shape.clone()),
                        args,
                        loc.clone(),
                    )
                    .into_id(span.clone()));
                }
                // Allocate the block with a placeholder in the hole and let
                // the DPS callee fill it in.
                let block = Ident::fresh_str("block");
                let frame = Constr {
                    tag: *tag,
                    flag: *flag,
                    shape: shape.clone(),
                    before: before.clone(),
                    after: after.clone(),
                    loc: loc.clone(),
                };
                let dst = Dst {
                    var: block,
                    offset: Offset::Lit(frame.hole_offset()),
                    loc: loc.clone(),
                };
                let fill = self.dps(inner, false, &dst, &[])?;
                let body = Lam::Sequence(fill, Lam::Var(block).into_id(span.clone()))
                    .into_id(span.clone());
                let alloc = frame.apply(placeholder(loc.clone()));
                let let_block =
                    Lam::Let(LetKind::Strict, ValueKind::Generic, block, alloc, body)
                        .into_id(span.clone());
                Ok(wrap_bindings(bindings, let_block))
            }
            Plan::Let {
                kind,
                vkind,
                id,
                def,
                body,
                span,
            } => Ok(Lam::Let(*kind, *vkind, *id, *def, self.direct(body)?).into_id(span.clone())),
            Plan::Letrec {
                bindings,
                body,
                span,
            } => Ok(Lam::Letrec(bindings.clone(), self.direct(body)?).into_id(span.clone())),
            Plan::Seq { first, then, span } => {
                Ok(Lam::Sequence(*first, self.direct(then)?).into_id(span.clone()))
            }
            Plan::If {
                cond,
                then,
                els,
                span,
            } => Ok(
                Lam::Ifthenelse(*cond, self.direct(then)?, self.direct(els)?)
                    .into_id(span.clone()),
            ),
            Plan::Switch {
                scrut,
                numconsts,
                consts,
                numblocks,
                blocks,
                failaction,
                loc,
                span,
            } => {
                let consts = consts
                    .iter()
                    .map(|(n, c)| Ok((*n, self.direct(c)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let blocks = blocks
                    .iter()
                    .map(|(n, c)| Ok((*n, self.direct(c)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let failaction = match failaction {
                    None => None,
                    Some(c) => Some(self.direct(c)?),
                };
                Ok(Lam::Switch(
                    *scrut,
                    Switch {
                        numconsts: *numconsts,
                        consts,
                        numblocks: *numblocks,
                        blocks,
                        failaction,
                    },
                    loc.clone(),
                )
                .into_id(span.clone()))
            }
            Plan::Stringswitch {
                scrut,
                cases,
                default,
                loc,
                span,
            } => {
                let cases = cases
                    .iter()
                    .map(|(s, c)| Ok((*s, self.direct(c)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let default = match default {
                    None => None,
                    Some(c) => Some(self.direct(c)?),
                };
                Ok(Lam::Stringswitch(*scrut, cases, default, loc.clone()).into_id(span.clone()))
            }
            Plan::Catch {
                body,
                label,
                params,
                handler,
                span,
            } => Ok(Lam::Staticcatch(
                self.direct(body)?,
                (*label, params.clone()),
                self.direct(handler)?,
            )
            .into_id(span.clone())),
            Plan::Try {
                body,
                exn,
                handler,
                span,
            } => Ok(
                Lam::Trywith(self.direct(body)?, *exn, self.direct(handler)?)
                    .into_id(span.clone()),
            ),
            Plan::Event { inner, ev, span } => {
                Ok(Lam::Event(self.direct(inner)?, ev.clone()).into_id(span.clone()))
            }
        }
    }

    /// Materialize the DPS reading: the value of the choice, wrapped in the
    /// deferred frames, ends up written at `dst`.
    fn dps(
        &mut self,
        c: &Choice,
        tail: bool,
        dst: &Dst,
        delayed: &[Constr],
    ) -> Result<LamNodeId, Error> {
        // Frames must not flow into a subtree that materializes them more
        // than once; allocate them here and hand the hole down instead.
        if !delayed.is_empty() && c.delayed_use_count > 1 {
            return self.with_reified(delayed, dst, |this, new_dst| {
                this.dps(c, tail, new_dst, &[])
            });
        }
        match &c.plan {
            Plan::Return { term, tail_apply } => {
                if let Some(call_loc) = tail_apply {
                    self.warnings
                        .warn(call_loc.clone(), Warning::TmcBreaksTailcall);
                }
                let value = delayed.iter().rev().fold(*term, |acc, frame| frame.apply(acc));
                Ok(assign_to_dst(dst, value))
            }
            Plan::TmcCall { dps_id, ap } => {
                if delayed.is_empty() {
                    Ok(self.dps_call(*dps_id, ap, tail, dst))
                } else {
                    let dps_id = *dps_id;
                    let ap = ap.clone();
                    self.with_reified(delayed, dst, |this, new_dst| {
                        Ok(this.dps_call(dps_id, &ap, tail, new_dst))
                    })
                }
            }
            Plan::Constr {
                tag,
                flag,
                shape,
                loc,
                bindings,
                before,
                after,
                inner,
                ..
            } => {
                let frame = Constr {
                    tag: *tag,
                    flag: *flag,
                    shape: shape.clone(),
                    before: before.clone(),
                    after: after.clone(),
                    loc: loc.clone(),
                };
                let mut new_delayed = delayed.to_vec();
                new_delayed.push(frame);
                let inner_code = self.dps(inner, tail, dst, &new_delayed)?;
                Ok(wrap_bindings(bindings, inner_code))
            }
            Plan::Let {
                kind,
                vkind,
                id,
                def,
                body,
                span,
            } => Ok(
                Lam::Let(*kind, *vkind, *id, *def, self.dps(body, tail, dst, delayed)?)
                    .into_id(span.clone()),
            ),
            Plan::Letrec {
                bindings,
                body,
                span,
            } => Ok(
                Lam::Letrec(bindings.clone(), self.dps(body, tail, dst, delayed)?)
                    .into_id(span.clone()),
            ),
            Plan::Seq { first, then, span } => Ok(Lam::Sequence(
                *first,
                self.dps(then, tail, dst, delayed)?,
            )
            .into_id(span.clone())),
            Plan::If {
                cond,
                then,
                els,
                span,
            } => Ok(Lam::Ifthenelse(
                *cond,
                self.dps(then, tail, dst, delayed)?,
                self.dps(els, tail, dst, delayed)?,
            )
            .into_id(span.clone())),
            Plan::Switch {
                scrut,
                numconsts,
                consts,
                numblocks,
                blocks,
                failaction,
                loc,
                span,
            } => {
                let consts = consts
                    .iter()
                    .map(|(n, c)| Ok((*n, self.dps(c, tail, dst, delayed)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let blocks = blocks
                    .iter()
                    .map(|(n, c)| Ok((*n, self.dps(c, tail, dst, delayed)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let failaction = match failaction {
                    None => None,
                    Some(c) => Some(self.dps(c, tail, dst, delayed)?),
                };
                Ok(Lam::Switch(
                    *scrut,
                    Switch {
                        numconsts: *numconsts,
                        consts,
                        numblocks: *numblocks,
                        blocks,
                        failaction,
                    },
                    loc.clone(),
                )
                .into_id(span.clone()))
            }
            Plan::Stringswitch {
                scrut,
                cases,
                default,
                loc,
                span,
            } => {
                let cases = cases
                    .iter()
                    .map(|(s, c)| Ok((*s, self.dps(c, tail, dst, delayed)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                let default = match default {
                    None => None,
                    Some(c) => Some(self.dps(c, tail, dst, delayed)?),
                };
                Ok(Lam::Stringswitch(*scrut, cases, default, loc.clone()).into_id(span.clone()))
            }
            Plan::Catch {
                body,
                label,
                params,
                handler,
                span,
            } => Ok(Lam::Staticcatch(
                self.dps(body, tail, dst, delayed)?,
                (*label, params.clone()),
                self.dps(handler, tail, dst, delayed)?,
            )
            .into_id(span.clone())),
            Plan::Try {
                body,
                exn,
                handler,
                span,
            } => Ok(Lam::Trywith(
                self.dps(body, false, dst, delayed)?,
                *exn,
                self.dps(handler, tail, dst, delayed)?,
            )
            .into_id(span.clone())),
            Plan::Event { inner, ev, span } => Ok(Lam::Event(
                self.dps(inner, tail, dst, delayed)?,
                ev.clone(),
            )
            .into_id(span.clone())),
        }
    }

    fn dps_call(&mut self, dps_id: Ident, ap: &Apply, tail: bool, dst: &Dst) -> LamNodeId {
        let mut args = vec![
            Lam::Var(dst.var).into_id(ap.loc.clone()),
            dst.offset.to_lam(ap.loc.clone()),
        ];
        args.extend(ap.args.iter().copied());
        Lam::Apply(Apply {
            func: Lam::Var(dps_id).into_id(ap.loc.clone()),
            args,
            loc: ap.loc.clone(),
            tailcall: if tail {
                TailcallHint::Expect(true)
            } else {
                TailcallHint::Default
            },
            inlined: ap.inlined,
        })
        .into_id(ap.loc.clone())
    }

    /// Allocate the deferred frames now, write the chain head to `dst`, and
    /// run `k` with the innermost hole as the new destination.
    fn with_reified(
        &mut self,
        delayed: &[Constr],
        dst: &Dst,
        k: impl FnOnce(&mut Self, &Dst) -> Result<LamNodeId, Error>,
    ) -> Result<LamNodeId, Error> {
        debug_assert!(!delayed.is_empty());
        let ids: Vec<Ident> = delayed.iter().map(|_| Ident::fresh_str("block")).collect();
        let last = delayed.len() - 1;
        let new_dst = Dst {
            var: ids[last],
            offset: Offset::Lit(delayed[last].hole_offset()),
            loc: delayed[last].loc.clone(),
        };
        let cont = k(self, &new_dst)?;
        let write = assign_to_dst(
            dst,
            Lam::Var(ids[0]).into_id(delayed[0].loc.clone()),
        );
        let body = Lam::Sequence(write, cont).into_id(dst.loc.clone());
        // The innermost frame holds the placeholder; every enclosing frame
        // holds the next block. Bind inside-out so each allocation can see
        // the one below it.
        Ok((0..=last).fold(body, |acc, i| {
            let hole = if i == last {
                placeholder(delayed[i].loc.clone())
            } else {
                Lam::Var(ids[i + 1]).into_id(delayed[i].loc.clone())
            };
            Lam::Let(
                LetKind::Strict,
                ValueKind::Generic,
                ids[i],
                delayed[i].apply(hole),
                acc,
            )
            .into_id(delayed[i].loc.clone())
        }))
    }
}

fn candidate_function(force: bool, value: LamNodeId) -> Option<Lfunction> {
    match value.to_lam() {
        Lam::Function(lf)
            if lf.kind == FunctionKind::Curried && (lf.attrs.tmc_candidate || force) =>
        {
            Some(lf.clone())
        }
        _ => None,
    }
}

fn join_arms<'a>(arms: impl Iterator<Item = &'a Choice>) -> (bool, bool, bool, usize) {
    let mut has = false;
    let mut benefits = false;
    let mut explicit = false;
    let mut duc = 0usize;
    for c in arms {
        has |= c.has_tmc_calls;
        benefits |= c.benefits_from_dps;
        explicit |= c.explicit_tailcall_request;
        duc += c.delayed_use_count;
    }
    (has, benefits, explicit, duc.max(1))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::lambda::FunctionAttrs;
    use crate::{app, block, field, func, ifthen, int, letrec, var};

    fn tmc_attrs() -> FunctionAttrs {
        FunctionAttrs {
            tmc_candidate: true,
            ..Default::default()
        }
    }

    /// The classic `map`: `fun f l -> if l then f (field 0 l) :: map f
    /// (field 1 l) else []`.
    fn map_letrec() -> (Ident, LamNodeId) {
        let map = ident("map");
        let f = ident("f");
        let l = ident("l");
        let body = ifthen!(
            var!(l),
            block!(
                0,
                vec![
                    app!(var!(f), vec![field!(0, var!(l))]),
                    app!(var!(map), vec![var!(f), field!(1, var!(l))])
                ]
            ),
            int!(0)
        );
        let g = ident("g");
        let xs = ident("xs");
        let input = letrec!(
            vec![(map, func!(vec![f, l], body, tmc_attrs()))],
            app!(var!(map), vec![var!(g), var!(xs)])
        );
        (map, input)
    }

    fn letrec_bindings_of(lam: LamNodeId) -> Vec<(Ident, Lfunction)> {
        match lam.to_lam() {
            Lam::Letrec(bindings, _) => bindings
                .iter()
                .map(|(id, value)| match value.to_lam() {
                    Lam::Function(lf) => (*id, lf.clone()),
                    other => panic!("expected a function binding, got {:?}", other),
                })
                .collect(),
            other => panic!("expected a letrec, got {:?}", other),
        }
    }

    /// All applications anywhere below `lam`, with their tail-position flag
    /// relative to `lam`.
    fn collect_applies(lam: LamNodeId, tail: bool, acc: &mut Vec<(Apply, bool)>) {
        if let Lam::Apply(ap) = lam.to_lam() {
            acc.push((ap.clone(), tail));
        }
        for (child, child_tail) in crate::lambda::traverse::tail_classified_children(lam) {
            collect_applies(child, tail && child_tail, acc);
        }
    }

    #[test]
    fn map_gets_a_dps_companion() {
        let (map, input) = map_letrec();
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        let bindings = letrec_bindings_of(output);
        assert_eq!(bindings.len(), 2);

        let (direct_id, direct_fn) = &bindings[0];
        let (dps_id, dps_fn) = &bindings[1];
        assert_eq!(*direct_id, map);
        assert_eq!(dps_id.name.as_str(), "map_dps");
        assert_eq!(direct_fn.params.len(), 2);
        assert_eq!(dps_fn.params.len(), 4);
        assert_eq!(dps_fn.params[0].1, ValueKind::Generic);
        assert_eq!(dps_fn.params[1].1, ValueKind::Int);
        assert!(warnings.is_empty());

        // The recursive arm of the DPS body writes the partial block to the
        // destination and re-enters map_dps in tail position.
        let mut applies = Vec::new();
        collect_applies(dps_fn.body, true, &mut applies);
        let rec_calls: Vec<_> = applies
            .iter()
            .filter(|(ap, _)| {
                matches!(ap.func.to_lam(), Lam::Var(id) if *id == *dps_id)
            })
            .collect();
        assert_eq!(rec_calls.len(), 1);
        let (rec_call, is_tail) = rec_calls[0];
        assert!(*is_tail, "the DPS self-call must be a tail call");
        assert_eq!(rec_call.args.len(), 4);
        assert_eq!(rec_call.tailcall, TailcallHint::Expect(true));
        // First argument is the freshly allocated block, second the hole
        // offset (1: the head sits in front of it).
        assert!(matches!(rec_call.args[0].to_lam(), Lam::Var(_)));
        assert_eq!(rec_call.args[1], crate::int!(1));

        // The write to the parent's destination happens before the call.
        fn find_setfield_computed(lam: LamNodeId, found: &mut bool) {
            if let Lam::Prim(Prim::SetfieldComputed(_), _, _) = lam.to_lam() {
                *found = true;
            }
            for (child, _) in crate::lambda::traverse::tail_classified_children(lam) {
                find_setfield_computed(child, found);
            }
        }
        let mut found_write = false;
        find_setfield_computed(dps_fn.body, &mut found_write);
        assert!(found_write);

        // The direct body allocates the placeholder block and delegates to
        // the DPS version, then returns the block.
        let mut direct_applies = Vec::new();
        collect_applies(direct_fn.body, true, &mut direct_applies);
        assert!(direct_applies
            .iter()
            .any(|(ap, _)| matches!(ap.func.to_lam(), Lam::Var(id) if *id == *dps_id)));
    }

    #[test]
    fn direct_and_dps_bodies_share_no_binders() {
        let (_, input) = map_letrec();
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        let bindings = letrec_bindings_of(output);
        let collect_binders = |lam: LamNodeId| {
            fn go(lam: LamNodeId, acc: &mut Vec<Ident>) {
                match lam.to_lam() {
                    Lam::Let(_, _, v, _, _) => acc.push(*v),
                    Lam::Function(lf) => acc.extend(lf.params.iter().map(|(p, _)| *p)),
                    _ => {}
                }
                for (child, _) in crate::lambda::traverse::tail_classified_children(lam) {
                    go(child, acc);
                }
            }
            let mut acc = Vec::new();
            go(lam, &mut acc);
            acc
        };
        let direct_binders = collect_binders(bindings[0].1.body);
        let dps_binders = collect_binders(bindings[1].1.body);
        assert!(direct_binders.iter().all(|b| !dps_binders.contains(b)));
    }

    #[test]
    fn ambiguous_constructor_arguments_is_fatal() {
        let map = ident("map");
        let f = ident("f");
        let l = ident("l");
        let body = block!(
            0,
            vec![
                app!(var!(map), vec![var!(f), field!(0, var!(l))]),
                app!(var!(map), vec![var!(f), field!(1, var!(l))])
            ]
        );
        let input = letrec!(
            vec![(map, func!(vec![f, l], body, tmc_attrs()))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        assert!(matches!(
            expand(false, &mut warnings, input),
            Err(Error::AmbiguousConstructorArguments(_))
        ));
    }

    #[test]
    fn explicit_tailcall_disambiguates() {
        let map = ident("map");
        let f = ident("f");
        let l = ident("l");
        let annotated = Lam::Apply(Apply {
            func: var!(map),
            args: vec![var!(f), field!(0, var!(l))],
            loc: crate::dummy_span!(),
            tailcall: TailcallHint::Expect(true),
            inlined: Default::default(),
        })
        .into_id_without_span();
        let body = block!(
            0,
            vec![
                annotated,
                app!(var!(map), vec![var!(f), field!(1, var!(l))])
            ]
        );
        let input = letrec!(
            vec![(map, func!(vec![f, l], body, tmc_attrs()))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        assert_eq!(letrec_bindings_of(output).len(), 2);
    }

    #[test]
    fn unused_candidate_warns_and_still_specializes() {
        let f = ident("f");
        let x = ident("x");
        let input = letrec!(
            vec![(f, func!(vec![x], var!(x), tmc_attrs()))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        assert!(warnings.contains(&Warning::UnusedTmcAttribute));
        assert_eq!(letrec_bindings_of(output).len(), 2);
    }

    #[test]
    fn demoted_tail_call_warns() {
        // The candidate tail-calls a helper that has no DPS version; in the
        // DPS body that call ends up followed by the destination write.
        let f = ident("f");
        let h = ident("h");
        let x = ident("x");
        let input = letrec!(
            vec![(f, func!(vec![x], app!(var!(h), vec![var!(x)]), tmc_attrs()))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        assert!(warnings.contains(&Warning::TmcBreaksTailcall));
        // The attribute is genuinely unused, too.
        assert!(warnings.contains(&Warning::UnusedTmcAttribute));
        assert_eq!(letrec_bindings_of(output).len(), 2);
    }

    #[test]
    fn force_tmc_specializes_unannotated_functions() {
        let f = ident("f");
        let x = ident("x");
        let input = letrec!(
            vec![(f, func!(vec![x], var!(x)))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        let output = expand(true, &mut warnings, input).unwrap();
        assert_eq!(letrec_bindings_of(output).len(), 2);
        // No attribute, so no unused-attribute warning.
        assert!(!warnings.contains(&Warning::UnusedTmcAttribute));
    }

    #[test]
    fn tailcall_false_is_respected() {
        // A call annotated @tailcall false never becomes a DPS call.
        let map = ident("map");
        let f = ident("f");
        let l = ident("l");
        let opted_out = Lam::Apply(Apply {
            func: var!(map),
            args: vec![var!(f), field!(1, var!(l))],
            loc: crate::dummy_span!(),
            tailcall: TailcallHint::Expect(false),
            inlined: Default::default(),
        })
        .into_id_without_span();
        let body = block!(0, vec![field!(0, var!(l)), opted_out]);
        let input = letrec!(
            vec![(map, func!(vec![f, l], body, tmc_attrs()))],
            int!(0)
        );
        let mut warnings = Warnings::new();
        let output = expand(false, &mut warnings, input).unwrap();
        assert!(warnings.contains(&Warning::UnusedTmcAttribute));
        let bindings = letrec_bindings_of(output);
        // The direct body keeps the plain constructor application.
        assert!(matches!(
            bindings[0].1.body.to_lam(),
            Lam::Prim(Prim::Makeblock(..), _, _)
        ));
    }
}
