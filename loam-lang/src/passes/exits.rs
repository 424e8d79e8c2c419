//! Contraction of static exceptions.
//!
//! A first traversal counts, for every exit label, how many `Staticraise`
//! sites target it and how deep inside `Trywith` bodies those sites sit. The
//! rewrite then drops catches whose label is never raised, inlines handlers
//! with a single raise site (as long as inlining does not move the handler
//! across a try boundary), and forwards labels whose handler is nothing but
//! another raise. A few other control-flow contractions ride along because
//! they expose more exits: beta-reduction of exact applications, folding of
//! the reverse/direct application primitives, and removal of identity-shaped
//! primitives.

use std::collections::HashMap;

use crate::interner::{Ident, LamNodeId};
use crate::lambda::{
    Apply, Constant, InlineAttr, Lam, LetKind, Lfunction, Prim, Switch, TailcallHint, ValueKind,
};
use crate::lambda::traverse::rename;
use crate::passes::{beta_reduce, exact_application};

#[derive(Clone, Copy, Debug, Default)]
struct ExitInfo {
    count: usize,
    max_depth: usize,
}

struct SimplifyExits {
    optimize: bool,
    exits: HashMap<u32, ExitInfo>,
    /// label -> (formals, simplified handler) for handlers being inlined.
    subst: HashMap<u32, (Vec<(Ident, ValueKind)>, LamNodeId)>,
}

pub fn simplify(optimize: bool, lam: LamNodeId) -> LamNodeId {
    log::trace!("simplify_exits");
    let mut pass = SimplifyExits {
        optimize,
        exits: HashMap::new(),
        subst: HashMap::new(),
    };
    pass.count(0, lam);
    pass.simplif(0, lam)
}

impl SimplifyExits {
    fn get_exit(&self, i: u32) -> ExitInfo {
        self.exits.get(&i).copied().unwrap_or_default()
    }

    fn incr_exit(&mut self, i: u32, nb: usize, depth: usize) {
        let info = self.exits.entry(i).or_default();
        info.count += nb;
        info.max_depth = info.max_depth.max(depth);
    }

    fn count(&mut self, try_depth: usize, lam: LamNodeId) {
        match lam.to_lam() {
            Lam::Var(_) | Lam::Const(_) => {}
            Lam::Apply(ap) => {
                self.count(try_depth, ap.func);
                ap.args.iter().for_each(|a| self.count(try_depth, *a));
            }
            Lam::Function(lf) => self.count(try_depth, lf.body),
            Lam::Let(_, _, _, value, body) => {
                self.count(try_depth, *body);
                self.count(try_depth, *value);
            }
            Lam::Letrec(bindings, body) => {
                bindings.iter().for_each(|(_, e)| self.count(try_depth, *e));
                self.count(try_depth, *body);
            }
            Lam::Prim(_, args, _) => args.iter().for_each(|a| self.count(try_depth, *a)),
            Lam::Switch(scrut, sw, _) => {
                self.count_default(try_depth, sw);
                self.count(try_depth, *scrut);
                sw.consts.iter().for_each(|(_, e)| self.count(try_depth, *e));
                sw.blocks.iter().for_each(|(_, e)| self.count(try_depth, *e));
            }
            Lam::Stringswitch(scrut, cases, default, _) => {
                self.count(try_depth, *scrut);
                cases.iter().for_each(|(_, e)| self.count(try_depth, *e));
                if let Some(d) = default {
                    self.count(try_depth, *d);
                    if cases.len() >= 2 {
                        // The back end replicates the default across the
                        // remaining cases.
                        self.count(try_depth, *d);
                    }
                }
            }
            Lam::Staticraise(i, args) => {
                self.incr_exit(*i, 1, try_depth);
                args.iter().for_each(|a| self.count(try_depth, *a));
            }
            Lam::Staticcatch(body, (i, params), handler)
                if params.is_empty() && is_bare_raise(*handler) =>
            {
                // The handler aliases label j: every raise of i in the body
                // will be retargeted to j, so credit j with i's raises.
                let j = match handler.to_lam() {
                    Lam::Staticraise(j, _) => *j,
                    _ => unreachable!(),
                };
                self.count(try_depth, *body);
                let ic = self.get_exit(*i);
                self.incr_exit(j, ic.count, try_depth.max(ic.max_depth));
            }
            Lam::Staticcatch(body, (i, _), handler) => {
                self.count(try_depth, *body);
                // If the body never raises i the handler will be dropped,
                // so its own exits must not count.
                if self.get_exit(*i).count > 0 {
                    self.count(try_depth, *handler);
                }
            }
            Lam::Trywith(body, _, handler) => {
                self.count(try_depth + 1, *body);
                self.count(try_depth, *handler);
            }
            Lam::Ifthenelse(c, t, e) => {
                self.count(try_depth, *c);
                self.count(try_depth, *t);
                self.count(try_depth, *e);
            }
            Lam::Sequence(a, b) => {
                self.count(try_depth, *a);
                self.count(try_depth, *b);
            }
            Lam::While(c, b) => {
                self.count(try_depth, *c);
                self.count(try_depth, *b);
            }
            Lam::For(_, lo, hi, _, body) => {
                self.count(try_depth, *lo);
                self.count(try_depth, *hi);
                self.count(try_depth, *body);
            }
            Lam::Assign(_, e) => self.count(try_depth, *e),
            Lam::Send(met, obj, args, _) => {
                self.count(try_depth, *met);
                self.count(try_depth, *obj);
                args.iter().for_each(|a| self.count(try_depth, *a));
            }
            Lam::Event(e, _) => self.count(try_depth, *e),
            Lam::Ifused(_, e) => self.count(try_depth, *e),
        }
    }

    fn count_default(&mut self, try_depth: usize, sw: &Switch) {
        let Some(default) = sw.failaction else {
            return;
        };
        let nconsts = sw.consts.len();
        let nblocks = sw.blocks.len();
        if nconsts < sw.numconsts && nblocks < sw.numblocks {
            // Both arm families are partial: the back end will emit the
            // default twice.
            self.count(try_depth, default);
            self.count(try_depth, default);
        } else {
            assert!(nconsts < sw.numconsts || nblocks < sw.numblocks);
            self.count(try_depth, default);
        }
    }

    fn simplif(&mut self, try_depth: usize, lam: LamNodeId) -> LamNodeId {
        let span = lam.to_span();
        match lam.to_lam() {
            Lam::Var(_) | Lam::Const(_) => lam,
            Lam::Apply(ap) => {
                if self.optimize {
                    if let Lam::Function(lf) = ap.func.to_lam() {
                        if let Some(exact_args) = exact_application(lf, &ap.args) {
                            let reduced = beta_reduce(&lf.params, lf.body, &exact_args);
                            return self.simplif(try_depth, reduced);
                        }
                    }
                }
                Lam::Apply(Apply {
                    func: self.simplif(try_depth, ap.func),
                    args: ap.args.iter().map(|a| self.simplif(try_depth, *a)).collect(),
                    ..ap.clone()
                })
                .into_id(span)
            }
            Lam::Function(lf) => Lam::Function(Lfunction {
                body: self.simplif(try_depth, lf.body),
                ..lf.clone()
            })
            .into_id(span),
            Lam::Let(kind, vkind, v, value, body) => Lam::Let(
                *kind,
                *vkind,
                *v,
                self.simplif(try_depth, *value),
                self.simplif(try_depth, *body),
            )
            .into_id(span),
            Lam::Letrec(bindings, body) => Lam::Letrec(
                bindings
                    .iter()
                    .map(|(v, e)| (*v, self.simplif(try_depth, *e)))
                    .collect(),
                self.simplif(try_depth, *body),
            )
            .into_id(span),
            Lam::Prim(p, args, loc) => {
                let args: Vec<_> = args.iter().map(|a| self.simplif(try_depth, *a)).collect();
                self.contract_prim(p, args, loc.clone(), span)
            }
            Lam::Switch(scrut, sw, loc) => Lam::Switch(
                self.simplif(try_depth, *scrut),
                Switch {
                    numconsts: sw.numconsts,
                    consts: sw
                        .consts
                        .iter()
                        .map(|(n, e)| (*n, self.simplif(try_depth, *e)))
                        .collect(),
                    numblocks: sw.numblocks,
                    blocks: sw
                        .blocks
                        .iter()
                        .map(|(n, e)| (*n, self.simplif(try_depth, *e)))
                        .collect(),
                    failaction: sw.failaction.map(|d| self.simplif(try_depth, d)),
                },
                loc.clone(),
            )
            .into_id(span),
            Lam::Stringswitch(scrut, cases, default, loc) => Lam::Stringswitch(
                self.simplif(try_depth, *scrut),
                cases
                    .iter()
                    .map(|(s, e)| (*s, self.simplif(try_depth, *e)))
                    .collect(),
                default.map(|d| self.simplif(try_depth, d)),
                loc.clone(),
            )
            .into_id(span),
            Lam::Staticraise(i, args) if args.is_empty() => match self.subst.get(i) {
                Some((_, handler)) => *handler,
                None => lam,
            },
            Lam::Staticraise(i, args) => {
                let args: Vec<_> = args.iter().map(|a| self.simplif(try_depth, *a)).collect();
                match self.subst.get(i) {
                    Some((xs, handler)) => {
                        // Bind fresh copies of the formals to the actuals,
                        // then alpha-rename the handler into them; the
                        // handler may be inlined at several places through
                        // an alias chain, and bound identifiers must stay
                        // unique.
                        let ys: Vec<(Ident, ValueKind)> =
                            xs.iter().map(|(x, k)| (x.rename(), *k)).collect();
                        let map: HashMap<Ident, Ident> = xs
                            .iter()
                            .zip(&ys)
                            .map(|((x, _), (y, _))| (*x, *y))
                            .collect();
                        let renamed = rename(&map, *handler);
                        ys.iter()
                            .zip(&args)
                            .rev()
                            .fold(renamed, |acc, ((y, kind), arg)| {
                                Lam::Let(LetKind::Strict, *kind, *y, *arg, acc)
                                    .into_id(span.clone())
                            })
                    }
                    None => Lam::Staticraise(*i, args).into_id(span),
                }
            }
            Lam::Staticcatch(body, (i, params), handler)
                if params.is_empty() && is_bare_raise(*handler) =>
            {
                let handler = self.simplif(try_depth, *handler);
                self.subst.insert(*i, (vec![], handler));
                self.simplif(try_depth, *body)
            }
            Lam::Staticcatch(body, (i, params), handler) => {
                let ExitInfo { count, max_depth } = self.get_exit(*i);
                if count == 0 {
                    // Dead handler.
                    self.simplif(try_depth, *body)
                } else if count == 1 && max_depth <= try_depth {
                    // A single raise site, and inlining does not move the
                    // handler inside a deeper try block.
                    assert!(max_depth == try_depth);
                    let handler = self.simplif(try_depth, *handler);
                    self.subst.insert(*i, (params.clone(), handler));
                    self.simplif(try_depth, *body)
                } else {
                    Lam::Staticcatch(
                        self.simplif(try_depth, *body),
                        (*i, params.clone()),
                        self.simplif(try_depth, *handler),
                    )
                    .into_id(span)
                }
            }
            Lam::Trywith(body, exn, handler) => {
                let body = self.simplif(try_depth + 1, *body);
                Lam::Trywith(body, *exn, self.simplif(try_depth, *handler)).into_id(span)
            }
            Lam::Ifthenelse(c, t, e) => Lam::Ifthenelse(
                self.simplif(try_depth, *c),
                self.simplif(try_depth, *t),
                self.simplif(try_depth, *e),
            )
            .into_id(span),
            Lam::Sequence(a, b) => {
                Lam::Sequence(self.simplif(try_depth, *a), self.simplif(try_depth, *b))
                    .into_id(span)
            }
            Lam::While(c, b) => {
                Lam::While(self.simplif(try_depth, *c), self.simplif(try_depth, *b))
                    .into_id(span)
            }
            Lam::For(v, lo, hi, dir, body) => Lam::For(
                *v,
                self.simplif(try_depth, *lo),
                self.simplif(try_depth, *hi),
                *dir,
                self.simplif(try_depth, *body),
            )
            .into_id(span),
            Lam::Assign(v, e) => Lam::Assign(*v, self.simplif(try_depth, *e)).into_id(span),
            Lam::Send(met, obj, args, loc) => Lam::Send(
                self.simplif(try_depth, *met),
                self.simplif(try_depth, *obj),
                args.iter().map(|a| self.simplif(try_depth, *a)).collect(),
                loc.clone(),
            )
            .into_id(span),
            Lam::Event(e, ev) => Lam::Event(self.simplif(try_depth, *e), ev.clone()).into_id(span),
            Lam::Ifused(v, e) => Lam::Ifused(*v, self.simplif(try_depth, *e)).into_id(span),
        }
    }

    /// Primitive contractions that expose more direct control flow. The
    /// arguments are already simplified.
    fn contract_prim(
        &mut self,
        p: &Prim,
        args: Vec<LamNodeId>,
        loc: crate::utils::metadata::Span,
        span: crate::utils::metadata::Span,
    ) -> LamNodeId {
        match (p, args.as_slice()) {
            (Prim::Revapply, [x, f]) => self.fold_apply(*f, *x, loc, span),
            (Prim::Dirapply, [f, x]) => self.fold_apply(*f, *x, loc, span),
            (Prim::Identity, [e]) => *e,
            (Prim::Extcall(name), [tag, block]) if name.as_str() == "obj_with_tag" => {
                match (tag.to_lam(), block.to_lam()) {
                    (
                        Lam::Const(Constant::Int(tag)),
                        Lam::Prim(Prim::Makeblock(_, mutability, shape), fields, mkloc),
                    ) => Lam::Prim(
                        Prim::Makeblock(*tag as u8, *mutability, shape.clone()),
                        fields.clone(),
                        mkloc.clone(),
                    )
                    .into_id(span),
                    (Lam::Const(Constant::Int(tag)), Lam::Const(Constant::Block(_, fields))) => {
                        Lam::Const(Constant::Block(*tag as u8, fields.clone())).into_id(span)
                    }
                    _ => Lam::Prim(p.clone(), args, loc).into_id(span),
                }
            }
            _ => Lam::Prim(p.clone(), args, loc).into_id(span),
        }
    }

    /// `x |> f` and `f @@ x` become a plain application; when `f` is itself
    /// an application the extra argument folds into its argument list.
    fn fold_apply(
        &mut self,
        f: LamNodeId,
        x: LamNodeId,
        loc: crate::utils::metadata::Span,
        span: crate::utils::metadata::Span,
    ) -> LamNodeId {
        let folded = match f.to_lam() {
            Lam::Apply(ap) => Some(ap.clone()),
            Lam::Event(inner, _) => match inner.to_lam() {
                Lam::Apply(ap) => Some(ap.clone()),
                _ => None,
            },
            _ => None,
        };
        match folded {
            Some(mut ap) => {
                ap.args.push(x);
                ap.loc = loc;
                Lam::Apply(ap).into_id(span)
            }
            None => Lam::Apply(Apply {
                func: f,
                args: vec![x],
                loc,
                tailcall: TailcallHint::Default,
                inlined: InlineAttr::Default,
            })
            .into_id(span),
        }
    }
}

fn is_bare_raise(handler: LamNodeId) -> bool {
    matches!(handler.to_lam(), Lam::Staticraise(_, args) if args.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::lambda::traverse::alpha_eq;
    use crate::lambda::ValueKind;
    use crate::{app, catch, func, int, let_, prim, raise_, try_, var};

    fn simplify_opt(lam: crate::interner::LamNodeId) -> crate::interner::LamNodeId {
        simplify(true, lam)
    }

    #[test]
    fn single_use_handler_is_inlined() {
        let a = ident("a");
        let input = catch!(
            raise_!(7, vec![int!(42)]),
            7,
            vec![a],
            prim!(Prim::Addint, vec![var!(a), int!(1)])
        );

        let a2 = ident("a");
        let expected = let_!(
            LetKind::Strict,
            ValueKind::Generic,
            a2,
            int!(42),
            prim!(Prim::Addint, vec![var!(a2), int!(1)])
        );
        assert!(alpha_eq(simplify_opt(input), expected));
    }

    #[test]
    fn dead_handler_is_dropped() {
        let a = ident("a");
        let input = catch!(int!(5), 3, vec![a], var!(a));
        assert_eq!(simplify_opt(input), int!(5));
    }

    #[test]
    fn alias_handler_forwards_to_outer_label() {
        // catch (catch (exit 1) with (1) -> exit 2) with (2) -> 9
        // The inner handler aliases label 2; both catches go away.
        let inner = catch!(raise_!(1, vec![]), 1, Vec::<crate::interner::Ident>::new(), raise_!(2, vec![]));
        let input = catch!(inner, 2, Vec::<crate::interner::Ident>::new(), int!(9));
        assert_eq!(simplify_opt(input), int!(9));
    }

    #[test]
    fn raise_under_try_blocks_inlining() {
        // catch (try (exit 8) with e -> 0) with (8) -> 1
        // Inlining would move the handler into the try scope.
        let e = ident("e");
        let input = catch!(
            try_!(raise_!(8, vec![]), e, int!(0)),
            8,
            Vec::<crate::interner::Ident>::new(),
            int!(1)
        );
        let output = simplify_opt(input);
        assert!(matches!(output.to_lam(), Lam::Staticcatch(..)));
    }

    #[test]
    fn exact_application_beta_reduces() {
        let x = ident("x");
        let input = app!(func!(vec![x], var!(x)), vec![int!(7)]);
        let expected = let_!(x, int!(7), var!(x));
        assert!(alpha_eq(simplify_opt(input), expected));
    }

    #[test]
    fn revapply_folds_into_application() {
        let f = ident("f");
        let input = prim!(Prim::Revapply, vec![int!(1), var!(f)]);
        let output = simplify_opt(input);
        match output.to_lam() {
            Lam::Apply(ap) => {
                assert_eq!(ap.func, var!(f));
                assert_eq!(ap.args, vec![int!(1)]);
            }
            other => panic!("expected an application, got {:?}", other),
        }
    }

    #[test]
    fn identity_is_removed() {
        let input = prim!(Prim::Identity, vec![int!(3)]);
        assert_eq!(simplify_opt(input), int!(3));
    }

    #[test]
    fn handler_used_twice_is_kept() {
        let a = ident("a");
        let c = ident("c");
        let input = catch!(
            crate::ifthen!(var!(c), raise_!(4, vec![int!(1)]), raise_!(4, vec![int!(2)])),
            4,
            vec![a],
            var!(a)
        );
        let output = simplify_opt(input);
        assert!(matches!(output.to_lam(), Lam::Staticcatch(..)));
        // A seq of two raises in the body plus the handler: nothing inlined.
        assert!(alpha_eq(output, input));
    }
}
