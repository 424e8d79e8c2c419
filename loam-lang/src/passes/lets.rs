//! Simplification of let bindings: dead-binding elimination, copy
//! propagation, beta-reduction of immediate applications, curry-merging, and
//! promotion of single-field mutable blocks to `Variable` bindings.
//!
//! The first traversal counts uses of every let-bound identifier. A use seen
//! inside the same function/loop frame as its binding counts once; a use on
//! the far side of a lambda or loop boundary counts twice, which is enough
//! to keep the single-use rewrites away from anything that may run more than
//! once per binding. The second traversal rewrites under those counts.

use std::cell::Cell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use crate::interner::{Ident, LamNodeId};
use crate::lambda::traverse::{free_variables, try_shallow_map};
use crate::lambda::{
    Apply, Lam, LetKind, Lfunction, FunctionKind, Mutability, Prim, Switch, ValueKind,
    MAX_FUNCTION_ARITY,
};
use crate::passes::{beta_reduce, exact_application};

struct SimplifyLets {
    optimize: bool,
    /// Total use count per let-bound identifier.
    occ: HashMap<Ident, Rc<Cell<usize>>>,
    /// Identifiers bound in the current function/loop frame.
    bv: HashMap<Ident, Rc<Cell<usize>>>,
    /// Single-use and copy-propagated bindings being substituted.
    subst: HashMap<Ident, LamNodeId>,
}

pub fn simplify(optimize: bool, lam: LamNodeId) -> LamNodeId {
    log::trace!("simplify_lets");
    let mut pass = SimplifyLets {
        optimize,
        occ: HashMap::new(),
        bv: HashMap::new(),
        subst: HashMap::new(),
    };
    pass.count(lam);
    pass.simplif(lam)
}

impl SimplifyLets {
    fn count_var(&self, v: Ident) -> usize {
        self.occ.get(&v).map_or(0, |c| c.get())
    }

    /// Enter a `let`: start a counter for the bound identifier, visible in
    /// the current frame. Returns the entry to restore afterwards.
    fn bind_var(&mut self, v: Ident) -> Option<Rc<Cell<usize>>> {
        let counter = Rc::new(Cell::new(0));
        self.occ.insert(v, counter.clone());
        self.bv.insert(v, counter)
    }

    fn unbind_var(&mut self, v: Ident, prev: Option<Rc<Cell<usize>>>) {
        match prev {
            Some(prev) => {
                self.bv.insert(v, prev);
            }
            None => {
                self.bv.remove(&v);
            }
        }
    }

    fn use_var(&mut self, v: Ident, n: usize) {
        if let Some(counter) = self.bv.get(&v) {
            counter.set(counter.get() + n);
        } else if let Some(counter) = self.occ.get(&v) {
            // Bound in an enclosing frame: the use may run any number of
            // times, so force it out of the single-use range.
            counter.set(counter.get() + 2);
        }
        // Not let-bound: ignore.
    }

    /// Count uses with an empty local frame (entering a lambda or a loop).
    fn count_new_frame(&mut self, lam: LamNodeId) {
        let saved = mem::take(&mut self.bv);
        self.count(lam);
        self.bv = saved;
    }

    fn count(&mut self, lam: LamNodeId) {
        match lam.to_lam() {
            Lam::Const(_) => {}
            Lam::Var(v) => self.use_var(*v, 1),
            Lam::Apply(ap) => {
                let mut done = false;
                if self.optimize {
                    if let Lam::Function(lf) = ap.func.to_lam() {
                        if let Some(exact_args) = exact_application(lf, &ap.args) {
                            self.count(beta_reduce(&lf.params, lf.body, &exact_args));
                            done = true;
                        }
                    }
                }
                if !done {
                    self.count(ap.func);
                    ap.args.iter().for_each(|a| self.count(*a));
                }
            }
            Lam::Function(lf) => self.count_new_frame(lf.body),
            Lam::Let(kind, _, v, value, body)
                if self.optimize && *kind != LetKind::Variable && is_var(*value) =>
            {
                // The binding will be substituted away, so every use of v in
                // the body becomes a use of w.
                let w = match value.to_lam() {
                    Lam::Var(w) => *w,
                    _ => unreachable!(),
                };
                let prev = self.bind_var(*v);
                self.count(*body);
                self.unbind_var(*v, prev);
                let uses = self.count_var(*v);
                self.use_var(w, uses);
            }
            Lam::Let(kind, _, v, value, body) => {
                let prev = self.bind_var(*v);
                self.count(*body);
                self.unbind_var(*v, prev);
                // A droppable binding that ends up unused takes its value's
                // uses with it.
                if *kind == LetKind::Strict
                    || *kind == LetKind::Variable
                    || self.count_var(*v) > 0
                {
                    self.count(*value);
                }
            }
            Lam::Letrec(bindings, body) => {
                bindings.iter().for_each(|(_, e)| self.count(*e));
                self.count(*body);
            }
            Lam::Prim(_, args, _) => args.iter().for_each(|a| self.count(*a)),
            Lam::Switch(scrut, sw, _) => {
                self.count_default(sw);
                self.count(*scrut);
                sw.consts.iter().for_each(|(_, e)| self.count(*e));
                sw.blocks.iter().for_each(|(_, e)| self.count(*e));
            }
            Lam::Stringswitch(scrut, cases, default, _) => {
                self.count(*scrut);
                cases.iter().for_each(|(_, e)| self.count(*e));
                if let Some(d) = default {
                    self.count(*d);
                    if cases.len() >= 2 {
                        self.count(*d);
                    }
                }
            }
            Lam::Staticraise(_, args) => args.iter().for_each(|a| self.count(*a)),
            Lam::Staticcatch(body, _, handler) => {
                self.count(*body);
                self.count(*handler);
            }
            Lam::Trywith(body, _, handler) => {
                self.count(*body);
                self.count(*handler);
            }
            Lam::Ifthenelse(c, t, e) => {
                self.count(*c);
                self.count(*t);
                self.count(*e);
            }
            Lam::Sequence(a, b) => {
                self.count(*a);
                self.count(*b);
            }
            Lam::While(c, b) => {
                self.count_new_frame(*c);
                self.count_new_frame(*b);
            }
            Lam::For(_, lo, hi, _, body) => {
                self.count(*lo);
                self.count(*hi);
                self.count_new_frame(*body);
            }
            // Writing a cell is not a use of it.
            Lam::Assign(_, e) => self.count(*e),
            Lam::Send(met, obj, args, _) => {
                self.count(*met);
                self.count(*obj);
                args.iter().for_each(|a| self.count(*a));
            }
            Lam::Event(e, _) => self.count(*e),
            Lam::Ifused(v, e) => {
                if self.count_var(*v) > 0 {
                    self.count(*e);
                }
            }
        }
    }

    fn count_default(&mut self, sw: &Switch) {
        let Some(default) = sw.failaction else {
            return;
        };
        let nconsts = sw.consts.len();
        let nblocks = sw.blocks.len();
        if nconsts < sw.numconsts && nblocks < sw.numblocks {
            self.count(default);
            self.count(default);
        } else {
            assert!(nconsts < sw.numconsts || nblocks < sw.numblocks);
            self.count(default);
        }
    }

    /// `Let` constructor that erases the binding when the body is just the
    /// bound variable.
    fn mklet(
        &self,
        kind: LetKind,
        vkind: ValueKind,
        v: Ident,
        value: LamNodeId,
        body: LamNodeId,
    ) -> LamNodeId {
        match body.to_lam() {
            Lam::Var(w) if self.optimize && *w == v => value,
            _ => Lam::Let(kind, vkind, v, value, body).into_id(value.to_span()),
        }
    }

    fn simplif(&mut self, lam: LamNodeId) -> LamNodeId {
        let span = lam.to_span();
        match lam.to_lam() {
            Lam::Var(v) => match self.subst.get(v) {
                Some(replacement) => *replacement,
                None => lam,
            },
            Lam::Const(_) => lam,
            Lam::Apply(ap) => {
                let func = self.simplif(ap.func);
                if self.optimize {
                    if let Lam::Function(lf) = func.to_lam() {
                        if let Some(exact_args) = exact_application(lf, &ap.args) {
                            let reduced = beta_reduce(&lf.params, lf.body, &exact_args);
                            return self.simplif(reduced);
                        }
                    }
                }
                Lam::Apply(Apply {
                    func,
                    args: ap.args.iter().map(|a| self.simplif(*a)).collect(),
                    ..ap.clone()
                })
                .into_id(span)
            }
            Lam::Function(lf) => {
                let body = self.simplif(lf.body);
                if self.optimize && lf.kind == FunctionKind::Curried {
                    if let Lam::Function(inner) = body.to_lam() {
                        if inner.kind == FunctionKind::Curried
                            && lf.params.len() + inner.params.len() <= MAX_FUNCTION_ARITY
                        {
                            let mut params = lf.params.clone();
                            params.extend(inner.params.iter().cloned());
                            return Lam::Function(Lfunction {
                                kind: FunctionKind::Curried,
                                params,
                                return_kind: inner.return_kind,
                                body: inner.body,
                                attrs: inner.attrs,
                                loc: inner.loc.clone(),
                            })
                            .into_id(span);
                        }
                    }
                }
                Lam::Function(Lfunction { body, ..lf.clone() }).into_id(span)
            }
            Lam::Let(kind, _, v, value, body)
                if self.optimize && *kind != LetKind::Variable && is_var(*value) =>
            {
                let replacement = self.simplif(*value);
                self.subst.insert(*v, replacement);
                self.simplif(*body)
            }
            Lam::Let(LetKind::Strict, vkind, v, value, body) if self.optimize => {
                match value.to_lam() {
                    Lam::Prim(Prim::Makeblock(0, Mutability::Mutable, shape), args, loc)
                        if args.len() == 1 =>
                    {
                        let init = self.simplif(args[0]);
                        let sbody = self.simplif(*body);
                        match eliminate_ref(*v, sbody) {
                            Ok(newbody) => {
                                let cell_kind = match shape {
                                    None => ValueKind::Generic,
                                    Some(ks) if ks.len() == 1 => ks[0],
                                    Some(_) => unreachable!("one-field block with a wider shape"),
                                };
                                log::trace!("promoting ref {} to a variable", v);
                                self.mklet(LetKind::Variable, cell_kind, *v, init, newbody)
                            }
                            Err(RealReference) => self.mklet(
                                LetKind::Strict,
                                *vkind,
                                *v,
                                Lam::Prim(
                                    Prim::Makeblock(0, Mutability::Mutable, shape.clone()),
                                    vec![init],
                                    loc.clone(),
                                )
                                .into_id(value.to_span()),
                                sbody,
                            ),
                        }
                    }
                    _ => {
                        let value = self.simplif(*value);
                        let body = self.simplif(*body);
                        self.mklet(LetKind::Strict, *vkind, *v, value, body)
                    }
                }
            }
            Lam::Let(LetKind::Alias, vkind, v, value, body) => match self.count_var(*v) {
                0 => self.simplif(*body),
                1 if self.optimize => {
                    let replacement = self.simplif(*value);
                    self.subst.insert(*v, replacement);
                    self.simplif(*body)
                }
                _ => {
                    let value = self.simplif(*value);
                    let body = self.simplif(*body);
                    Lam::Let(LetKind::Alias, *vkind, *v, value, body).into_id(span)
                }
            },
            Lam::Let(LetKind::StrictOpt, vkind, v, value, body) => match self.count_var(*v) {
                0 => self.simplif(*body),
                _ => {
                    let value = self.simplif(*value);
                    let body = self.simplif(*body);
                    self.mklet(LetKind::StrictOpt, *vkind, *v, value, body)
                }
            },
            Lam::Let(kind, vkind, v, value, body) => {
                let value = self.simplif(*value);
                let body = self.simplif(*body);
                self.mklet(*kind, *vkind, *v, value, body)
            }
            Lam::Letrec(bindings, body) => Lam::Letrec(
                bindings.iter().map(|(v, e)| (*v, self.simplif(*e))).collect(),
                self.simplif(*body),
            )
            .into_id(span),
            Lam::Prim(p, args, loc) => Lam::Prim(
                p.clone(),
                args.iter().map(|a| self.simplif(*a)).collect(),
                loc.clone(),
            )
            .into_id(span),
            Lam::Switch(scrut, sw, loc) => Lam::Switch(
                self.simplif(*scrut),
                Switch {
                    numconsts: sw.numconsts,
                    consts: sw
                        .consts
                        .iter()
                        .map(|(n, e)| (*n, self.simplif(*e)))
                        .collect(),
                    numblocks: sw.numblocks,
                    blocks: sw
                        .blocks
                        .iter()
                        .map(|(n, e)| (*n, self.simplif(*e)))
                        .collect(),
                    failaction: sw.failaction.map(|d| self.simplif(d)),
                },
                loc.clone(),
            )
            .into_id(span),
            Lam::Stringswitch(scrut, cases, default, loc) => Lam::Stringswitch(
                self.simplif(*scrut),
                cases.iter().map(|(s, e)| (*s, self.simplif(*e))).collect(),
                default.map(|d| self.simplif(d)),
                loc.clone(),
            )
            .into_id(span),
            Lam::Staticraise(i, args) => {
                Lam::Staticraise(*i, args.iter().map(|a| self.simplif(*a)).collect()).into_id(span)
            }
            Lam::Staticcatch(body, (i, params), handler) => Lam::Staticcatch(
                self.simplif(*body),
                (*i, params.clone()),
                self.simplif(*handler),
            )
            .into_id(span),
            Lam::Trywith(body, exn, handler) => {
                Lam::Trywith(self.simplif(*body), *exn, self.simplif(*handler)).into_id(span)
            }
            Lam::Ifthenelse(c, t, e) => {
                Lam::Ifthenelse(self.simplif(*c), self.simplif(*t), self.simplif(*e)).into_id(span)
            }
            Lam::Sequence(a, b) => {
                if let Lam::Ifused(v, e) = a.to_lam() {
                    return if self.count_var(*v) > 0 {
                        Lam::Sequence(self.simplif(*e), self.simplif(*b)).into_id(span)
                    } else {
                        self.simplif(*b)
                    };
                }
                Lam::Sequence(self.simplif(*a), self.simplif(*b)).into_id(span)
            }
            Lam::While(c, b) => Lam::While(self.simplif(*c), self.simplif(*b)).into_id(span),
            Lam::For(v, lo, hi, dir, body) => Lam::For(
                *v,
                self.simplif(*lo),
                self.simplif(*hi),
                *dir,
                self.simplif(*body),
            )
            .into_id(span),
            Lam::Assign(v, e) => Lam::Assign(*v, self.simplif(*e)).into_id(span),
            Lam::Send(met, obj, args, loc) => Lam::Send(
                self.simplif(*met),
                self.simplif(*obj),
                args.iter().map(|a| self.simplif(*a)).collect(),
                loc.clone(),
            )
            .into_id(span),
            Lam::Event(e, ev) => Lam::Event(self.simplif(*e), ev.clone()).into_id(span),
            Lam::Ifused(v, e) => {
                if self.count_var(*v) > 0 {
                    self.simplif(*e)
                } else {
                    crate::lambda::unit()
                }
            }
        }
    }
}

fn is_var(lam: LamNodeId) -> bool {
    matches!(lam.to_lam(), Lam::Var(_))
}

/// The attempted promotion met a use of the cell other than a read, write,
/// or increment of field 0.
pub struct RealReference;

/// Rewrite the body of a promoted ref binding: reads of field 0 become reads
/// of the variable, writes become `Assign`, increments become `Assign` of an
/// `Offsetint`. Any other use of the cell aborts the promotion.
fn eliminate_ref(id: Ident, lam: LamNodeId) -> Result<LamNodeId, RealReference> {
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Var(v) => {
            if *v == id {
                Err(RealReference)
            } else {
                Ok(lam)
            }
        }
        Lam::Const(_) => Ok(lam),
        Lam::Function(_) => {
            // The closure would capture the cell itself.
            if free_variables(lam).contains(&id) {
                Err(RealReference)
            } else {
                Ok(lam)
            }
        }
        Lam::Prim(Prim::Field(0), args, _) if args.len() == 1 && is_this_var(args[0], id) => {
            Ok(Lam::Var(id).into_id(span))
        }
        Lam::Prim(Prim::Setfield(0, _), args, _)
            if args.len() == 2 && is_this_var(args[0], id) =>
        {
            Ok(Lam::Assign(id, eliminate_ref(id, args[1])?).into_id(span))
        }
        Lam::Prim(Prim::Offsetref(delta), args, loc)
            if args.len() == 1 && is_this_var(args[0], id) =>
        {
            let read = Lam::Var(id).into_id(span.clone());
            let incremented =
                Lam::Prim(Prim::Offsetint(*delta), vec![read], loc.clone()).into_id(span.clone());
            Ok(Lam::Assign(id, incremented).into_id(span))
        }
        _ => try_shallow_map(&mut |c| eliminate_ref(id, c), lam),
    }
}

fn is_this_var(lam: LamNodeId, id: Ident) -> bool {
    matches!(lam.to_lam(), Lam::Var(v) if *v == id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::lambda::traverse::alpha_eq;
    use crate::lambda::{AssignMode, Constant};
    use crate::{app, assign, block, field, func, int, let_, prim, seq, var};

    fn simplify_opt(lam: LamNodeId) -> LamNodeId {
        simplify(true, lam)
    }

    fn ref_block(init: LamNodeId) -> LamNodeId {
        prim!(
            Prim::Makeblock(0, Mutability::Mutable, Some(vec![ValueKind::Int])),
            vec![init]
        )
    }

    #[test]
    fn ref_promotion() {
        // let r = ref 0 in r := !r + 1; !r
        let r = ident("r");
        let input = let_!(
            r,
            ref_block(int!(0)),
            seq!(
                prim!(
                    Prim::Setfield(0, AssignMode::HeapInit),
                    vec![
                        var!(r),
                        prim!(Prim::Offsetint(1), vec![field!(0, var!(r))])
                    ]
                ),
                field!(0, var!(r))
            )
        );
        let expected = let_!(
            LetKind::Variable,
            ValueKind::Int,
            r,
            int!(0),
            seq!(
                assign!(r, prim!(Prim::Offsetint(1), vec![var!(r)])),
                var!(r)
            )
        );
        assert_eq!(simplify_opt(input), expected);
    }

    #[test]
    fn ref_promotion_via_offsetref() {
        // let r = ref 0 in incr r; !r
        let r = ident("r");
        let input = let_!(
            r,
            ref_block(int!(0)),
            seq!(
                prim!(Prim::Offsetref(1), vec![var!(r)]),
                field!(0, var!(r))
            )
        );
        let expected = let_!(
            LetKind::Variable,
            ValueKind::Int,
            r,
            int!(0),
            seq!(
                assign!(r, prim!(Prim::Offsetint(1), vec![var!(r)])),
                var!(r)
            )
        );
        assert_eq!(simplify_opt(input), expected);
    }

    #[test]
    fn escaping_ref_is_not_promoted() {
        // let r = ref 0 in f r
        let r = ident("r");
        let f = ident("f");
        let input = let_!(r, ref_block(int!(0)), app!(var!(f), vec![var!(r)]));
        let output = simplify_opt(input);
        match output.to_lam() {
            Lam::Let(LetKind::Strict, _, _, value, _) => {
                assert!(matches!(
                    value.to_lam(),
                    Lam::Prim(Prim::Makeblock(0, Mutability::Mutable, _), _, _)
                ));
            }
            other => panic!("expected the strict let to survive, got {:?}", other),
        }
    }

    #[test]
    fn beta_and_curry_merge() {
        // ((fun x y -> fun z -> x + y + z) 1 2 3)
        let x = ident("x");
        let y = ident("y");
        let z = ident("z");
        let add3 = prim!(
            Prim::Addint,
            vec![prim!(Prim::Addint, vec![var!(x), var!(y)]), var!(z)]
        );
        let input = app!(
            func!(vec![x, y], func!(vec![z], add3)),
            vec![int!(1), int!(2), int!(3)]
        );
        let expected = let_!(
            x,
            int!(1),
            let_!(y, int!(2), let_!(z, int!(3), add3))
        );
        assert!(alpha_eq(simplify_opt(input), expected));
    }

    #[test]
    fn unused_alias_is_dropped() {
        let v = ident("v");
        let input = let_!(
            LetKind::Alias,
            ValueKind::Generic,
            v,
            int!(1),
            int!(2)
        );
        assert_eq!(simplify_opt(input), int!(2));
    }

    #[test]
    fn single_use_alias_is_inlined() {
        let v = ident("v");
        let input = let_!(
            LetKind::Alias,
            ValueKind::Generic,
            v,
            block!(0, vec![int!(1)]),
            field!(0, var!(v))
        );
        let expected = field!(0, block!(0, vec![int!(1)]));
        assert_eq!(simplify_opt(input), expected);
    }

    #[test]
    fn alias_used_under_lambda_is_kept() {
        // A single syntactic use below a lambda counts as many.
        let v = ident("v");
        let input = let_!(
            LetKind::Alias,
            ValueKind::Generic,
            v,
            block!(0, vec![int!(1)]),
            func!(vec![ident("u")], var!(v))
        );
        assert!(matches!(
            simplify_opt(input).to_lam(),
            Lam::Let(LetKind::Alias, ..)
        ));
    }

    #[test]
    fn copy_propagation() {
        let v = ident("v");
        let w = ident("w");
        let input = let_!(
            w,
            int!(5),
            let_!(
                LetKind::Alias,
                ValueKind::Generic,
                v,
                var!(w),
                prim!(Prim::Addint, vec![var!(v), var!(v)])
            )
        );
        let expected = let_!(w, int!(5), prim!(Prim::Addint, vec![var!(w), var!(w)]));
        assert_eq!(simplify_opt(input), expected);
    }

    #[test]
    fn unused_strict_value_is_kept_for_effects() {
        let v = ident("v");
        let f = ident("f");
        let input = let_!(v, app!(var!(f), vec![int!(0)]), int!(1));
        assert!(matches!(
            simplify_opt(input).to_lam(),
            Lam::Let(LetKind::Strict, ..)
        ));
    }

    #[test]
    fn unused_strictopt_is_dropped() {
        let v = ident("v");
        let input = let_!(
            LetKind::StrictOpt,
            ValueKind::Generic,
            v,
            block!(0, vec![int!(1)]),
            int!(2)
        );
        assert_eq!(simplify_opt(input), int!(2));
    }

    #[test]
    fn eta_let_contracts() {
        let v = ident("v");
        let input = let_!(v, int!(9), var!(v));
        assert_eq!(simplify_opt(input), int!(9));
    }

    #[test]
    fn ifused_of_dead_variable_vanishes() {
        let v = ident("v");
        let w = ident("w");
        let input = let_!(
            LetKind::StrictOpt,
            ValueKind::Generic,
            w,
            int!(1),
            seq!(
                crate::lambda::Lam::Ifused(w, assign!(v, int!(3))).into_id_without_span(),
                int!(2)
            )
        );
        assert_eq!(simplify_opt(input), int!(2));
    }

    #[test]
    fn debug_mode_keeps_aliases_with_one_use() {
        let v = ident("v");
        let input = let_!(
            LetKind::Alias,
            ValueKind::Generic,
            v,
            block!(0, vec![int!(1)]),
            field!(0, var!(v))
        );
        assert!(matches!(
            simplify(false, input).to_lam(),
            Lam::Let(LetKind::Alias, ..)
        ));
    }

    #[test]
    fn replicated_switch_default_counts_twice() {
        // Both the const and the block coverage are partial, so the back end
        // will duplicate the default action; a single syntactic use inside
        // it must not be treated as a single use.
        let v = ident("v");
        let sw = crate::lambda::Lam::Switch(
            int!(0),
            crate::lambda::Switch {
                numconsts: 2,
                consts: vec![(0, int!(7))],
                numblocks: 1,
                blocks: vec![],
                failaction: Some(field!(0, var!(v))),
            },
            crate::dummy_span!(),
        )
        .into_id_without_span();
        let input = let_!(
            LetKind::Alias,
            ValueKind::Generic,
            v,
            block!(0, vec![int!(1)]),
            sw
        );
        assert!(matches!(
            simplify_opt(input).to_lam(),
            Lam::Let(LetKind::Alias, ..)
        ));
    }

    #[test]
    fn const_block_stays_untouched() {
        let c = crate::lambda::Lam::Const(Constant::Block(0, vec![Constant::Int(1)]))
            .into_id_without_span();
        assert_eq!(simplify_opt(c), c);
    }
}
