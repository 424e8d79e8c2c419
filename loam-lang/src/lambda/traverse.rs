//! One-level and whole-term traversals over lambda terms: iteration with
//! tail-position classification, rebuilding, free variables, renaming of
//! free identifiers, and binder-refreshing duplication.

use std::collections::{HashMap, HashSet};

use crate::interner::{next_raise_count, Ident, LamNodeId};
use crate::lambda::{Apply, Lam, Lfunction, Prim, Switch};

/// Apply `tail` to the children in tail position of `lam` and `non_tail` to
/// every other child. One level only.
pub fn shallow_iter(
    tail: &mut dyn FnMut(LamNodeId),
    non_tail: &mut dyn FnMut(LamNodeId),
    lam: LamNodeId,
) {
    let f = non_tail;
    match lam.to_lam() {
        Lam::Var(_) | Lam::Const(_) => {}
        Lam::Apply(ap) => {
            f(ap.func);
            ap.args.iter().for_each(|a| f(*a));
        }
        Lam::Function(lf) => f(lf.body),
        Lam::Let(_, _, _, value, body) => {
            f(*value);
            tail(*body);
        }
        Lam::Letrec(bindings, body) => {
            tail(*body);
            bindings.iter().for_each(|(_, e)| f(*e));
        }
        Lam::Prim(Prim::Sequand, args, _) | Lam::Prim(Prim::Sequor, args, _)
            if args.len() == 2 =>
        {
            f(args[0]);
            tail(args[1]);
        }
        Lam::Prim(_, args, _) => args.iter().for_each(|a| f(*a)),
        Lam::Switch(scrut, sw, _) => {
            f(*scrut);
            sw.consts.iter().for_each(|(_, e)| tail(*e));
            sw.blocks.iter().for_each(|(_, e)| tail(*e));
            if let Some(d) = sw.failaction {
                tail(d);
            }
        }
        Lam::Stringswitch(scrut, cases, default, _) => {
            f(*scrut);
            cases.iter().for_each(|(_, e)| tail(*e));
            if let Some(d) = default {
                tail(*d);
            }
        }
        Lam::Staticraise(_, args) => args.iter().for_each(|a| f(*a)),
        Lam::Staticcatch(body, _, handler) => {
            tail(*body);
            tail(*handler);
        }
        Lam::Trywith(body, _, handler) => {
            f(*body);
            tail(*handler);
        }
        Lam::Ifthenelse(c, t, e) => {
            f(*c);
            tail(*t);
            tail(*e);
        }
        Lam::Sequence(a, b) => {
            f(*a);
            tail(*b);
        }
        Lam::While(c, b) => {
            f(*c);
            f(*b);
        }
        Lam::For(_, lo, hi, _, body) => {
            f(*lo);
            f(*hi);
            f(*body);
        }
        Lam::Assign(_, e) => f(*e),
        Lam::Send(met, obj, args, _) => {
            f(*met);
            f(*obj);
            args.iter().for_each(|a| f(*a));
        }
        Lam::Event(e, _) => tail(*e),
        Lam::Ifused(_, e) => tail(*e),
    }
}

/// Rebuild `lam` with every direct child replaced by `f(child)`. Nodes with
/// no children are returned as-is.
pub fn shallow_map(f: &mut dyn FnMut(LamNodeId) -> LamNodeId, lam: LamNodeId) -> LamNodeId {
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Var(_) | Lam::Const(_) => lam,
        Lam::Apply(ap) => Lam::Apply(Apply {
            func: f(ap.func),
            args: ap.args.iter().map(|a| f(*a)).collect(),
            ..ap.clone()
        })
        .into_id(span),
        Lam::Function(lf) => Lam::Function(Lfunction {
            body: f(lf.body),
            ..lf.clone()
        })
        .into_id(span),
        Lam::Let(kind, vkind, v, value, body) => {
            Lam::Let(*kind, *vkind, *v, f(*value), f(*body)).into_id(span)
        }
        Lam::Letrec(bindings, body) => Lam::Letrec(
            bindings.iter().map(|(v, e)| (*v, f(*e))).collect(),
            f(*body),
        )
        .into_id(span),
        Lam::Prim(p, args, loc) => Lam::Prim(
            p.clone(),
            args.iter().map(|a| f(*a)).collect(),
            loc.clone(),
        )
        .into_id(span),
        Lam::Switch(scrut, sw, loc) => Lam::Switch(
            f(*scrut),
            Switch {
                numconsts: sw.numconsts,
                consts: sw.consts.iter().map(|(n, e)| (*n, f(*e))).collect(),
                numblocks: sw.numblocks,
                blocks: sw.blocks.iter().map(|(n, e)| (*n, f(*e))).collect(),
                failaction: sw.failaction.map(&mut *f),
            },
            loc.clone(),
        )
        .into_id(span),
        Lam::Stringswitch(scrut, cases, default, loc) => Lam::Stringswitch(
            f(*scrut),
            cases.iter().map(|(s, e)| (*s, f(*e))).collect(),
            default.map(&mut *f),
            loc.clone(),
        )
        .into_id(span),
        Lam::Staticraise(label, args) => {
            Lam::Staticraise(*label, args.iter().map(|a| f(*a)).collect()).into_id(span)
        }
        Lam::Staticcatch(body, (label, params), handler) => {
            Lam::Staticcatch(f(*body), (*label, params.clone()), f(*handler)).into_id(span)
        }
        Lam::Trywith(body, exn, handler) => {
            Lam::Trywith(f(*body), *exn, f(*handler)).into_id(span)
        }
        Lam::Ifthenelse(c, t, e) => Lam::Ifthenelse(f(*c), f(*t), f(*e)).into_id(span),
        Lam::Sequence(a, b) => Lam::Sequence(f(*a), f(*b)).into_id(span),
        Lam::While(c, b) => Lam::While(f(*c), f(*b)).into_id(span),
        Lam::For(v, lo, hi, dir, body) => {
            Lam::For(*v, f(*lo), f(*hi), *dir, f(*body)).into_id(span)
        }
        Lam::Assign(v, e) => Lam::Assign(*v, f(*e)).into_id(span),
        Lam::Send(met, obj, args, loc) => Lam::Send(
            f(*met),
            f(*obj),
            args.iter().map(|a| f(*a)).collect(),
            loc.clone(),
        )
        .into_id(span),
        Lam::Event(e, ev) => Lam::Event(f(*e), ev.clone()).into_id(span),
        Lam::Ifused(v, e) => Lam::Ifused(*v, f(*e)).into_id(span),
    }
}

/// Direct children of `lam`, each with its tail-position flag. Convenient
/// when a traversal wants a plain loop instead of two callbacks.
pub fn tail_classified_children(lam: LamNodeId) -> Vec<(LamNodeId, bool)> {
    let out = std::cell::RefCell::new(Vec::new());
    {
        let mut t = |c: LamNodeId| out.borrow_mut().push((c, true));
        let mut nt = |c: LamNodeId| out.borrow_mut().push((c, false));
        shallow_iter(&mut t, &mut nt, lam);
    }
    out.into_inner()
}

/// `shallow_map` for fallible rewrites. The first error wins; children after
/// it are left untouched.
pub fn try_shallow_map<E>(
    f: &mut dyn FnMut(LamNodeId) -> Result<LamNodeId, E>,
    lam: LamNodeId,
) -> Result<LamNodeId, E> {
    let mut err = None;
    let out = shallow_map(
        &mut |c| {
            if err.is_some() {
                return c;
            }
            match f(c) {
                Ok(x) => x,
                Err(e) => {
                    err = Some(e);
                    c
                }
            }
        },
        lam,
    );
    match err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

pub fn free_variables(lam: LamNodeId) -> HashSet<Ident> {
    let mut acc = HashSet::new();
    let mut bound = Vec::new();
    collect_free(lam, &mut bound, &mut acc);
    acc
}

fn collect_free(lam: LamNodeId, bound: &mut Vec<Ident>, acc: &mut HashSet<Ident>) {
    let mut use_var = |v: Ident, bound: &[Ident], acc: &mut HashSet<Ident>| {
        if !bound.contains(&v) {
            acc.insert(v);
        }
    };
    match lam.to_lam() {
        Lam::Var(v) => use_var(*v, bound, acc),
        Lam::Assign(v, e) => {
            use_var(*v, bound, acc);
            collect_free(*e, bound, acc);
        }
        Lam::Ifused(v, e) => {
            use_var(*v, bound, acc);
            collect_free(*e, bound, acc);
        }
        Lam::Function(lf) => {
            let depth = bound.len();
            bound.extend(lf.params.iter().map(|(p, _)| *p));
            collect_free(lf.body, bound, acc);
            bound.truncate(depth);
        }
        Lam::Let(_, _, v, value, body) => {
            collect_free(*value, bound, acc);
            bound.push(*v);
            collect_free(*body, bound, acc);
            bound.pop();
        }
        Lam::Letrec(bindings, body) => {
            let depth = bound.len();
            bound.extend(bindings.iter().map(|(v, _)| *v));
            for (_, e) in bindings {
                collect_free(*e, bound, acc);
            }
            collect_free(*body, bound, acc);
            bound.truncate(depth);
        }
        Lam::Staticcatch(body, (_, params), handler) => {
            collect_free(*body, bound, acc);
            let depth = bound.len();
            bound.extend(params.iter().map(|(p, _)| *p));
            collect_free(*handler, bound, acc);
            bound.truncate(depth);
        }
        Lam::Trywith(body, exn, handler) => {
            collect_free(*body, bound, acc);
            bound.push(*exn);
            collect_free(*handler, bound, acc);
            bound.pop();
        }
        Lam::For(v, lo, hi, _, body) => {
            collect_free(*lo, bound, acc);
            collect_free(*hi, bound, acc);
            bound.push(*v);
            collect_free(*body, bound, acc);
            bound.pop();
        }
        _ => {
            let mut go = |child: LamNodeId| collect_free(child, bound, acc);
            // No binders on the remaining nodes, so tail position is
            // irrelevant here.
            shallow_iter_collect(lam, &mut go);
        }
    }
}

fn shallow_iter_collect(lam: LamNodeId, f: &mut dyn FnMut(LamNodeId)) {
    // shallow_iter wants two independent callbacks; buffer the children so a
    // single one can consume them.
    let children = std::cell::RefCell::new(Vec::new());
    {
        let mut push_a = |c: LamNodeId| children.borrow_mut().push(c);
        let mut push_b = |c: LamNodeId| children.borrow_mut().push(c);
        shallow_iter(&mut push_a, &mut push_b, lam);
    }
    for c in children.into_inner() {
        f(c);
    }
}

/// Substitute free identifiers according to `map`. Binders shadow as usual;
/// bound identifiers are untouched.
pub fn rename(map: &HashMap<Ident, Ident>, lam: LamNodeId) -> LamNodeId {
    let mut shadow = Vec::new();
    rename_in(map, &mut shadow, lam)
}

fn rename_in(map: &HashMap<Ident, Ident>, shadow: &mut Vec<Ident>, lam: LamNodeId) -> LamNodeId {
    let lookup = |v: Ident, shadow: &[Ident]| -> Ident {
        if shadow.contains(&v) {
            v
        } else {
            map.get(&v).copied().unwrap_or(v)
        }
    };
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Var(v) => {
            let w = lookup(*v, shadow);
            if w == *v {
                lam
            } else {
                Lam::Var(w).into_id(span)
            }
        }
        Lam::Assign(v, e) => {
            Lam::Assign(lookup(*v, shadow), rename_in(map, shadow, *e)).into_id(span)
        }
        Lam::Ifused(v, e) => {
            Lam::Ifused(lookup(*v, shadow), rename_in(map, shadow, *e)).into_id(span)
        }
        Lam::Function(lf) => {
            let depth = shadow.len();
            shadow.extend(lf.params.iter().map(|(p, _)| *p));
            let body = rename_in(map, shadow, lf.body);
            shadow.truncate(depth);
            Lam::Function(Lfunction { body, ..lf.clone() }).into_id(span)
        }
        Lam::Let(kind, vkind, v, value, body) => {
            let value = rename_in(map, shadow, *value);
            shadow.push(*v);
            let body = rename_in(map, shadow, *body);
            shadow.pop();
            Lam::Let(*kind, *vkind, *v, value, body).into_id(span)
        }
        Lam::Letrec(bindings, body) => {
            let depth = shadow.len();
            shadow.extend(bindings.iter().map(|(v, _)| *v));
            let bindings = bindings
                .iter()
                .map(|(v, e)| (*v, rename_in(map, shadow, *e)))
                .collect();
            let body = rename_in(map, shadow, *body);
            shadow.truncate(depth);
            Lam::Letrec(bindings, body).into_id(span)
        }
        Lam::Staticcatch(body, (label, params), handler) => {
            let body = rename_in(map, shadow, *body);
            let depth = shadow.len();
            shadow.extend(params.iter().map(|(p, _)| *p));
            let handler = rename_in(map, shadow, *handler);
            shadow.truncate(depth);
            Lam::Staticcatch(body, (*label, params.clone()), handler).into_id(span)
        }
        Lam::Trywith(body, exn, handler) => {
            let body = rename_in(map, shadow, *body);
            shadow.push(*exn);
            let handler = rename_in(map, shadow, *handler);
            shadow.pop();
            Lam::Trywith(body, *exn, handler).into_id(span)
        }
        Lam::For(v, lo, hi, dir, body) => {
            let lo = rename_in(map, shadow, *lo);
            let hi = rename_in(map, shadow, *hi);
            shadow.push(*v);
            let body = rename_in(map, shadow, *body);
            shadow.pop();
            Lam::For(*v, lo, hi, *dir, body).into_id(span)
        }
        _ => shallow_map(&mut |c| rename_in(map, shadow, c), lam),
    }
}

/// Copy a term, giving every bound identifier and every static-exception
/// label a fresh stamp. Free identifiers and free labels are preserved.
pub fn duplicate(lam: LamNodeId) -> LamNodeId {
    let mut idents = HashMap::new();
    let mut labels = HashMap::new();
    dup(&mut idents, &mut labels, lam)
}

fn dup(
    idents: &mut HashMap<Ident, Ident>,
    labels: &mut HashMap<u32, u32>,
    lam: LamNodeId,
) -> LamNodeId {
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Var(v) => {
            let w = idents.get(v).copied().unwrap_or(*v);
            Lam::Var(w).into_id(span)
        }
        Lam::Assign(v, e) => {
            let w = idents.get(v).copied().unwrap_or(*v);
            Lam::Assign(w, dup(idents, labels, *e)).into_id(span)
        }
        Lam::Ifused(v, e) => {
            let w = idents.get(v).copied().unwrap_or(*v);
            Lam::Ifused(w, dup(idents, labels, *e)).into_id(span)
        }
        Lam::Function(lf) => {
            let params = lf
                .params
                .iter()
                .map(|(p, k)| {
                    let p2 = p.rename();
                    idents.insert(*p, p2);
                    (p2, *k)
                })
                .collect();
            let body = dup(idents, labels, lf.body);
            Lam::Function(Lfunction {
                params,
                body,
                ..lf.clone()
            })
            .into_id(span)
        }
        Lam::Let(kind, vkind, v, value, body) => {
            let value = dup(idents, labels, *value);
            let v2 = v.rename();
            idents.insert(*v, v2);
            let body = dup(idents, labels, *body);
            Lam::Let(*kind, *vkind, v2, value, body).into_id(span)
        }
        Lam::Letrec(bindings, body) => {
            let ids: Vec<Ident> = bindings
                .iter()
                .map(|(v, _)| {
                    let v2 = v.rename();
                    idents.insert(*v, v2);
                    v2
                })
                .collect();
            let bindings = ids
                .into_iter()
                .zip(bindings.iter())
                .map(|(v2, (_, e))| (v2, dup(idents, labels, *e)))
                .collect();
            let body = dup(idents, labels, *body);
            Lam::Letrec(bindings, body).into_id(span)
        }
        Lam::Staticraise(label, args) => {
            let label = labels.get(label).copied().unwrap_or(*label);
            Lam::Staticraise(label, args.iter().map(|a| dup(idents, labels, *a)).collect())
                .into_id(span)
        }
        Lam::Staticcatch(body, (label, params), handler) => {
            let label2 = next_raise_count();
            labels.insert(*label, label2);
            let body = dup(idents, labels, *body);
            let params = params
                .iter()
                .map(|(p, k)| {
                    let p2 = p.rename();
                    idents.insert(*p, p2);
                    (p2, *k)
                })
                .collect();
            let handler = dup(idents, labels, *handler);
            Lam::Staticcatch(body, (label2, params), handler).into_id(span)
        }
        Lam::Trywith(body, exn, handler) => {
            let body = dup(idents, labels, *body);
            let exn2 = exn.rename();
            idents.insert(*exn, exn2);
            let handler = dup(idents, labels, *handler);
            Lam::Trywith(body, exn2, handler).into_id(span)
        }
        Lam::For(v, lo, hi, dir, body) => {
            let lo = dup(idents, labels, *lo);
            let hi = dup(idents, labels, *hi);
            let v2 = v.rename();
            idents.insert(*v, v2);
            let body = dup(idents, labels, *body);
            Lam::For(v2, lo, hi, *dir, body).into_id(span)
        }
        _ => shallow_map(&mut |c| dup(idents, labels, c), lam),
    }
}

/// Structural equality up to a consistent renaming of bound identifiers and
/// static-exception labels. Free identifiers must match exactly.
pub fn alpha_eq(a: LamNodeId, b: LamNodeId) -> bool {
    let mut idents = HashMap::new();
    let mut labels = HashMap::new();
    eq(&mut idents, &mut labels, a, b)
}

fn eq(
    idents: &mut HashMap<Ident, Ident>,
    labels: &mut HashMap<u32, u32>,
    a: LamNodeId,
    b: LamNodeId,
) -> bool {
    use Lam::*;
    let var_eq = |idents: &HashMap<Ident, Ident>, va: Ident, vb: Ident| -> bool {
        match idents.get(&va) {
            Some(mapped) => *mapped == vb,
            None => va == vb,
        }
    };
    let all_eq = |idents: &mut HashMap<Ident, Ident>,
                  labels: &mut HashMap<u32, u32>,
                  xs: &[LamNodeId],
                  ys: &[LamNodeId]|
     -> bool {
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| eq(idents, labels, *x, *y))
    };
    match (a.to_lam(), b.to_lam()) {
        (Var(va), Var(vb)) => var_eq(idents, *va, *vb),
        (Const(ca), Const(cb)) => ca == cb,
        (Apply(pa), Apply(pb)) => {
            eq(idents, labels, pa.func, pb.func)
                && all_eq(idents, labels, &pa.args, &pb.args)
                && pa.tailcall == pb.tailcall
        }
        (Function(fa), Function(fb)) => {
            if fa.kind != fb.kind || fa.params.len() != fb.params.len() {
                return false;
            }
            for ((pa, ka), (pb, kb)) in fa.params.iter().zip(&fb.params) {
                if ka != kb {
                    return false;
                }
                idents.insert(*pa, *pb);
            }
            eq(idents, labels, fa.body, fb.body)
        }
        (Let(ka, vka, va, da, ba), Let(kb, vkb, vb, db, bb)) => {
            if ka != kb || vka != vkb || !eq(idents, labels, *da, *db) {
                return false;
            }
            idents.insert(*va, *vb);
            eq(idents, labels, *ba, *bb)
        }
        (Letrec(bsa, ba), Letrec(bsb, bb)) => {
            if bsa.len() != bsb.len() {
                return false;
            }
            for ((va, _), (vb, _)) in bsa.iter().zip(bsb) {
                idents.insert(*va, *vb);
            }
            bsa.iter()
                .zip(bsb)
                .all(|((_, ea), (_, eb))| eq(idents, labels, *ea, *eb))
                && eq(idents, labels, *ba, *bb)
        }
        (Prim(pa, aa, _), Prim(pb, ab, _)) => pa == pb && all_eq(idents, labels, aa, ab),
        (Switch(sa, swa, _), Switch(sb, swb, _)) => {
            eq(idents, labels, *sa, *sb)
                && swa.numconsts == swb.numconsts
                && swa.numblocks == swb.numblocks
                && swa.consts.len() == swb.consts.len()
                && swa.blocks.len() == swb.blocks.len()
                && swa
                    .consts
                    .iter()
                    .zip(&swb.consts)
                    .all(|((na, ea), (nb, eb))| na == nb && eq(idents, labels, *ea, *eb))
                && swa
                    .blocks
                    .iter()
                    .zip(&swb.blocks)
                    .all(|((na, ea), (nb, eb))| na == nb && eq(idents, labels, *ea, *eb))
                && match (swa.failaction, swb.failaction) {
                    (None, None) => true,
                    (Some(da), Some(db)) => eq(idents, labels, da, db),
                    _ => false,
                }
        }
        (Stringswitch(sa, ca, da, _), Stringswitch(sb, cb, db, _)) => {
            eq(idents, labels, *sa, *sb)
                && ca.len() == cb.len()
                && ca
                    .iter()
                    .zip(cb)
                    .all(|((na, ea), (nb, eb))| na == nb && eq(idents, labels, *ea, *eb))
                && match (da, db) {
                    (None, None) => true,
                    (Some(da), Some(db)) => eq(idents, labels, *da, *db),
                    _ => false,
                }
        }
        (Staticraise(la, aa), Staticraise(lb, ab)) => {
            labels.get(la).copied().unwrap_or(*la) == *lb && all_eq(idents, labels, aa, ab)
        }
        (Staticcatch(ba, (la, pa), ha), Staticcatch(bb, (lb, pb), hb)) => {
            if pa.len() != pb.len() {
                return false;
            }
            labels.insert(*la, *lb);
            if !eq(idents, labels, *ba, *bb) {
                return false;
            }
            for ((va, ka), (vb, kb)) in pa.iter().zip(pb) {
                if ka != kb {
                    return false;
                }
                idents.insert(*va, *vb);
            }
            eq(idents, labels, *ha, *hb)
        }
        (Trywith(ba, va, ha), Trywith(bb, vb, hb)) => {
            if !eq(idents, labels, *ba, *bb) {
                return false;
            }
            idents.insert(*va, *vb);
            eq(idents, labels, *ha, *hb)
        }
        (Ifthenelse(ca, ta, ea), Ifthenelse(cb, tb, eb)) => {
            eq(idents, labels, *ca, *cb)
                && eq(idents, labels, *ta, *tb)
                && eq(idents, labels, *ea, *eb)
        }
        (Sequence(xa, ya), Sequence(xb, yb)) => {
            eq(idents, labels, *xa, *xb) && eq(idents, labels, *ya, *yb)
        }
        (While(ca, ba), While(cb, bb)) => {
            eq(idents, labels, *ca, *cb) && eq(idents, labels, *ba, *bb)
        }
        (For(va, loa, hia, da, ba), For(vb, lob, hib, db, bb)) => {
            if da != db || !eq(idents, labels, *loa, *lob) || !eq(idents, labels, *hia, *hib) {
                return false;
            }
            idents.insert(*va, *vb);
            eq(idents, labels, *ba, *bb)
        }
        (Assign(va, ea), Assign(vb, eb)) => {
            var_eq(idents, *va, *vb) && eq(idents, labels, *ea, *eb)
        }
        (Send(ma, oa, aa, _), Send(mb, ob, ab, _)) => {
            eq(idents, labels, *ma, *mb)
                && eq(idents, labels, *oa, *ob)
                && all_eq(idents, labels, aa, ab)
        }
        (Event(ea, _), Event(eb, _)) => eq(idents, labels, *ea, *eb),
        (Ifused(va, ea), Ifused(vb, eb)) => {
            var_eq(idents, *va, *vb) && eq(idents, labels, *ea, *eb)
        }
        _ => false,
    }
}
