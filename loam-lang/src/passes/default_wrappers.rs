//! Splitting of default-argument wrappers.
//!
//! The front end compiles optional parameters with defaults into a prefix of
//! `let p = if *opt* then unpack else default in ...` bindings at the top of
//! the function body. Splitting that prefix into a small wrapper around an
//! inner function lets callers that pass every argument skip the defaulting
//! code, and keeps the inner function eligible for further rewrites.

use std::collections::HashMap;

use crate::interner::{Ident, LamNodeId};
use crate::lambda::traverse::{free_variables, rename, shallow_map};
use crate::lambda::{
    Apply, FunctionAttrs, FunctionKind, InlineAttr, Lam, LetKind, Lfunction, TailcallHint,
    ValueKind,
};

pub fn split(lam: LamNodeId) -> LamNodeId {
    log::trace!("split_default_wrappers");
    rewrite(lam)
}

fn rewrite(lam: LamNodeId) -> LamNodeId {
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Let(kind, vkind, id, value, body) => {
            let body = rewrite(*body);
            match function_of(*value) {
                Some(lf) => {
                    let lf = Lfunction {
                        body: rewrite(lf.body),
                        ..lf
                    };
                    match split_function(*id, &lf) {
                        Some((wrapper, (inner_id, inner))) => {
                            let inner_value =
                                Lam::Function(inner).into_id(value.to_span());
                            let wrapper_value =
                                Lam::Function(wrapper).into_id(value.to_span());
                            Lam::Let(
                                *kind,
                                *vkind,
                                inner_id,
                                inner_value,
                                Lam::Let(*kind, *vkind, *id, wrapper_value, body)
                                    .into_id(span.clone()),
                            )
                            .into_id(span)
                        }
                        None => Lam::Let(
                            *kind,
                            *vkind,
                            *id,
                            Lam::Function(lf).into_id(value.to_span()),
                            body,
                        )
                        .into_id(span),
                    }
                }
                None => {
                    Lam::Let(*kind, *vkind, *id, rewrite(*value), body).into_id(span)
                }
            }
        }
        Lam::Letrec(bindings, body) => {
            let mut out = Vec::new();
            for (id, value) in bindings {
                match function_of(*value) {
                    Some(lf) => {
                        let lf = Lfunction {
                            body: rewrite(lf.body),
                            ..lf
                        };
                        match split_function(*id, &lf) {
                            Some((wrapper, (inner_id, inner))) => {
                                out.push((inner_id, Lam::Function(inner).into_id(value.to_span())));
                                out.push((*id, Lam::Function(wrapper).into_id(value.to_span())));
                            }
                            None => {
                                out.push((*id, Lam::Function(lf).into_id(value.to_span())))
                            }
                        }
                    }
                    None => out.push((*id, rewrite(*value))),
                }
            }
            Lam::Letrec(out, rewrite(*body)).into_id(span)
        }
        _ => shallow_map(&mut rewrite, lam),
    }
}

fn function_of(value: LamNodeId) -> Option<Lfunction> {
    match value.to_lam() {
        Lam::Function(lf) => Some(lf.clone()),
        _ => None,
    }
}

/// Split one function if its body starts with the defaulting prefix.
/// Returns the wrapper (same name and signature) and the fresh inner
/// function.
fn split_function(fun_id: Ident, lf: &Lfunction) -> Option<(Lfunction, (Ident, Lfunction))> {
    let mut map: Vec<(Ident, Ident)> = Vec::new();
    let (wrapper_body, inner) = peel(&mut map, fun_id, lf, lf.body)?;
    let wrapper = Lfunction {
        body: wrapper_body,
        attrs: FunctionAttrs {
            stub: true,
            inline: InlineAttr::Default,
            ..lf.attrs
        },
        ..lf.clone()
    };
    Some((wrapper, inner))
}

fn peel(
    map: &mut Vec<(Ident, Ident)>,
    fun_id: Ident,
    lf: &Lfunction,
    body: LamNodeId,
) -> Option<(LamNodeId, (Ident, Lfunction))> {
    if let Lam::Let(LetKind::Strict, vkind, id, def, rest) = body.to_lam() {
        if let Lam::Ifthenelse(cond, _, _) = def.to_lam() {
            if let Lam::Var(optparam) = cond.to_lam() {
                let is_opt = optparam.name.as_str() == "*opt*"
                    && lf.params.iter().any(|(p, _)| p == optparam)
                    && !map.iter().any(|(p, _)| p == optparam);
                if is_opt {
                    map.push((*optparam, *id));
                    let (wrapper_body, inner) = peel(map, fun_id, lf, *rest)?;
                    return Some((
                        Lam::Let(LetKind::Strict, *vkind, *id, *def, wrapper_body)
                            .into_id(body.to_span()),
                        inner,
                    ));
                }
            }
        }
    }
    if map.is_empty() {
        return None;
    }
    // The defaulted *opt* parameters must not occur in the continuation;
    // they should all have been consumed by the prefix.
    let fv = free_variables(body);
    if map.iter().any(|(p, _)| fv.contains(p)) {
        return None;
    }
    let inner_id = Ident::fresh_str(&format!("{}_inner", fun_id.name));
    let map_param = |p: Ident| -> Ident {
        map.iter()
            .find(|(opt, _)| *opt == p)
            .map(|(_, bound)| *bound)
            .unwrap_or(p)
    };
    let args: Vec<LamNodeId> = lf
        .params
        .iter()
        .map(|(p, _)| Lam::Var(map_param(*p)).into_id(lf.loc.clone()))
        .collect();
    let wrapper_body = Lam::Apply(Apply {
        func: Lam::Var(inner_id).into_id(lf.loc.clone()),
        args,
        loc: lf.loc.clone(),
        tailcall: TailcallHint::Default,
        inlined: InlineAttr::Default,
    })
    .into_id(lf.loc.clone());

    let inner_params_src: Vec<Ident> = lf.params.iter().map(|(p, _)| map_param(*p)).collect();
    let new_ids: Vec<Ident> = inner_params_src.iter().map(|p| p.rename()).collect();
    let subst: HashMap<Ident, Ident> = inner_params_src
        .iter()
        .zip(&new_ids)
        .map(|(old, new)| (*old, *new))
        .collect();
    let inner_body = rename(&subst, body);
    let inner_fun = Lfunction {
        kind: FunctionKind::Curried,
        params: new_ids
            .into_iter()
            .map(|p| (p, ValueKind::Generic))
            .collect(),
        return_kind: lf.return_kind,
        body: inner_body,
        attrs: lf.attrs,
        loc: lf.loc.clone(),
    };
    Some((wrapper_body, (inner_id, inner_fun)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interner::ToSymbol;
    use crate::lambda::builder::ident;
    use crate::lambda::Prim;
    use crate::{app, field, func, ifthen, int, let_, prim, var};

    #[test]
    fn defaulting_prefix_is_peeled() {
        // fun *opt* y -> let x = if *opt* then field 0 *opt* else 42 in x + y
        let opt = Ident::fresh("*opt*".to_symbol());
        let y = ident("y");
        let x = ident("x");
        let body = let_!(
            x,
            ifthen!(var!(opt), field!(0, var!(opt)), int!(42)),
            prim!(Prim::Addint, vec![var!(x), var!(y)])
        );
        let f = ident("f");
        let input = let_!(f, func!(vec![opt, y], body), int!(0));
        let output = split(input);

        // let f_inner = fun x' y' -> x' + y' in
        // let f = fun *opt* y -> let x = if ... in f_inner x y in 0
        match output.to_lam() {
            Lam::Let(_, _, inner_id, inner_value, rest) => {
                assert_eq!(inner_id.name.as_str(), "f_inner");
                let inner = match inner_value.to_lam() {
                    Lam::Function(lf) => lf.clone(),
                    other => panic!("expected inner function, got {:?}", other),
                };
                assert_eq!(inner.params.len(), 2);
                match rest.to_lam() {
                    Lam::Let(_, _, wrapper_id, wrapper_value, _) => {
                        assert_eq!(*wrapper_id, f);
                        let wrapper = match wrapper_value.to_lam() {
                            Lam::Function(lf) => lf.clone(),
                            other => panic!("expected wrapper function, got {:?}", other),
                        };
                        assert!(wrapper.attrs.stub);
                        // The wrapper keeps the defaulting let and calls the
                        // inner function with the defaulted value.
                        match wrapper.body.to_lam() {
                            Lam::Let(_, _, bound, _, call) => {
                                assert_eq!(*bound, x);
                                match call.to_lam() {
                                    Lam::Apply(ap) => {
                                        assert_eq!(ap.args.len(), 2);
                                        assert_eq!(ap.args[0], var!(x));
                                        assert_eq!(ap.args[1], var!(y));
                                    }
                                    other => panic!("expected a call, got {:?}", other),
                                }
                            }
                            other => panic!("expected the defaulting let, got {:?}", other),
                        }
                    }
                    other => panic!("expected the wrapper let, got {:?}", other),
                }
            }
            other => panic!("expected the inner let, got {:?}", other),
        }
    }

    #[test]
    fn ordinary_functions_are_untouched() {
        let x = ident("x");
        let f = ident("f");
        let input = let_!(f, func!(vec![x], var!(x)), app!(var!(f), vec![int!(1)]));
        assert_eq!(split(input), input);
    }
}
