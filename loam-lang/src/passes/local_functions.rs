//! Promotion of local functions into static-exception handlers.
//!
//! A let-bound function that never escapes and whose every call is a full
//! application in tail position of one common scope can be compiled as a
//! continuation: the scope is wrapped in a `Staticcatch` whose handler is
//! the function body, and the calls become `Staticraise`. The analysis
//! tracks the current "tail scope", the outermost node the current position
//! is a tail position of, by node identity.

use std::collections::HashMap;

use crate::interner::{next_raise_count, Ident, LamNodeId};
use crate::lambda::traverse::{shallow_iter, shallow_map};
use crate::lambda::{InlineAttr, Lam, Lfunction, LocalAttr};
use crate::passes::exact_application;
use crate::warnings::{Warning, Warnings};

struct Slot {
    func: Lfunction,
    scope: Option<LamNodeId>,
}

struct LocalFunctions<'w> {
    warnings: &'w mut Warnings,
    /// Candidates still in the running, keyed by their binding.
    slots: HashMap<Ident, Slot>,
    /// Function id -> the exit label its calls become, plus the function
    /// itself (needed to unpack tupled call sites during the rewrite).
    static_id: HashMap<Ident, (u32, Lfunction)>,
    /// Scope node (by identity) -> handlers to install there, in discovery
    /// order; later entries wrap earlier ones.
    static_handlers: HashMap<usize, Vec<(u32, Lfunction)>>,
    current_scope: LamNodeId,
}

pub fn promote(warnings: &mut Warnings, lam: LamNodeId) -> LamNodeId {
    log::trace!("promote_local_functions");
    let mut pass = LocalFunctions {
        warnings,
        slots: HashMap::new(),
        static_id: HashMap::new(),
        static_handlers: HashMap::new(),
        current_scope: lam,
    };
    pass.tail(lam);
    pass.rewrite(lam)
}

fn enabled(lf: &Lfunction) -> bool {
    match lf.attrs.local {
        LocalAttr::Always => true,
        LocalAttr::Never => false,
        LocalAttr::Default => matches!(
            lf.attrs.inline,
            InlineAttr::Never | InlineAttr::Default
        ),
    }
}

impl LocalFunctions<'_> {
    fn check_static(&mut self, lf: &Lfunction) {
        if lf.attrs.local == LocalAttr::Always {
            self.warnings
                .warn(lf.loc.clone(), Warning::InliningImpossible);
        }
    }

    fn tail(&mut self, lam: LamNodeId) {
        match lam.to_lam() {
            Lam::Let(_, _, id, def, cont) if is_enabled_function(*def) => {
                let lf = match def.to_lam() {
                    Lam::Function(lf) => lf.clone(),
                    _ => unreachable!(),
                };
                self.slots.insert(
                    *id,
                    Slot {
                        func: lf.clone(),
                        scope: None,
                    },
                );
                self.tail(*cont);
                match self.slots.get(id).and_then(|slot| slot.scope) {
                    Some(scope) => {
                        // The handler cannot be hoisted above its own
                        // binding, so a scope that still covers the binding
                        // narrows to the continuation.
                        let sc = if scope.index() == self.current_scope.index() {
                            *cont
                        } else {
                            scope
                        };
                        let st = next_raise_count();
                        self.static_id.insert(*id, (st, lf.clone()));
                        self.static_handlers
                            .entry(sc.index())
                            .or_default()
                            .push((st, lf.clone()));
                        // The body becomes a handler on that scope.
                        self.with_scope(scope, lf.body);
                    }
                    None => {
                        self.check_static(&lf);
                        // Unused, escaped, or scope-conflicted: analyze the
                        // definition as an ordinary function.
                        self.non_tail(*def);
                    }
                }
                self.slots.remove(id);
            }
            Lam::Apply(ap) if is_slot_call(&self.slots, ap) => {
                let id = match ap.func.to_lam() {
                    Lam::Var(id) => *id,
                    _ => unreachable!(),
                };
                let (arity_ok, scope) = {
                    let slot = self.slots.get(&id).unwrap();
                    (
                        exact_application(&slot.func, &ap.args).is_some(),
                        slot.scope,
                    )
                };
                if !arity_ok {
                    // Partial or over-application: the call needs a real
                    // closure.
                    self.slots.remove(&id);
                } else {
                    match scope {
                        Some(scope) if scope.index() != self.current_scope.index() => {
                            self.slots.remove(&id);
                        }
                        Some(_) => {}
                        None => {
                            let scope = self.current_scope;
                            self.slots.get_mut(&id).unwrap().scope = Some(scope);
                        }
                    }
                }
                for a in &ap.args {
                    self.non_tail(*a);
                }
            }
            Lam::Var(id) => {
                // Any other reference is an escape.
                self.slots.remove(id);
            }
            _ => {
                let this = std::cell::RefCell::new(&mut *self);
                let mut t = |l: LamNodeId| this.borrow_mut().tail(l);
                let mut nt = |l: LamNodeId| this.borrow_mut().non_tail(l);
                shallow_iter(&mut t, &mut nt, lam);
            }
        }
    }

    fn non_tail(&mut self, lam: LamNodeId) {
        self.with_scope(lam, lam)
    }

    fn with_scope(&mut self, scope: LamNodeId, lam: LamNodeId) {
        let old_scope = self.current_scope;
        self.current_scope = scope;
        self.tail(lam);
        self.current_scope = old_scope;
    }

    fn rewrite(&mut self, lam0: LamNodeId) -> LamNodeId {
        let lam = match lam0.to_lam() {
            Lam::Let(_, _, id, _, cont) if self.static_id.contains_key(id) => self.rewrite(*cont),
            Lam::Apply(ap) if is_static_call(&self.static_id, ap) => {
                let id = match ap.func.to_lam() {
                    Lam::Var(id) => *id,
                    _ => unreachable!(),
                };
                let (st, lf) = self.static_id[&id].clone();
                // The analysis only kept exact applications, so this cannot
                // fail; unpacking also flattens tupled call sites.
                let exact = exact_application(&lf, &ap.args)
                    .expect("promoted call site is no longer an exact application");
                Lam::Staticraise(st, exact.iter().map(|a| self.rewrite(*a)).collect())
                    .into_id(lam0.to_span())
            }
            _ => shallow_map(&mut |c| self.rewrite(c), lam0),
        };
        match self.static_handlers.remove(&lam0.index()) {
            None => lam,
            Some(handlers) => handlers.into_iter().fold(lam, |acc, (st, lf)| {
                let handler = self.rewrite(lf.body);
                Lam::Staticcatch(acc, (st, lf.params.clone()), handler)
                    .into_id(lam0.to_span())
            }),
        }
    }

}

fn is_enabled_function(def: LamNodeId) -> bool {
    matches!(def.to_lam(), Lam::Function(lf) if enabled(lf))
}

fn is_slot_call(slots: &HashMap<Ident, Slot>, ap: &crate::lambda::Apply) -> bool {
    matches!(ap.func.to_lam(), Lam::Var(id) if slots.contains_key(id))
}

fn is_static_call(static_id: &HashMap<Ident, (u32, Lfunction)>, ap: &crate::lambda::Apply) -> bool {
    matches!(ap.func.to_lam(), Lam::Var(id) if static_id.contains_key(id))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::lambda::traverse::alpha_eq;
    use crate::lambda::{FunctionAttrs, Prim};
    use crate::warnings::Warning;
    use crate::{app, catch, func, ifthen, int, let_, prim, raise_, var};

    #[test]
    fn two_tail_calls_in_one_scope_become_a_catch() {
        let g = ident("g");
        let x = ident("x");
        let c = ident("c");
        let body_g = prim!(Prim::Addint, vec![var!(x), int!(1)]);
        let input = let_!(
            g,
            func!(vec![x], body_g),
            ifthen!(
                var!(c),
                app!(var!(g), vec![int!(10)]),
                app!(var!(g), vec![int!(20)])
            )
        );
        let mut warnings = Warnings::new();
        let output = promote(&mut warnings, input);

        let x2 = ident("x");
        let expected = catch!(
            ifthen!(var!(c), raise_!(99, vec![int!(10)]), raise_!(99, vec![int!(20)])),
            99,
            vec![x2],
            prim!(Prim::Addint, vec![var!(x2), int!(1)])
        );
        assert!(alpha_eq(output, expected));
        assert!(warnings.is_empty());
    }

    #[test]
    fn escaping_function_is_left_alone() {
        let g = ident("g");
        let x = ident("x");
        let h = ident("h");
        let input = let_!(
            g,
            func!(vec![x], var!(x)),
            app!(var!(h), vec![var!(g)])
        );
        let mut warnings = Warnings::new();
        let output = promote(&mut warnings, input);
        assert!(alpha_eq(output, input));
    }

    #[test]
    fn arity_mismatch_disables_promotion() {
        let g = ident("g");
        let x = ident("x");
        let input = let_!(
            g,
            func!(vec![x], var!(x)),
            app!(var!(g), vec![int!(1), int!(2)])
        );
        let mut warnings = Warnings::new();
        let output = promote(&mut warnings, input);
        assert!(matches!(output.to_lam(), Lam::Let(..)));
    }

    #[test]
    fn non_tail_call_sites_in_distinct_scopes_disable_promotion() {
        // g is called from two different non-tail scopes.
        let g = ident("g");
        let x = ident("x");
        let input = let_!(
            g,
            func!(vec![x], var!(x)),
            prim!(
                Prim::Addint,
                vec![
                    app!(var!(g), vec![int!(1)]),
                    app!(var!(g), vec![int!(2)])
                ]
            )
        );
        let mut warnings = Warnings::new();
        let output = promote(&mut warnings, input);
        assert!(matches!(output.to_lam(), Lam::Let(..)));
    }

    #[test]
    fn always_local_failure_warns() {
        let g = ident("g");
        let x = ident("x");
        let h = ident("h");
        let attrs = FunctionAttrs {
            local: crate::lambda::LocalAttr::Always,
            ..Default::default()
        };
        let input = let_!(
            g,
            func!(vec![x], var!(x), attrs),
            app!(var!(h), vec![var!(g)])
        );
        let mut warnings = Warnings::new();
        promote(&mut warnings, input);
        assert!(warnings.contains(&Warning::InliningImpossible));
    }
}
