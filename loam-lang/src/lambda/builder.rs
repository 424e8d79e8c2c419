//! Construction helpers for tests and for hand-written IR fragments.

pub use crate::lambda::{Constant, Lam, Prim};

use crate::interner::{Ident, Symbol};

pub fn str_to_symbol<T: ToString>(x: T) -> Symbol {
    use crate::interner::ToSymbol;
    x.to_string().to_symbol()
}

/// Fresh identifier with a human-readable name.
pub fn ident(name: &str) -> Ident {
    Ident::fresh(str_to_symbol(name))
}

#[macro_export]
macro_rules! int {
    ($n:expr) => {
        $crate::lambda::Lam::Const($crate::lambda::Constant::Int($n)).into_id_without_span()
    };
}

#[macro_export]
macro_rules! string_c {
    ($s:expr) => {
        $crate::lambda::Lam::Const($crate::lambda::Constant::Str(
            $crate::lambda::builder::str_to_symbol($s),
        ))
        .into_id_without_span()
    };
}

#[macro_export]
macro_rules! var {
    ($id:expr) => {
        $crate::lambda::Lam::Var($id).into_id_without_span()
    };
}

#[macro_export]
macro_rules! app {
    ($f:expr, $args:expr) => {
        $crate::lambda::Lam::Apply($crate::lambda::Apply {
            func: $f,
            args: $args,
            loc: $crate::dummy_span!(),
            tailcall: Default::default(),
            inlined: Default::default(),
        })
        .into_id_without_span()
    };
}

/// Curried function with generic-kinded parameters and default attributes.
#[macro_export]
macro_rules! func {
    ($params:expr, $body:expr) => {
        $crate::func!($params, $body, Default::default())
    };
    ($params:expr, $body:expr, $attrs:expr) => {
        $crate::lambda::Lam::Function($crate::lambda::Lfunction {
            kind: $crate::lambda::FunctionKind::Curried,
            params: $params
                .into_iter()
                .map(|p: $crate::interner::Ident| (p, $crate::lambda::ValueKind::Generic))
                .collect(),
            return_kind: $crate::lambda::ValueKind::Generic,
            body: $body,
            attrs: $attrs,
            loc: $crate::dummy_span!(),
        })
        .into_id_without_span()
    };
}

#[macro_export]
macro_rules! let_ {
    ($id:expr, $value:expr, $body:expr) => {
        $crate::let_!(
            $crate::lambda::LetKind::Strict,
            $crate::lambda::ValueKind::Generic,
            $id,
            $value,
            $body
        )
    };
    ($kind:expr, $vkind:expr, $id:expr, $value:expr, $body:expr) => {
        $crate::lambda::Lam::Let($kind, $vkind, $id, $value, $body).into_id_without_span()
    };
}

#[macro_export]
macro_rules! letrec {
    ($bindings:expr, $body:expr) => {
        $crate::lambda::Lam::Letrec($bindings, $body).into_id_without_span()
    };
}

#[macro_export]
macro_rules! prim {
    ($p:expr, $args:expr) => {
        $crate::lambda::Lam::Prim($p, $args, $crate::dummy_span!()).into_id_without_span()
    };
}

/// Immutable block allocation with no shape information.
#[macro_export]
macro_rules! block {
    ($tag:expr, $args:expr) => {
        $crate::prim!(
            $crate::lambda::Prim::Makeblock(
                $tag,
                $crate::lambda::Mutability::Immutable,
                None
            ),
            $args
        )
    };
}

#[macro_export]
macro_rules! field {
    ($i:expr, $e:expr) => {
        $crate::prim!($crate::lambda::Prim::Field($i), vec![$e])
    };
}

#[macro_export]
macro_rules! seq {
    ($a:expr, $b:expr) => {
        $crate::lambda::Lam::Sequence($a, $b).into_id_without_span()
    };
}

#[macro_export]
macro_rules! ifthen {
    ($c:expr, $t:expr, $e:expr) => {
        $crate::lambda::Lam::Ifthenelse($c, $t, $e).into_id_without_span()
    };
}

#[macro_export]
macro_rules! raise_ {
    ($label:expr, $args:expr) => {
        $crate::lambda::Lam::Staticraise($label, $args).into_id_without_span()
    };
}

#[macro_export]
macro_rules! catch {
    ($body:expr, $label:expr, $params:expr, $handler:expr) => {
        $crate::lambda::Lam::Staticcatch(
            $body,
            (
                $label,
                $params
                    .into_iter()
                    .map(|p: $crate::interner::Ident| (p, $crate::lambda::ValueKind::Generic))
                    .collect(),
            ),
            $handler,
        )
        .into_id_without_span()
    };
}

#[macro_export]
macro_rules! try_ {
    ($body:expr, $exn:expr, $handler:expr) => {
        $crate::lambda::Lam::Trywith($body, $exn, $handler).into_id_without_span()
    };
}

#[macro_export]
macro_rules! assign {
    ($id:expr, $value:expr) => {
        $crate::lambda::Lam::Assign($id, $value).into_id_without_span()
    };
}
