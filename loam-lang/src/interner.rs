use std::{cell::RefCell, collections::BTreeMap, fmt};

use id_arena::{Arena, Id};
use string_interner::{backend::StringBackend, StringInterner};

use crate::{lambda::Lam, utils::metadata::Span};

/// Session-wide storage: interned names, the lambda arena, spans, and the
/// counters that hand out fresh identifier stamps and static-exception
/// labels. Lives in a thread local for the whole compilation session.
pub struct SessionGlobals {
    pub symbol_interner: StringInterner<StringBackend<usize>>,
    pub lam_storage: Arena<Lam>,
    pub span_storage: BTreeMap<usize, Span>,
    ident_stamp: u32,
    raise_count: u32,
}

impl SessionGlobals {
    fn store_lam(&mut self, lam: Lam) -> LamNodeId {
        LamNodeId(self.lam_storage.alloc(lam))
    }

    pub fn store_lam_with_span(&mut self, lam: Lam, span: Span) -> LamNodeId {
        let id = self.store_lam(lam);
        self.span_storage.insert(id.0.index(), span);
        id
    }

    pub fn get_lam(&self, id: LamNodeId) -> &Lam {
        self.lam_storage.get(id.0).expect("unknown LamNodeId")
    }

    pub fn get_span(&self, id: LamNodeId) -> Span {
        self.span_storage
            .get(&id.0.index())
            .cloned()
            .unwrap_or(0..0)
    }
}

thread_local!(static SESSION_GLOBALS: RefCell<SessionGlobals> = RefCell::new(
    SessionGlobals {
        symbol_interner: StringInterner::new(),
        lam_storage: Arena::new(),
        span_storage: BTreeMap::new(),
        ident_stamp: 0,
        raise_count: 0,
    }
));

pub fn with_session_globals<R, F>(f: F) -> R
where
    F: FnOnce(&mut SessionGlobals) -> R,
{
    SESSION_GLOBALS.with_borrow_mut(f)
}

#[derive(Default, Copy, Clone, PartialEq, Debug, Hash, Eq, PartialOrd, Ord)]
pub struct Symbol(pub usize);

pub trait ToSymbol {
    fn to_symbol(&self) -> Symbol;
}

impl<T: AsRef<str>> ToSymbol for T {
    fn to_symbol(&self) -> Symbol {
        Symbol(with_session_globals(|session_globals| {
            session_globals.symbol_interner.get_or_intern(self.as_ref())
        }))
    }
}

impl Symbol {
    pub fn as_str(&self) -> &str {
        with_session_globals(|session_globals| unsafe {
            // Session globals outlive every use of the returned &str (the
            // interner is append-only and lives until thread exit), so
            // stretching the lifetime here is sound. Same trick as the
            // expression arena below.
            std::mem::transmute::<&str, &str>(
                session_globals
                    .symbol_interner
                    .resolve(self.0)
                    .expect("invalid symbol"),
            )
        })
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A variable of the lambda IR. The stamp is globally unique within a
/// session, so identity is stamp identity; the name is only for humans.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident {
    pub name: Symbol,
    pub stamp: u32,
}

impl Ident {
    pub fn fresh(name: Symbol) -> Self {
        let stamp = with_session_globals(|session_globals| {
            session_globals.ident_stamp += 1;
            session_globals.ident_stamp
        });
        Ident { name, stamp }
    }

    pub fn fresh_str(name: &str) -> Self {
        Ident::fresh(name.to_symbol())
    }

    /// A new identifier with the same name but a fresh stamp.
    pub fn rename(&self) -> Self {
        Ident::fresh(self.name)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.stamp)
    }
}

/// Fresh label for a static exception (`Staticraise`/`Staticcatch` pair).
pub fn next_raise_count() -> u32 {
    with_session_globals(|session_globals| {
        session_globals.raise_count += 1;
        session_globals.raise_count
    })
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord)]
pub struct LamNodeId(pub Id<Lam>);

impl LamNodeId {
    pub fn to_lam(&self) -> &Lam {
        with_session_globals(|session_globals| unsafe {
            // The arena is append-only and lives for the whole session, so
            // the reference stays valid for as long as any caller can hold
            // it. The transmute only widens the lifetime.
            std::mem::transmute::<&Lam, &Lam>(session_globals.get_lam(*self))
        })
    }

    pub fn to_span(&self) -> Span {
        with_session_globals(|session_globals| session_globals.get_span(*self))
    }

    /// Arena index, used where node identity (not structural equality)
    /// matters, e.g. the tail-scope table of the local-function pass.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

// Structural equality: two node ids are equal when the trees they point at
// are equal, which is what the test suite wants out of `assert_eq!`. Node
// identity is `index()`.
impl PartialEq for LamNodeId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 || self.to_lam() == other.to_lam()
    }
}

impl Eq for LamNodeId {}
