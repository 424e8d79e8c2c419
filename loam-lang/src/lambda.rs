pub mod builder;
pub mod eval;
pub mod print;
pub mod traverse;

use crate::interner::{with_session_globals, Ident, LamNodeId, Symbol};
use crate::utils::metadata::Span;

/// Compile-time constant.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Int(i64),
    Str(Symbol),
    Block(u8, Vec<Constant>),
}

/// How a `Let` binding may be simplified.
///
/// - `Strict`: the value must be evaluated; the body may or may not use it.
/// - `Alias`: the value is pure and may be duplicated or dropped freely.
/// - `StrictOpt`: like `Strict`, but droppable when the variable is unused.
/// - `Variable`: the identifier is a mutable cell, read with `Var` and
///   written with `Assign`. Only produced by the reference promotion of the
///   let-simplification pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LetKind {
    Strict,
    Alias,
    StrictOpt,
    Variable,
}

/// Opaque representation hint attached to bindings and function returns.
/// Passes preserve these; only the reference promotion picks a new one from
/// a block shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ValueKind {
    #[default]
    Generic,
    Int,
    Float,
    Ptr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Curried,
    Tupled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InlineAttr {
    #[default]
    Default,
    Always,
    Never,
    Hint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LocalAttr {
    #[default]
    Default,
    Always,
    Never,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FunctionAttrs {
    pub inline: InlineAttr,
    pub local: LocalAttr,
    /// Candidate for the tail-modulo-cons expansion.
    pub tmc_candidate: bool,
    /// Compiler-generated wrapper (e.g. around default-argument defaults);
    /// exempt from most diagnostics.
    pub stub: bool,
}

/// Call-site tail-call expectation, from a user annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TailcallHint {
    #[default]
    Default,
    Expect(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Apply {
    pub func: LamNodeId,
    pub args: Vec<LamNodeId>,
    pub loc: Span,
    pub tailcall: TailcallHint,
    pub inlined: InlineAttr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Lfunction {
    pub kind: FunctionKind,
    pub params: Vec<(Ident, ValueKind)>,
    pub return_kind: ValueKind,
    pub body: LamNodeId,
    pub attrs: FunctionAttrs,
    pub loc: Span,
}

impl Lfunction {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutability {
    Mutable,
    Immutable,
}

/// Whether a field write initializes fresh memory or overwrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignMode {
    HeapInit,
    Assignment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntComparison {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Prim {
    /// Allocate a heap block: tag, mutability, and optional per-field kinds.
    Makeblock(u8, Mutability, Option<Vec<ValueKind>>),
    Field(usize),
    Setfield(usize, AssignMode),
    /// Store at a dynamic offset: `[block, offset, value]`.
    SetfieldComputed(AssignMode),
    /// In-place increment of the single field of a ref cell.
    Offsetref(i64),
    Offsetint(i64),
    /// `x |> f`, contracted into a plain `Apply` by exit simplification.
    Revapply,
    /// `f @@ x`, likewise.
    Dirapply,
    Identity,
    BytesToString,
    BytesOfString,
    Opaque,
    Sequand,
    Sequor,
    Not,
    Negint,
    Addint,
    Subint,
    Mulint,
    Intcomp(IntComparison),
    Raise,
    /// Call to an external primitive by name.
    Extcall(Symbol),
}

/// Discriminated match on an integer or block tag. `numconsts`/`numblocks`
/// are the total numbers of constructors of each family in the scrutinee's
/// type; the arm lists may cover fewer, in which case `failaction` applies.
#[derive(Clone, Debug, PartialEq)]
pub struct Switch {
    pub numconsts: usize,
    pub consts: Vec<(usize, LamNodeId)>,
    pub numblocks: usize,
    pub blocks: Vec<(usize, LamNodeId)>,
    pub failaction: Option<LamNodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Before,
    After,
    Pseudo,
}

/// Debugger event annotation; transparent to every pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DebugEvent {
    pub kind: EventKind,
    pub loc: Span,
}

/// The lambda IR. A term of this type is the body of one compilation unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Lam {
    Var(Ident),
    Const(Constant),
    Apply(Apply),
    Function(Lfunction),
    Let(LetKind, ValueKind, Ident, LamNodeId, LamNodeId),
    Letrec(Vec<(Ident, LamNodeId)>, LamNodeId),
    Prim(Prim, Vec<LamNodeId>, Span),
    Switch(LamNodeId, Switch, Span),
    Stringswitch(LamNodeId, Vec<(Symbol, LamNodeId)>, Option<LamNodeId>, Span),
    Staticraise(u32, Vec<LamNodeId>),
    Staticcatch(LamNodeId, (u32, Vec<(Ident, ValueKind)>), LamNodeId),
    Trywith(LamNodeId, Ident, LamNodeId),
    Ifthenelse(LamNodeId, LamNodeId, LamNodeId),
    Sequence(LamNodeId, LamNodeId),
    While(LamNodeId, LamNodeId),
    For(Ident, LamNodeId, LamNodeId, Direction, LamNodeId),
    Assign(Ident, LamNodeId),
    Send(LamNodeId, LamNodeId, Vec<LamNodeId>, Span),
    Event(LamNodeId, DebugEvent),
    /// Keep the subterm only if the variable ended up used; emitted by the
    /// front end for prelude code that should vanish with its binding.
    Ifused(Ident, LamNodeId),
}

impl Lam {
    pub fn into_id(self, span: Span) -> LamNodeId {
        with_session_globals(|session_globals| session_globals.store_lam_with_span(self, span))
    }

    pub fn into_id_without_span(self) -> LamNodeId {
        self.into_id(0..0)
    }
}

/// The unit value.
pub fn unit() -> LamNodeId {
    Lam::Const(Constant::Int(0)).into_id_without_span()
}

/// Native code rejects functions beyond this arity, so curry-merging stops
/// short of it.
pub const MAX_FUNCTION_ARITY: usize = 126;
