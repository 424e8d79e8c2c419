//! Big-step interpreter for closed lambda terms.
//!
//! This is a reference evaluator, used by the test suite to check that the
//! passes preserve observable behavior. It is not a production runtime:
//! method dispatch is unsupported and arity must match exactly.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use itertools::Itertools;

use crate::interner::{Ident, LamNodeId, Symbol};
use crate::lambda::{
    Constant, Direction, FunctionKind, IntComparison, Lam, LetKind, Lfunction, Prim,
};
use crate::utils::metadata::Span;

#[derive(Clone, Debug)]
pub enum Value {
    Int(i64),
    Str(Symbol),
    Block(Rc<RefCell<BlockVal>>),
    Closure(Rc<ClosureVal>),
    /// Mutable cell introduced by `Let(Variable, …)`.
    Cell(Rc<RefCell<Value>>),
}

#[derive(Clone, Debug)]
pub struct BlockVal {
    pub tag: u8,
    pub fields: Vec<Value>,
}

pub struct ClosureVal {
    kind: FunctionKind,
    params: Vec<Ident>,
    body: LamNodeId,
    env: Env,
    /// Bindings of the enclosing `Letrec`, re-entered on call.
    recs: Vec<(Ident, LamNodeId)>,
}

impl fmt::Debug for ClosureVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<closure/{}>", self.params.len())
    }
}

type Env = Vec<(Ident, Value)>;

#[derive(Debug)]
pub enum EvalError {
    UnboundVariable(Ident, Span),
    TypeMismatch(&'static str, Span),
    ArityMismatch(Span),
    UncaughtStaticException(u32),
    UncaughtException,
    Unsupported(&'static str, Span),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnboundVariable(v, _) => write!(f, "unbound variable {}", v),
            EvalError::TypeMismatch(what, _) => write!(f, "expected {}", what),
            EvalError::ArityMismatch(_) => write!(f, "wrong number of arguments"),
            EvalError::UncaughtStaticException(label) => {
                write!(f, "uncaught static exception {}", label)
            }
            EvalError::UncaughtException => write!(f, "uncaught exception"),
            EvalError::Unsupported(what, _) => write!(f, "unsupported: {}", what),
        }
    }
}
impl std::error::Error for EvalError {}

/// Non-local control flow during evaluation.
enum Unwind {
    Static(u32, Vec<Value>),
    Exn(Value),
    Fail(EvalError),
}

type EvalResult = Result<Value, Unwind>;

impl From<EvalError> for Unwind {
    fn from(e: EvalError) -> Self {
        Unwind::Fail(e)
    }
}

/// Evaluate a closed term.
pub fn eval_program(lam: LamNodeId) -> Result<Value, EvalError> {
    match eval(&mut Vec::new(), lam) {
        Ok(v) => Ok(v),
        Err(Unwind::Fail(e)) => Err(e),
        Err(Unwind::Static(label, _)) => Err(EvalError::UncaughtStaticException(label)),
        Err(Unwind::Exn(_)) => Err(EvalError::UncaughtException),
    }
}

fn lookup(env: &Env, v: Ident, span: Span) -> Result<Value, Unwind> {
    env.iter()
        .rev()
        .find(|(id, _)| *id == v)
        .map(|(_, value)| value.clone())
        .ok_or_else(|| EvalError::UnboundVariable(v, span).into())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Int(n) => *n != 0,
        _ => true,
    }
}

fn as_int(value: Value, span: Span) -> Result<i64, Unwind> {
    match value {
        Value::Int(n) => Ok(n),
        _ => Err(EvalError::TypeMismatch("an integer", span).into()),
    }
}

fn as_block(value: Value, span: Span) -> Result<Rc<RefCell<BlockVal>>, Unwind> {
    match value {
        Value::Block(b) => Ok(b),
        _ => Err(EvalError::TypeMismatch("a block", span).into()),
    }
}

fn const_value(c: &Constant) -> Value {
    match c {
        Constant::Int(n) => Value::Int(*n),
        Constant::Str(s) => Value::Str(*s),
        Constant::Block(tag, fields) => Value::Block(Rc::new(RefCell::new(BlockVal {
            tag: *tag,
            fields: fields.iter().map(const_value).collect(),
        }))),
    }
}

fn eval(env: &mut Env, lam: LamNodeId) -> EvalResult {
    let span = lam.to_span();
    match lam.to_lam() {
        Lam::Var(v) => {
            let value = lookup(env, *v, span)?;
            // Reads of promoted cells are written as plain variable reads.
            match value {
                Value::Cell(cell) => Ok(cell.borrow().clone()),
                other => Ok(other),
            }
        }
        Lam::Const(c) => Ok(const_value(c)),
        Lam::Apply(ap) => {
            let func = eval(env, ap.func)?;
            let args = ap
                .args
                .iter()
                .map(|a| eval(env, *a))
                .collect::<Result<Vec<_>, _>>()?;
            apply(func, args, ap.loc.clone())
        }
        Lam::Function(lf) => Ok(close(env, lf)),
        Lam::Let(LetKind::Variable, _, v, value, body) => {
            let init = eval(env, *value)?;
            env.push((*v, Value::Cell(Rc::new(RefCell::new(init)))));
            let result = eval(env, *body);
            env.pop();
            result
        }
        Lam::Let(_, _, v, value, body) => {
            let value = eval(env, *value)?;
            env.push((*v, value));
            let result = eval(env, *body);
            env.pop();
            result
        }
        Lam::Letrec(bindings, body) => {
            let depth = env.len();
            bind_recs(env, bindings);
            let result = eval(env, *body);
            env.truncate(depth);
            result
        }
        Lam::Prim(p, args, loc) => eval_prim(env, p, args, loc.clone()),
        Lam::Switch(scrut, sw, loc) => {
            let scrutinee = eval(env, *scrut)?;
            let arm = match &scrutinee {
                Value::Int(n) => sw
                    .consts
                    .iter()
                    .find(|(k, _)| *k == *n as usize)
                    .map(|(_, e)| *e),
                Value::Block(b) => {
                    let tag = b.borrow().tag as usize;
                    sw.blocks.iter().find(|(k, _)| *k == tag).map(|(_, e)| *e)
                }
                _ => return Err(EvalError::TypeMismatch("a switchable value", loc.clone()).into()),
            };
            match arm.or(sw.failaction) {
                Some(e) => eval(env, e),
                None => Err(EvalError::TypeMismatch("a covered case", loc.clone()).into()),
            }
        }
        Lam::Stringswitch(scrut, cases, default, loc) => {
            let scrutinee = eval(env, *scrut)?;
            let s = match scrutinee {
                Value::Str(s) => s,
                _ => return Err(EvalError::TypeMismatch("a string", loc.clone()).into()),
            };
            match cases.iter().find(|(k, _)| *k == s).map(|(_, e)| *e).or(*default) {
                Some(e) => eval(env, e),
                None => Err(EvalError::TypeMismatch("a covered string", loc.clone()).into()),
            }
        }
        Lam::Staticraise(label, args) => {
            let values = args
                .iter()
                .map(|a| eval(env, *a))
                .collect::<Result<Vec<_>, _>>()?;
            Err(Unwind::Static(*label, values))
        }
        Lam::Staticcatch(body, (label, params), handler) => match eval(env, *body) {
            Err(Unwind::Static(raised, values)) if raised == *label => {
                if values.len() != params.len() {
                    return Err(EvalError::ArityMismatch(span).into());
                }
                let depth = env.len();
                for ((p, _), value) in params.iter().zip_eq(values) {
                    env.push((*p, value));
                }
                let result = eval(env, *handler);
                env.truncate(depth);
                result
            }
            other => other,
        },
        Lam::Trywith(body, exn, handler) => match eval(env, *body) {
            Err(Unwind::Exn(value)) => {
                env.push((*exn, value));
                let result = eval(env, *handler);
                env.pop();
                result
            }
            other => other,
        },
        Lam::Ifthenelse(c, t, e) => {
            let cond = eval(env, *c)?;
            if truthy(&cond) {
                eval(env, *t)
            } else {
                eval(env, *e)
            }
        }
        Lam::Sequence(a, b) => {
            eval(env, *a)?;
            eval(env, *b)
        }
        Lam::While(c, b) => {
            while truthy(&eval(env, *c)?) {
                eval(env, *b)?;
            }
            Ok(Value::Int(0))
        }
        Lam::For(v, lo, hi, dir, body) => {
            let lo = as_int(eval(env, *lo)?, span.clone())?;
            let hi = as_int(eval(env, *hi)?, span.clone())?;
            let range: Vec<i64> = match dir {
                Direction::Up => (lo..=hi).collect(),
                Direction::Down => (hi..=lo).rev().collect(),
            };
            for i in range {
                env.push((*v, Value::Int(i)));
                let result = eval(env, *body);
                env.pop();
                result?;
            }
            Ok(Value::Int(0))
        }
        Lam::Assign(v, e) => {
            let value = eval(env, *e)?;
            match lookup(env, *v, span.clone())? {
                Value::Cell(cell) => {
                    *cell.borrow_mut() = value;
                    Ok(Value::Int(0))
                }
                _ => Err(EvalError::TypeMismatch("a mutable cell", span).into()),
            }
        }
        Lam::Send(_, _, _, loc) => {
            Err(EvalError::Unsupported("method dispatch", loc.clone()).into())
        }
        Lam::Event(e, _) => eval(env, *e),
        Lam::Ifused(_, e) => eval(env, *e),
    }
}

fn close(env: &Env, lf: &Lfunction) -> Value {
    Value::Closure(Rc::new(ClosureVal {
        kind: lf.kind,
        params: lf.params.iter().map(|(p, _)| *p).collect(),
        body: lf.body,
        env: env.clone(),
        recs: Vec::new(),
    }))
}

/// Bind every function of a `Letrec` group; each closure remembers the group
/// so calls can re-create their mutual bindings.
fn bind_recs(env: &mut Env, bindings: &[(Ident, LamNodeId)]) {
    let base = env.clone();
    for (id, value) in bindings {
        let closure = match value.to_lam() {
            Lam::Function(lf) => Value::Closure(Rc::new(ClosureVal {
                kind: lf.kind,
                params: lf.params.iter().map(|(p, _)| *p).collect(),
                body: lf.body,
                env: base.clone(),
                recs: bindings.to_vec(),
            })),
            // Non-function letrec values cannot be recursive here.
            _ => Value::Int(0),
        };
        env.push((*id, closure));
    }
}

fn apply(func: Value, mut args: Vec<Value>, loc: Span) -> EvalResult {
    let closure = match func {
        Value::Closure(c) => c,
        _ => return Err(EvalError::TypeMismatch("a function", loc).into()),
    };
    if closure.kind == FunctionKind::Tupled && args.len() == 1 {
        let unpacked = match &args[0] {
            Value::Block(b) => Some(b.borrow().fields.clone()),
            _ => None,
        };
        if let Some(fields) = unpacked {
            args = fields;
        }
    }
    if args.len() != closure.params.len() {
        return Err(EvalError::ArityMismatch(loc).into());
    }
    let mut env = closure.env.clone();
    if !closure.recs.is_empty() {
        bind_recs(&mut env, &closure.recs);
    }
    for (p, value) in closure.params.iter().zip_eq(args) {
        env.push((*p, value));
    }
    eval(&mut env, closure.body)
}

fn eval_prim(env: &mut Env, p: &Prim, args: &[LamNodeId], loc: Span) -> EvalResult {
    // The short-circuiting primitives must not evaluate their second
    // argument eagerly.
    match p {
        Prim::Sequand => {
            let lhs = eval(env, args[0])?;
            return if truthy(&lhs) { eval(env, args[1]) } else { Ok(lhs) };
        }
        Prim::Sequor => {
            let lhs = eval(env, args[0])?;
            return if truthy(&lhs) { Ok(lhs) } else { eval(env, args[1]) };
        }
        _ => {}
    }
    let values = args
        .iter()
        .map(|a| eval(env, *a))
        .collect::<Result<Vec<_>, _>>()?;
    if let Prim::Makeblock(tag, _, _) = p {
        return Ok(Value::Block(Rc::new(RefCell::new(BlockVal {
            tag: *tag,
            fields: values,
        }))));
    }
    match (p, values.as_slice()) {
        (Prim::Field(i), [b]) => {
            let block = as_block(b.clone(), loc.clone())?;
            let block = block.borrow();
            block
                .fields
                .get(*i)
                .cloned()
                .ok_or_else(|| EvalError::TypeMismatch("a wide enough block", loc).into())
        }
        (Prim::Setfield(i, _), [b, value]) => {
            let block = as_block(b.clone(), loc.clone())?;
            block.borrow_mut().fields[*i] = value.clone();
            Ok(Value::Int(0))
        }
        (Prim::SetfieldComputed(_), [b, offset, value]) => {
            let block = as_block(b.clone(), loc.clone())?;
            let offset = as_int(offset.clone(), loc)? as usize;
            block.borrow_mut().fields[offset] = value.clone();
            Ok(Value::Int(0))
        }
        (Prim::Offsetref(delta), [b]) => {
            let block = as_block(b.clone(), loc.clone())?;
            let mut block = block.borrow_mut();
            let old = match block.fields[0] {
                Value::Int(n) => n,
                _ => return Err(EvalError::TypeMismatch("an int ref", loc).into()),
            };
            block.fields[0] = Value::Int(old + delta);
            Ok(Value::Int(0))
        }
        (Prim::Offsetint(delta), [n]) => Ok(Value::Int(as_int(n.clone(), loc)? + delta)),
        (Prim::Revapply, [x, f]) => apply(f.clone(), vec![x.clone()], loc),
        (Prim::Dirapply, [f, x]) => apply(f.clone(), vec![x.clone()], loc),
        (Prim::Identity, [v])
        | (Prim::Opaque, [v])
        | (Prim::BytesToString, [v])
        | (Prim::BytesOfString, [v]) => Ok(v.clone()),
        (Prim::Not, [v]) => Ok(Value::Int(if truthy(v) { 0 } else { 1 })),
        (Prim::Negint, [n]) => Ok(Value::Int(-as_int(n.clone(), loc)?)),
        (Prim::Addint, [a, b]) => {
            Ok(Value::Int(as_int(a.clone(), loc.clone())? + as_int(b.clone(), loc)?))
        }
        (Prim::Subint, [a, b]) => {
            Ok(Value::Int(as_int(a.clone(), loc.clone())? - as_int(b.clone(), loc)?))
        }
        (Prim::Mulint, [a, b]) => {
            Ok(Value::Int(as_int(a.clone(), loc.clone())? * as_int(b.clone(), loc)?))
        }
        (Prim::Intcomp(cmp), [a, b]) => {
            let a = as_int(a.clone(), loc.clone())?;
            let b = as_int(b.clone(), loc)?;
            let result = match cmp {
                IntComparison::Eq => a == b,
                IntComparison::Ne => a != b,
                IntComparison::Lt => a < b,
                IntComparison::Gt => a > b,
                IntComparison::Le => a <= b,
                IntComparison::Ge => a >= b,
            };
            Ok(Value::Int(result as i64))
        }
        (Prim::Raise, [v]) => Err(Unwind::Exn(v.clone())),
        (Prim::Extcall(name), _) if name.as_str() == "obj_with_tag" => {
            match values.as_slice() {
                [tag, block] => {
                    let tag = as_int(tag.clone(), loc.clone())? as u8;
                    let block = as_block(block.clone(), loc)?;
                    let copied = BlockVal {
                        tag,
                        fields: block.borrow().fields.clone(),
                    };
                    Ok(Value::Block(Rc::new(RefCell::new(copied))))
                }
                _ => Err(EvalError::ArityMismatch(loc).into()),
            }
        }
        (Prim::Extcall(_), _) => Err(EvalError::Unsupported("external call", loc).into()),
        _ => Err(EvalError::ArityMismatch(loc).into()),
    }
}

/// Structural comparison of values, used by tests; closures never compare
/// equal to anything but themselves.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Block(x), Value::Block(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.tag == y.tag
                && x.fields.len() == y.fields.len()
                && x.fields.iter().zip(y.fields.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        (Value::Cell(x), Value::Cell(y)) => value_eq(&x.borrow(), &y.borrow()),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lambda::builder::ident;
    use crate::{app, block, field, func, ifthen, int, letrec, prim, var};

    #[test]
    fn arithmetic_and_blocks() {
        let program = field!(
            0,
            block!(1, vec![prim!(Prim::Addint, vec![int!(2), int!(3)])])
        );
        let result = eval_program(program).unwrap();
        assert!(value_eq(&result, &Value::Int(5)));
    }

    #[test]
    fn recursion_through_letrec() {
        // let rec fact n = if n then n * fact (n - 1) else 1 in fact 5
        let fact = ident("fact");
        let n = ident("n");
        let body = ifthen!(
            var!(n),
            prim!(
                Prim::Mulint,
                vec![
                    var!(n),
                    app!(
                        var!(fact),
                        vec![prim!(Prim::Subint, vec![var!(n), int!(1)])]
                    )
                ]
            ),
            int!(1)
        );
        let program = letrec!(
            vec![(fact, func!(vec![n], body))],
            app!(var!(fact), vec![int!(5)])
        );
        let result = eval_program(program).unwrap();
        assert!(value_eq(&result, &Value::Int(120)));
    }

    #[test]
    fn static_exceptions_unwind_to_their_catch() {
        let a = ident("a");
        let program = crate::catch!(
            crate::seq!(crate::raise_!(3, vec![int!(7)]), int!(0)),
            3,
            vec![a],
            prim!(Prim::Addint, vec![var!(a), int!(1)])
        );
        let result = eval_program(program).unwrap();
        assert!(value_eq(&result, &Value::Int(8)));
    }
}
