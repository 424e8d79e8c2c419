//! S-expression printing of lambda terms, for logs and test output.

use crate::interner::LamNodeId;
use crate::lambda::{Constant, Direction, Lam, LetKind, Prim};

pub trait MiniPrint {
    fn simple_print(&self) -> String;

    fn pretty_print(&self) -> String {
        let src = self.simple_print();
        let mut level = 0;
        let mut res = String::new();
        let indent = "   ";
        for c in src.chars() {
            match c {
                '(' => {
                    level += 1;
                }
                ')' => {
                    level -= 1;
                }
                ' ' => {
                    res.push('\n');
                    for _i in 0..level {
                        res.push_str(indent);
                    }
                }
                _ => {}
            }

            res.push(c);
        }
        res
    }
}

fn concat_ids(ids: &[LamNodeId]) -> String {
    ids.iter()
        .map(|e| e.simple_print())
        .collect::<Vec<_>>()
        .join(" ")
}

impl MiniPrint for Constant {
    fn simple_print(&self) -> String {
        match self {
            Constant::Int(n) => format!("{}", n),
            Constant::Str(s) => format!("{:?}", s.as_str()),
            Constant::Block(tag, fields) => {
                let fs = fields
                    .iter()
                    .map(|c| c.simple_print())
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("(constblock {} {})", tag, fs)
            }
        }
    }
}

impl MiniPrint for LamNodeId {
    fn simple_print(&self) -> String {
        self.to_lam().simple_print()
    }
}

impl MiniPrint for Lam {
    fn simple_print(&self) -> String {
        match self {
            Lam::Var(v) => v.to_string(),
            Lam::Const(c) => c.simple_print(),
            Lam::Apply(ap) => format!(
                "(apply {} {})",
                ap.func.simple_print(),
                concat_ids(&ap.args)
            ),
            Lam::Function(lf) => {
                let params = lf
                    .params
                    .iter()
                    .map(|(p, _)| p.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("(function ({}) {})", params, lf.body.simple_print())
            }
            Lam::Let(kind, _, v, value, body) => {
                let k = match kind {
                    LetKind::Strict => "let",
                    LetKind::Alias => "let-alias",
                    LetKind::StrictOpt => "let-opt",
                    LetKind::Variable => "let-var",
                };
                format!(
                    "({} {} {} {})",
                    k,
                    v,
                    value.simple_print(),
                    body.simple_print()
                )
            }
            Lam::Letrec(bindings, body) => {
                let bs = bindings
                    .iter()
                    .map(|(v, e)| format!("({} {})", v, e.simple_print()))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("(letrec ({}) {})", bs, body.simple_print())
            }
            Lam::Prim(p, args, _) => {
                let name = match p {
                    Prim::Makeblock(tag, _, _) => format!("makeblock[{}]", tag),
                    Prim::Field(i) => format!("field[{}]", i),
                    Prim::Setfield(i, _) => format!("setfield[{}]", i),
                    Prim::SetfieldComputed(_) => "setfield-computed".to_string(),
                    Prim::Offsetref(d) => format!("offsetref[{}]", d),
                    Prim::Offsetint(d) => format!("offsetint[{}]", d),
                    Prim::Revapply => "revapply".to_string(),
                    Prim::Dirapply => "dirapply".to_string(),
                    Prim::Identity => "identity".to_string(),
                    Prim::BytesToString => "bytes-to-string".to_string(),
                    Prim::BytesOfString => "bytes-of-string".to_string(),
                    Prim::Opaque => "opaque".to_string(),
                    Prim::Sequand => "and".to_string(),
                    Prim::Sequor => "or".to_string(),
                    Prim::Not => "not".to_string(),
                    Prim::Negint => "neg".to_string(),
                    Prim::Addint => "add".to_string(),
                    Prim::Subint => "sub".to_string(),
                    Prim::Mulint => "mul".to_string(),
                    Prim::Intcomp(c) => format!("cmp{:?}", c).to_lowercase(),
                    Prim::Raise => "raise".to_string(),
                    Prim::Extcall(name) => format!("extcall[{}]", name),
                };
                format!("({} {})", name, concat_ids(args))
            }
            Lam::Switch(scrut, sw, _) => {
                let consts = sw
                    .consts
                    .iter()
                    .map(|(n, e)| format!("(int {} {})", n, e.simple_print()))
                    .collect::<Vec<_>>()
                    .join(" ");
                let blocks = sw
                    .blocks
                    .iter()
                    .map(|(n, e)| format!("(tag {} {})", n, e.simple_print()))
                    .collect::<Vec<_>>()
                    .join(" ");
                let fail = sw
                    .failaction
                    .map_or("".to_string(), |e| format!(" (default {})", e.simple_print()));
                format!(
                    "(switch {} {} {}{})",
                    scrut.simple_print(),
                    consts,
                    blocks,
                    fail
                )
            }
            Lam::Stringswitch(scrut, cases, default, _) => {
                let cs = cases
                    .iter()
                    .map(|(s, e)| format!("({:?} {})", s.as_str(), e.simple_print()))
                    .collect::<Vec<_>>()
                    .join(" ");
                let fail = default
                    .map_or("".to_string(), |e| format!(" (default {})", e.simple_print()));
                format!("(stringswitch {} {}{})", scrut.simple_print(), cs, fail)
            }
            Lam::Staticraise(label, args) => format!("(exit {} {})", label, concat_ids(args)),
            Lam::Staticcatch(body, (label, params), handler) => {
                let ps = params
                    .iter()
                    .map(|(p, _)| p.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "(catch {} with ({} {}) {})",
                    body.simple_print(),
                    label,
                    ps,
                    handler.simple_print()
                )
            }
            Lam::Trywith(body, exn, handler) => format!(
                "(try {} with {} {})",
                body.simple_print(),
                exn,
                handler.simple_print()
            ),
            Lam::Ifthenelse(c, t, e) => format!(
                "(if {} {} {})",
                c.simple_print(),
                t.simple_print(),
                e.simple_print()
            ),
            Lam::Sequence(a, b) => format!("(seq {} {})", a.simple_print(), b.simple_print()),
            Lam::While(c, b) => format!("(while {} {})", c.simple_print(), b.simple_print()),
            Lam::For(v, lo, hi, dir, body) => {
                let d = match dir {
                    Direction::Up => "to",
                    Direction::Down => "downto",
                };
                format!(
                    "(for {} {} {} {} {})",
                    v,
                    lo.simple_print(),
                    d,
                    hi.simple_print(),
                    body.simple_print()
                )
            }
            Lam::Assign(v, e) => format!("(assign {} {})", v, e.simple_print()),
            Lam::Send(met, obj, args, _) => format!(
                "(send {} {} {})",
                met.simple_print(),
                obj.simple_print(),
                concat_ids(args)
            ),
            Lam::Event(e, _) => format!("(event {})", e.simple_print()),
            Lam::Ifused(v, e) => format!("(ifused {} {})", v, e.simple_print()),
        }
    }
}
