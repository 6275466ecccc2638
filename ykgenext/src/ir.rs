//! The code emitted by specializers.
//!
//! Each specializer produces a straight-line block of [Stmt]s which ends by transferring control:
//! either to another specialized pc (via [Stmt::Goto] or [Stmt::Redispatch]), out of the function
//! ([Stmt::Return]), or nowhere ([Stmt::AssertUnreachable]). Generated code sits inside a dispatch
//! loop over the local variable `pc`, so "transferring control" means assigning to `pc` and
//! continuing the loop.
//!
//! The `Display` implementations produce an indented pseudo-source, which is what
//! `YKD_LOG_IR=genext-code` prints, e.g.:
//!
//! ```text
//! ri0 = regs_i[0]
//! if is_const(ri0):
//!     i0 = unbox(ri0)
//!     pc = 108
//!     continue
//! regs_i[1] = opimpl_int_add(ri0, const_i(i1))
//! pc = 109
//! continue
//! ```

use crate::{
    insn::{Const, Opcode, Pc, RegKind, Register},
    syncer::{syncer_name, SyncerIdx},
};
use std::fmt;

index_vec::define_index_type! {
    /// An index into the globals table of a generating extension.
    pub struct GlobalIdx = u32;
}

/// A local variable in generated code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Local {
    /// The unboxed value of a register that is known to be constant, e.g. `i0`.
    Unboxed(Register),
    /// A box read from the frame's register file, e.g. `ri0`.
    Boxed(Register),
    /// A temporary, e.g. `v0`.
    Temp(u32),
    /// The outcome of a specialized conditional branch.
    Cond,
    /// The boxed outcome of a generic comparison.
    CondBox,
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Local::Unboxed(r) => write!(f, "{}{}", r.kind().prefix(), r.index()),
            Local::Boxed(r) => write!(f, "r{}{}", r.kind().prefix(), r.index()),
            Local::Temp(x) => write!(f, "v{x}"),
            Local::Cond => write!(f, "cond"),
            Local::CondBox => write!(f, "condbox"),
        }
    }
}

/// A binary operator on unboxed values. Comparisons produce `0` or `1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum BinOp {
    #[strum(to_string = "+")]
    Add,
    #[strum(to_string = "-")]
    Sub,
    #[strum(to_string = "*")]
    Mul,
    #[strum(to_string = "|")]
    Or,
    #[strum(to_string = "&")]
    And,
    #[strum(to_string = "^")]
    Xor,
    #[strum(to_string = "<<")]
    Lshift,
    #[strum(to_string = ">>")]
    Rshift,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Le,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = ">=")]
    Ge,
    #[strum(to_string = "==")]
    Eq,
    #[strum(to_string = "!=")]
    Ne,
    /// Reference identity.
    #[strum(to_string = "is")]
    PtrEq,
    /// Short-circuiting logical and.
    #[strum(to_string = "and")]
    LogicalAnd,
}

/// A function that generated code calls back into.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Hook {
    /// The interpreter's generic implementation of an opcode, operating on boxes.
    Op(Opcode),
    /// Does the tracer already know the class of a box?
    ClassKnown,
    /// The class of a box whose class is known.
    ClsOfBox,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Op(op) => write!(f, "opimpl_{}", op.name()),
            Hook::ClassKnown => write!(f, "class_known"),
            Hook::ClsOfBox => write!(f, "cls_of_box"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Local(Local),
    /// An unboxed literal.
    Lit(Const),
    Global(GlobalIdx),
    /// Read a box from the frame's register file.
    Reg(Register),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Is a box a constant box?
    IsConst(Box<Expr>),
    /// The value inside a box.
    Unbox(Box<Expr>),
    /// Wrap an unboxed value of the given kind in a constant box.
    MakeConst(RegKind, Box<Expr>),
    NonNull(Box<Expr>),
    StrGetItem(Box<Expr>, Box<Expr>),
    ClassOf(Box<Expr>),
    /// Read a pure field through the descriptor stored in `field`. If `raw` is true, `base` is an
    /// integer address, otherwise it is a GC reference.
    GetField {
        raw: bool,
        base: Box<Expr>,
        field: GlobalIdx,
    },
    Call(Hook, Vec<Expr>),
}

impl Expr {
    pub fn binop(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::BinOp(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn int(x: i64) -> Self {
        Expr::Lit(Const::Int(x))
    }

    pub fn pc(pc: Pc) -> Self {
        Expr::Lit(Const::Int(pc.get() as i64))
    }

    /// Write `self`, parenthesising it if it is a binary operation.
    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(..) => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Local(l) => write!(f, "{l}"),
            Expr::Lit(c) => write!(f, "{c}"),
            Expr::Global(g) => write!(f, "glob{}", g.index()),
            Expr::Reg(r) => write!(f, "regs_{}[{}]", r.kind().prefix(), r.index()),
            Expr::BinOp(BinOp::LogicalAnd, lhs, rhs) => write!(f, "{lhs} and {rhs}"),
            Expr::BinOp(op, lhs, rhs) => {
                lhs.fmt_operand(f)?;
                write!(f, " {op} ")?;
                rhs.fmt_operand(f)
            }
            Expr::Not(e) => {
                write!(f, "not ")?;
                e.fmt_operand(f)
            }
            Expr::IsConst(e) => write!(f, "is_const({e})"),
            Expr::Unbox(e) => write!(f, "unbox({e})"),
            Expr::MakeConst(k, e) => write!(f, "const_{}({e})", k.prefix()),
            Expr::NonNull(e) => write!(f, "nonnull({e})"),
            Expr::StrGetItem(s, i) => write!(f, "strgetitem({s}, {i})"),
            Expr::ClassOf(e) => write!(f, "classof({e})"),
            Expr::GetField { raw, base, field } => {
                let kind = if *raw { "raw" } else { "gc" };
                write!(f, "getfield_{kind}({base}, glob{})", field.index())
            }
            Expr::Call(h, args) => {
                let args = args
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{h}({args})")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Comment(String),
    Assign(Local, Expr),
    /// Write a box into the frame's register file.
    SetReg(Register, Expr),
    SetFramePc(Pc),
    /// Evaluate an expression for its side effects.
    Eval(Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        else_: Vec<Stmt>,
    },
    /// Write the constant values of `regs` back into the register file as constant boxes.
    SyncRegs(SyncerIdx, Vec<Register>),
    /// Continue execution at a specialized pc.
    Goto(Pc),
    /// Continue execution at a specialized pc chosen by the frame's pc. `arms` maps original pcs
    /// to specialized pcs. If `fallthrough` is `Some((orig, spec))`, any pc not matched by `arms`
    /// is asserted to be `orig` and continues at `spec`; otherwise an unmatched pc is an error.
    Redispatch {
        arms: Vec<(Pc, Pc)>,
        fallthrough: Option<(Pc, Pc)>,
    },
    Return,
    AssertUnreachable,
}

/// Write `stmts` at indentation level `depth`.
pub(crate) fn fmt_block(f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
    for s in stmts {
        fmt_stmt(f, s, depth)?;
    }
    Ok(())
}

fn fmt_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    let ind = "    ".repeat(depth);
    match stmt {
        Stmt::Comment(s) => writeln!(f, "{ind}# {s}"),
        Stmt::Assign(l, e) => writeln!(f, "{ind}{l} = {e}"),
        Stmt::SetReg(r, e) => writeln!(f, "{ind}{} = {e}", Expr::Reg(*r)),
        Stmt::SetFramePc(pc) => writeln!(f, "{ind}frame.pc = {pc}"),
        Stmt::Eval(e) => writeln!(f, "{ind}{e}"),
        Stmt::If { cond, then, else_ } => {
            writeln!(f, "{ind}if {cond}:")?;
            fmt_block(f, then, depth + 1)?;
            fmt_else(f, else_, depth)
        }
        Stmt::SyncRegs(_, regs) => {
            let args = regs
                .iter()
                .map(|r| Local::Unboxed(*r).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "{ind}{}({args})", syncer_name(regs))
        }
        Stmt::Goto(pc) => {
            writeln!(f, "{ind}pc = {pc}")?;
            writeln!(f, "{ind}continue")
        }
        Stmt::Redispatch { arms, fallthrough } => {
            writeln!(f, "{ind}pc = frame.pc")?;
            for (i, (orig, spec)) in arms.iter().enumerate() {
                let kw = if i == 0 { "if" } else { "elif" };
                writeln!(f, "{ind}{kw} pc == {orig}:")?;
                fmt_stmt(f, &Stmt::Goto(*spec), depth + 1)?;
            }
            writeln!(f, "{ind}else:")?;
            match fallthrough {
                Some((orig, spec)) => {
                    writeln!(f, "{ind}    assert pc == {orig}")?;
                    fmt_stmt(f, &Stmt::Goto(*spec), depth + 1)
                }
                None => writeln!(f, "{ind}    assert 0"),
            }
        }
        Stmt::Return => writeln!(f, "{ind}return"),
        Stmt::AssertUnreachable => writeln!(f, "{ind}assert 0"),
    }
}

/// Write the else arm of an `if`, collapsing a lone nested `if` into `elif`.
fn fmt_else(f: &mut fmt::Formatter<'_>, else_: &[Stmt], depth: usize) -> fmt::Result {
    let ind = "    ".repeat(depth);
    match else_ {
        [] => Ok(()),
        [Stmt::If { cond, then, else_ }] => {
            writeln!(f, "{ind}elif {cond}:")?;
            fmt_block(f, then, depth + 1)?;
            fmt_else(f, else_, depth)
        }
        _ => {
            writeln!(f, "{ind}else:")?;
            fmt_block(f, else_, depth + 1)
        }
    }
}

/// A displayable wrapper around a block of statements.
pub struct Block<'a>(pub &'a [Stmt]);

impl fmt::Display for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_block(f, self.0, 0)
    }
}
