//! A reference executor for generated code.
//!
//! [GenExtCode::run] interprets a generating extension's bodies against a [Frame], which supplies
//! the interpreter state the generated code manipulates: the register file (of boxes), the frame's
//! pc, the generic implementation of each opcode, and the few heap accessors that specialized code
//! calls directly. It exists so that specialized code can be checked against generic code: running
//! both against equivalent frames must leave the frames in equivalent states.

use crate::{
    genext::GenExtCode,
    insn::{Const, Descr, FieldDescr, Pc, RegKind, Register},
    ir::{BinOp, Expr, Hook, Local, Stmt},
};
use std::collections::HashMap;
use thiserror::Error;

/// An unboxed value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Prim {
    Int(i64),
    Ref(usize),
    Float(f64),
}

impl Prim {
    pub fn kind(&self) -> RegKind {
        match self {
            Prim::Int(_) => RegKind::Int,
            Prim::Ref(_) => RegKind::Ref,
            Prim::Float(_) => RegKind::Float,
        }
    }
}

impl From<Const> for Prim {
    fn from(c: Const) -> Self {
        match c {
            Const::Int(x) => Prim::Int(x),
            Const::Ref(x) => Prim::Ref(x),
            Const::Float(x) => Prim::Float(f64::from_bits(x)),
        }
    }
}

/// A box in the register file: either a constant box, whose value the tracer knows, or a variable
/// one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoxVal {
    Const(Prim),
    Var(Prim),
}

impl BoxVal {
    pub fn prim(&self) -> Prim {
        match self {
            BoxVal::Const(p) | BoxVal::Var(p) => *p,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, BoxVal::Const(_))
    }
}

/// The value of an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Prim(Prim),
    Box(BoxVal),
    Descr(crate::insn::DescrRef),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Assertion failed at pc {0}")]
    AssertionFailed(Pc),
    #[error("Reached unreachable code at pc {0}")]
    Unreachable(Pc),
    #[error("No code for pc {0}")]
    UnknownPc(Pc),
    #[error("Control fell off the end of the body at pc {0}")]
    FellThrough(Pc),
    #[error("Type error at pc {pc}: {msg}")]
    TypeError { pc: Pc, msg: String },
    #[error("Executed more than {0} bodies without returning")]
    StepLimit(usize),
    /// An error raised by a [Frame] (e.g. an exception thrown by a generic opcode).
    #[error("{0}")]
    Hook(String),
}

/// The interpreter state generated code runs against.
pub trait Frame {
    fn pc(&self) -> Pc;
    fn set_pc(&mut self, pc: Pc);
    fn reg(&self, r: Register) -> BoxVal;
    fn set_reg(&mut self, r: Register, v: BoxVal);
    /// Call `hook` with `args`. Generic opcode implementations take and return boxes: a
    /// conditional branch or switch communicates its decision by setting the frame's pc.
    fn call(&mut self, hook: &Hook, args: &[Value]) -> Result<Value, EvalError>;
    /// Return the character at index `i` of the string `s`.
    fn strgetitem(&self, s: usize, i: i64) -> Result<i64, EvalError>;
    /// Return the class of the object `obj`.
    fn classof(&self, obj: usize) -> Result<i64, EvalError>;
    /// Read the pure field `field` of the object at `base`.
    fn getfield(&self, base: Prim, field: &FieldDescr) -> Result<Prim, EvalError>;
}

impl BinOp {
    /// Apply this operator to two integers. Arithmetic wraps; comparisons produce `0` or `1`.
    pub fn apply_int(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::Or => lhs | rhs,
            BinOp::And => lhs & rhs,
            BinOp::Xor => lhs ^ rhs,
            // Shift amounts are taken modulo 64.
            BinOp::Lshift => lhs.wrapping_shl(rhs as u32),
            BinOp::Rshift => lhs.wrapping_shr(rhs as u32),
            BinOp::Lt => i64::from(lhs < rhs),
            BinOp::Le => i64::from(lhs <= rhs),
            BinOp::Gt => i64::from(lhs > rhs),
            BinOp::Ge => i64::from(lhs >= rhs),
            BinOp::Eq | BinOp::PtrEq => i64::from(lhs == rhs),
            BinOp::Ne => i64::from(lhs != rhs),
            BinOp::LogicalAnd => i64::from(lhs != 0 && rhs != 0),
        }
    }
}

enum Flow {
    Next,
    Goto(Pc),
    Return,
}

struct Exec<'c, 'f, F: Frame> {
    code: &'c GenExtCode,
    frame: &'f mut F,
    /// The locals of the generated function. These live across bodies.
    locals: HashMap<Local, Value>,
    /// The specialized pc of the body being executed.
    cur: Pc,
    /// How many more bodies may be entered. `None` means no limit.
    steps_left: Option<usize>,
}

impl<F: Frame> Exec<'_, '_, F> {
    fn type_error(&self, msg: String) -> EvalError {
        EvalError::TypeError { pc: self.cur, msg }
    }

    fn run(&mut self, entry: Pc) -> Result<(), EvalError> {
        if !self.code.entries().contains(&entry) {
            return Err(EvalError::UnknownPc(entry));
        }
        self.cur = entry;
        let max_steps = self.steps_left;
        loop {
            if let Some(n) = self.steps_left.as_mut() {
                match n.checked_sub(1) {
                    Some(x) => *n = x,
                    None => return Err(EvalError::StepLimit(max_steps.unwrap_or(0))),
                }
            }
            let code = self.code;
            let body = code
                .body(self.cur)
                .ok_or(EvalError::UnknownPc(self.cur))?;
            match self.exec_block(&body.stmts)? {
                Flow::Next => return Err(EvalError::FellThrough(self.cur)),
                Flow::Goto(pc) => self.cur = pc,
                Flow::Return => return Ok(()),
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, EvalError> {
        for s in stmts {
            match s {
                Stmt::Comment(_) => (),
                Stmt::Assign(l, e) => {
                    let v = self.eval(e)?;
                    self.locals.insert(*l, v);
                }
                Stmt::SetReg(r, e) => match self.eval(e)? {
                    Value::Box(b) => self.frame.set_reg(*r, b),
                    v => return Err(self.type_error(format!("cannot store {v:?} in {r}"))),
                },
                Stmt::SetFramePc(pc) => self.frame.set_pc(*pc),
                Stmt::Eval(e) => {
                    self.eval(e)?;
                }
                Stmt::If { cond, then, else_ } => {
                    let c = self.eval_int(cond)?;
                    let f = if c != 0 {
                        self.exec_block(then)?
                    } else {
                        self.exec_block(else_)?
                    };
                    if !matches!(f, Flow::Next) {
                        return Ok(f);
                    }
                }
                Stmt::SyncRegs(idx, regs) => {
                    let code = self.code;
                    let syncer = &code.syncers()[*idx];
                    if syncer.regs() != regs.as_slice() {
                        return Err(self.type_error(format!(
                            "{} called with the wrong registers",
                            syncer.name()
                        )));
                    }
                    self.exec_block(&syncer.body())?;
                }
                Stmt::Goto(pc) => return Ok(Flow::Goto(*pc)),
                Stmt::Redispatch { arms, fallthrough } => {
                    let pc = self.frame.pc();
                    if let Some((_, spec)) = arms.iter().find(|(orig, _)| *orig == pc) {
                        return Ok(Flow::Goto(*spec));
                    }
                    return match fallthrough {
                        Some((orig, spec)) if *orig == pc => Ok(Flow::Goto(*spec)),
                        Some(_) => Err(EvalError::AssertionFailed(self.cur)),
                        None => Err(EvalError::Unreachable(self.cur)),
                    };
                }
                Stmt::Return => return Ok(Flow::Return),
                Stmt::AssertUnreachable => return Err(EvalError::Unreachable(self.cur)),
            }
        }
        Ok(Flow::Next)
    }

    fn eval_int(&mut self, e: &Expr) -> Result<i64, EvalError> {
        match self.eval(e)? {
            Value::Prim(Prim::Int(x)) => Ok(x),
            v => Err(self.type_error(format!("expected an integer, got {v:?}"))),
        }
    }

    fn eval_ref(&mut self, e: &Expr) -> Result<usize, EvalError> {
        match self.eval(e)? {
            Value::Prim(Prim::Ref(x)) => Ok(x),
            v => Err(self.type_error(format!("expected a reference, got {v:?}"))),
        }
    }

    fn eval_prim(&mut self, e: &Expr) -> Result<Prim, EvalError> {
        match self.eval(e)? {
            Value::Prim(p) => Ok(p),
            v => Err(self.type_error(format!("expected an unboxed value, got {v:?}"))),
        }
    }

    fn eval_box(&mut self, e: &Expr) -> Result<BoxVal, EvalError> {
        match self.eval(e)? {
            Value::Box(b) => Ok(b),
            v => Err(self.type_error(format!("expected a box, got {v:?}"))),
        }
    }

    fn eval(&mut self, e: &Expr) -> Result<Value, EvalError> {
        let v = match e {
            Expr::Local(l) => match self.locals.get(l) {
                Some(v) => v.clone(),
                None => return Err(self.type_error(format!("{l} read before being assigned"))),
            },
            Expr::Lit(c) => Value::Prim(Prim::from(*c)),
            Expr::Global(g) => Value::Descr(self.code.globals()[*g].clone()),
            Expr::Reg(r) => Value::Box(self.frame.reg(*r)),
            Expr::BinOp(BinOp::LogicalAnd, lhs, rhs) => {
                let r = self.eval_int(lhs)? != 0 && self.eval_int(rhs)? != 0;
                Value::Prim(Prim::Int(i64::from(r)))
            }
            Expr::BinOp(BinOp::PtrEq, lhs, rhs) => {
                let r = self.eval_ref(lhs)? == self.eval_ref(rhs)?;
                Value::Prim(Prim::Int(i64::from(r)))
            }
            Expr::BinOp(op, lhs, rhs) => {
                let lhs = self.eval_int(lhs)?;
                let rhs = self.eval_int(rhs)?;
                Value::Prim(Prim::Int(op.apply_int(lhs, rhs)))
            }
            Expr::Not(e) => Value::Prim(Prim::Int(i64::from(self.eval_int(e)? == 0))),
            Expr::IsConst(e) => Value::Prim(Prim::Int(i64::from(self.eval_box(e)?.is_const()))),
            Expr::Unbox(e) => Value::Prim(self.eval_box(e)?.prim()),
            Expr::MakeConst(k, e) => {
                let p = self.eval_prim(e)?;
                if p.kind() != *k {
                    return Err(self.type_error(format!("cannot box {p:?} as {k:?}")));
                }
                Value::Box(BoxVal::Const(p))
            }
            Expr::NonNull(e) => Value::Prim(Prim::Int(i64::from(self.eval_ref(e)? != 0))),
            Expr::StrGetItem(s, i) => {
                let s = self.eval_ref(s)?;
                let i = self.eval_int(i)?;
                Value::Prim(Prim::Int(self.frame.strgetitem(s, i)?))
            }
            Expr::ClassOf(e) => {
                let obj = self.eval_ref(e)?;
                Value::Prim(Prim::Int(self.frame.classof(obj)?))
            }
            Expr::GetField { base, field, .. } => {
                let base = self.eval_prim(base)?;
                let code = self.code;
                match code.globals()[*field].descr() {
                    Descr::Field(fd) => Value::Prim(self.frame.getfield(base, fd)?),
                    d => return Err(self.type_error(format!("{d} is not a field descriptor"))),
                }
            }
            Expr::Call(h, args) => {
                let args = args
                    .iter()
                    .map(|x| self.eval(x))
                    .collect::<Result<Vec<_>, _>>()?;
                self.frame.call(h, &args)?
            }
        };
        Ok(v)
    }
}

impl GenExtCode {
    /// Run this generating extension against `frame`, entering at the original pc `entry`, until
    /// a body returns.
    pub fn run<F: Frame>(&self, frame: &mut F, entry: Pc) -> Result<(), EvalError> {
        self.exec(frame, entry, None)
    }

    /// As [Self::run], but fail with [EvalError::StepLimit] once more than `max_steps` bodies
    /// have been entered.
    pub fn run_bounded<F: Frame>(
        &self,
        frame: &mut F,
        entry: Pc,
        max_steps: usize,
    ) -> Result<(), EvalError> {
        self.exec(frame, entry, Some(max_steps))
    }

    fn exec<F: Frame>(
        &self,
        frame: &mut F,
        entry: Pc,
        steps_left: Option<usize>,
    ) -> Result<(), EvalError> {
        Exec {
            code: self,
            frame,
            locals: HashMap::new(),
            cur: entry,
            steps_left,
        }
        .run(entry)
    }
}
