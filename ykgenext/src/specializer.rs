//! Specializers: code emission for one instruction under one set of constant registers.
//!
//! A [Specializer] stands for "the instruction at `orig_pc`, executed when the registers in
//! `consts` are known to hold constants". If every argument of the instruction is static the
//! instruction is *specialized*: it is computed directly on unboxed values and its result, if
//! any, becomes a further constant. Otherwise it is *unspecialized*: generated code first checks
//! whether the non-static arguments happen to be constant boxes at run-time (and if so promotes
//! them, jumping to a more specialized version of the same instruction), and only if they are not
//! does it synchronize the constant registers back into the register file and call the generic
//! implementation of the opcode.

use crate::{
    consts::ConstRegs,
    insn::{Descr, DescrRef, FieldDescr, FieldTy, Insn, Opcode, Operand, Pc, Register, SwitchDescr},
    ir::{BinOp, Expr, Hook, Local, Stmt},
    worklist::{SpecIdx, WorkList},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecializeError {
    /// The specializer has no way of emitting code for this instruction with this constant set.
    /// Callers are expected to fall back to generic code.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub struct Specializer<'a> {
    insn: &'a Insn,
    consts: ConstRegs,
    orig_pc: Pc,
    spec_pc: Pc,
    code: Option<Vec<Stmt>>,
}

impl<'a> Specializer<'a> {
    pub(crate) fn new(insn: &'a Insn, consts: ConstRegs, orig_pc: Pc, spec_pc: Pc) -> Self {
        Self {
            insn,
            consts,
            orig_pc,
            spec_pc,
            code: None,
        }
    }

    pub fn insn(&self) -> &'a Insn {
        self.insn
    }

    pub fn constant_registers(&self) -> &ConstRegs {
        &self.consts
    }

    pub fn orig_pc(&self) -> Pc {
        self.orig_pc
    }

    /// The pc at which this specializer's code lives. This is the original pc iff the constant
    /// set is empty.
    pub fn get_pc(&self) -> Pc {
        self.spec_pc
    }

    /// The generated code, if [WorkList::make_code] has successfully been called on this
    /// specializer.
    pub fn code(&self) -> Option<&[Stmt]> {
        self.code.as_deref()
    }

    pub(crate) fn set_code(&mut self, code: Vec<Stmt>) {
        self.code = Some(code);
    }

    /// Are all of this instruction's arguments known at compile-time?
    pub fn all_args_static(&self) -> bool {
        self.insn.args().iter().all(|x| self.consts.is_static(x))
    }

    /// The constant registers after this instruction has executed: if the instruction has a
    /// result, it becomes constant when the instruction is specialized and stops being constant
    /// otherwise.
    pub fn get_next_constant_registers(&self) -> ConstRegs {
        match self.insn.result() {
            None => self.consts.clone(),
            Some(r) if self.all_args_static() => self.consts.with(r),
            Some(r) => self.consts.without(r),
        }
    }
}

/// The test performed by a conditional branch.
enum BranchTest {
    /// A test on a single operand.
    Unary(fn(Expr) -> Expr),
    /// A comparison, and the opcode that performs it generically.
    Binary(BinOp, Opcode),
}

fn branch_test(op: &Opcode) -> Option<BranchTest> {
    let t = match op {
        Opcode::GotoIfNot | Opcode::GotoIfNotIntIsTrue => {
            BranchTest::Unary(|x| Expr::binop(BinOp::Ne, x, Expr::int(0)))
        }
        Opcode::GotoIfNotIntIsZero => BranchTest::Unary(|x| Expr::binop(BinOp::Eq, x, Expr::int(0))),
        Opcode::GotoIfNotPtrNonzero => BranchTest::Unary(|x| Expr::NonNull(Box::new(x))),
        Opcode::GotoIfNotPtrZero => {
            BranchTest::Unary(|x| Expr::Not(Box::new(Expr::NonNull(Box::new(x)))))
        }
        Opcode::GotoIfNotIntLt => BranchTest::Binary(BinOp::Lt, Opcode::IntLt),
        Opcode::GotoIfNotIntLe => BranchTest::Binary(BinOp::Le, Opcode::IntLe),
        Opcode::GotoIfNotIntGt => BranchTest::Binary(BinOp::Gt, Opcode::IntGt),
        Opcode::GotoIfNotIntGe => BranchTest::Binary(BinOp::Ge, Opcode::IntGe),
        Opcode::GotoIfNotIntEq => BranchTest::Binary(BinOp::Eq, Opcode::IntEq),
        Opcode::GotoIfNotIntNe => BranchTest::Binary(BinOp::Ne, Opcode::IntNe),
        _ => return None,
    };
    Some(t)
}

/// The operator computing a binary integer opcode, if `op` is one.
fn int_binop(op: &Opcode) -> Option<BinOp> {
    let b = match op {
        Opcode::IntAdd => BinOp::Add,
        Opcode::IntSub => BinOp::Sub,
        Opcode::IntMul => BinOp::Mul,
        Opcode::IntOr => BinOp::Or,
        Opcode::IntAnd => BinOp::And,
        Opcode::IntXor => BinOp::Xor,
        Opcode::IntLshift => BinOp::Lshift,
        Opcode::IntRshift => BinOp::Rshift,
        Opcode::IntLt => BinOp::Lt,
        Opcode::IntLe => BinOp::Le,
        Opcode::IntGt => BinOp::Gt,
        Opcode::IntGe => BinOp::Ge,
        Opcode::IntEq => BinOp::Eq,
        Opcode::IntNe => BinOp::Ne,
        _ => return None,
    };
    Some(b)
}

/// Emits the code for a single specializer. Emission may request further specializers from the
/// work list.
pub(crate) struct Emitter<'w, 'a> {
    wl: &'w mut WorkList<'a>,
    insn: &'a Insn,
    consts: ConstRegs,
    next_consts: ConstRegs,
    orig_pc: Pc,
    /// How many temporaries have been allocated so far?
    tmps: u32,
}

impl<'w, 'a> Emitter<'w, 'a> {
    pub(crate) fn new(wl: &'w mut WorkList<'a>, idx: SpecIdx) -> Self {
        let spec = wl.spec(idx);
        let insn = spec.insn();
        let consts = spec.constant_registers().clone();
        let next_consts = spec.get_next_constant_registers();
        let orig_pc = spec.orig_pc();
        Self {
            wl,
            insn,
            consts,
            next_consts,
            orig_pc,
            tmps: 0,
        }
    }

    pub(crate) fn make_code(mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let opcode = self.insn.opcode();
        let specialized = self.insn.args().iter().all(|x| self.consts.is_static(x));
        if let Some(op) = int_binop(opcode) {
            return if specialized {
                self.specialized_binop(op)
            } else {
                self.unspecialized_call()
            };
        }
        if let Some(t) = branch_test(opcode) {
            return if specialized {
                self.specialized_branch(t)
            } else {
                self.unspecialized_branch(t)
            };
        }
        match (opcode, specialized) {
            (Opcode::Strgetitem, true) => {
                let s = self.unboxed(self.arg(0))?;
                let i = self.unboxed(self.arg(1))?;
                let mut stmts = vec![Stmt::Assign(
                    Local::Unboxed(self.result()),
                    Expr::StrGetItem(Box::new(s), Box::new(i)),
                )];
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::IntBetween, true) => self.specialized_int_between(),
            (Opcode::InstancePtrEq, true) => self.specialized_binop(BinOp::PtrEq),
            (Opcode::Strgetitem | Opcode::IntBetween | Opcode::InstancePtrEq, false) => {
                self.unspecialized_call()
            }
            (Opcode::IntGuardValue | Opcode::RefGuardValue, true) => {
                let mut stmts = vec![Stmt::Comment(
                    "guard_value, argument is already constant".to_owned(),
                )];
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::IntGuardValue | Opcode::RefGuardValue, false) => {
                self.unspecialized_guard_value()
            }
            (Opcode::GuardClass, true) => {
                let obj = self.unboxed(self.arg(0))?;
                let mut stmts = vec![
                    Stmt::Comment("guard_class, argument is already constant".to_owned()),
                    Stmt::Assign(
                        Local::Unboxed(self.result()),
                        Expr::ClassOf(Box::new(obj)),
                    ),
                ];
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::GuardClass, false) => self.unspecialized_guard_class(),
            (Opcode::GetfieldRawI | Opcode::GetfieldGcIPure | Opcode::GetfieldGcRPure, true) => {
                self.specialized_getfield()
            }
            (Opcode::GetfieldRawI | Opcode::GetfieldGcIPure | Opcode::GetfieldGcRPure, false) => {
                self.unspecialized_getfield()
            }
            (Opcode::IntCopy | Opcode::RefCopy, true) => {
                let x = self.unboxed(self.arg(0))?;
                let mut stmts = vec![Stmt::Assign(Local::Unboxed(self.result()), x)];
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::IntCopy | Opcode::RefCopy, false) => {
                let src = self.reg_arg(0);
                let mut stmts = vec![
                    Stmt::Assign(Local::Boxed(src), Expr::Reg(src)),
                    Stmt::SetReg(self.result(), Expr::Local(Local::Boxed(src))),
                ];
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::Goto, _) => {
                let mut stmts = Vec::new();
                let target = self.label_pc();
                self.emit_jump_to(&mut stmts, target, self.consts.clone());
                Ok(stmts)
            }
            (Opcode::Switch, true) => self.specialized_switch(),
            (Opcode::Switch, false) => self.unspecialized_switch(),
            (Opcode::Live, _) => {
                let mut stmts = Vec::new();
                self.emit_jump(&mut stmts);
                Ok(stmts)
            }
            (Opcode::Unreachable, _) => Ok(vec![Stmt::AssertUnreachable]),
            (op, _) if op.is_return() => Ok(self.emit_return()),
            (_, true) => Err(self.unsupported("specialized")),
            (_, false) => Err(self.unsupported("unspecialized")),
        }
    }

    fn unsupported(&self, kind: &str) -> SpecializeError {
        SpecializeError::Unsupported(format!(
            "no {kind} code for '{}' at pc {} with constants {}",
            self.insn, self.orig_pc, self.consts
        ))
    }

    fn arg(&self, i: usize) -> &'a Operand {
        match self.insn.args().get(i) {
            Some(x) => x,
            None => panic!("'{}' has no argument {i}", self.insn),
        }
    }

    /// Return the `i`th argument, which must be a register.
    fn reg_arg(&self, i: usize) -> Register {
        match self.arg(i) {
            Operand::Reg(r) => *r,
            x => panic!("Argument {i} of '{}' is {x}, not a register", self.insn),
        }
    }

    fn result(&self) -> Register {
        match self.insn.result() {
            Some(r) => r,
            None => panic!("'{}' has no result register", self.insn),
        }
    }

    fn label_pc(&self) -> Pc {
        match self.insn.label() {
            Some(l) => self.wl.stream().label_pc(l),
            None => panic!("'{}' has no label", self.insn),
        }
    }

    fn next_pc(&self) -> Pc {
        self.wl.stream().next_pc(self.orig_pc)
    }

    fn new_temp(&mut self) -> Local {
        let l = Local::Temp(self.tmps);
        self.tmps += 1;
        l
    }

    /// Return an expression for the unboxed value of a static operand.
    fn unboxed(&self, op: &Operand) -> Result<Expr, SpecializeError> {
        match op {
            Operand::Reg(r) => Ok(Expr::Local(Local::Unboxed(*r))),
            Operand::Const(c) => Ok(Expr::Lit(*c)),
            x => Err(SpecializeError::Unsupported(format!(
                "cannot unbox {x} in '{}' at pc {}",
                self.insn, self.orig_pc
            ))),
        }
    }

    /// Return an expression for a register or constant operand as a box. Constant registers are
    /// wrapped in fresh constant boxes; other registers must already have been read into their
    /// boxed local.
    fn boxed(&self, op: &Operand) -> Expr {
        match op {
            Operand::Reg(r) if self.consts.contains(r) => {
                Expr::MakeConst(r.kind(), Box::new(Expr::Local(Local::Unboxed(*r))))
            }
            Operand::Reg(r) => Expr::Local(Local::Boxed(*r)),
            Operand::Const(c) => Expr::MakeConst(c.kind(), Box::new(Expr::Lit(*c))),
            x => panic!("Cannot box {x} in '{}'", self.insn),
        }
    }

    /// For each operand in `ops` that is not static, read it from the register file and test
    /// whether it is a constant box. If all such operands are, they are unboxed and control
    /// transfers to the version of this instruction where they are also constant.
    fn emit_promote_if(&mut self, ops: &[&'a Operand], stmts: &mut Vec<Stmt>) {
        let mut cond = None;
        let mut then = Vec::new();
        for op in ops {
            if let Operand::Reg(r) = op {
                if !self.consts.contains(r) {
                    stmts.push(Stmt::Assign(Local::Boxed(*r), Expr::Reg(*r)));
                    let check = Expr::IsConst(Box::new(Expr::Local(Local::Boxed(*r))));
                    cond = Some(match cond {
                        None => check,
                        Some(c) => Expr::binop(BinOp::LogicalAnd, c, check),
                    });
                    then.push(Stmt::Assign(
                        Local::Unboxed(*r),
                        Expr::Unbox(Box::new(Expr::Local(Local::Boxed(*r)))),
                    ));
                }
            }
        }
        let cond = match cond {
            Some(c) => c,
            None => panic!("'{}' has no non-constant register operands", self.insn),
        };
        let consts = self.consts.with_operands(ops.iter().copied());
        let idx = self.wl.specialize_insn(self.insn, consts, self.orig_pc);
        then.push(Stmt::Goto(self.wl.spec(idx).get_pc()));
        stmts.push(Stmt::If {
            cond,
            then,
            else_: Vec::new(),
        });
    }

    /// Write the constant registers back to the register file, if there are any.
    fn emit_sync(&mut self, stmts: &mut Vec<Stmt>) {
        if self.consts.is_empty() {
            return;
        }
        let idx = self.wl.syncer(&self.consts);
        stmts.push(Stmt::SyncRegs(idx, self.consts.iter().copied().collect()));
    }

    /// Transfer control to the next instruction with the default next constant set.
    fn emit_jump(&mut self, stmts: &mut Vec<Stmt>) {
        let next = self.next_pc();
        self.emit_jump_to(stmts, next, self.next_consts.clone());
    }

    fn emit_jump_to(&mut self, stmts: &mut Vec<Stmt>, pc: Pc, consts: ConstRegs) {
        stmts.push(Stmt::Goto(self.wl.jump_target(consts, pc)));
    }

    fn specialized_binop(&mut self, op: BinOp) -> Result<Vec<Stmt>, SpecializeError> {
        let lhs = self.unboxed(self.arg(0))?;
        let rhs = self.unboxed(self.arg(1))?;
        let mut stmts = vec![Stmt::Assign(
            Local::Unboxed(self.result()),
            Expr::binop(op, lhs, rhs),
        )];
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    /// Emit a call to the generic implementation of an opcode whose arguments are all registers
    /// or constants and which produces a result.
    fn unspecialized_call(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let ops = self.insn.args().iter().collect::<Vec<_>>();
        let mut stmts = Vec::new();
        self.emit_promote_if(&ops, &mut stmts);
        let args = ops.iter().map(|x| self.boxed(x)).collect::<Vec<_>>();
        stmts.push(Stmt::SetReg(
            self.result(),
            Expr::Call(Hook::Op(self.insn.opcode().clone()), args),
        ));
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    fn specialized_int_between(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let lo = self.unboxed(self.arg(0))?;
        let x = self.unboxed(self.arg(1))?;
        let hi = self.unboxed(self.arg(2))?;
        let res = Local::Unboxed(self.result());
        let width = self.new_temp();
        let mut stmts = vec![
            Stmt::Assign(width, Expr::binop(BinOp::Sub, hi.clone(), lo.clone())),
            Stmt::If {
                cond: Expr::binop(BinOp::Eq, Expr::Local(width), Expr::int(1)),
                then: vec![Stmt::Assign(
                    res,
                    Expr::binop(BinOp::Eq, lo.clone(), x.clone()),
                )],
                else_: vec![Stmt::Assign(
                    res,
                    Expr::binop(
                        BinOp::LogicalAnd,
                        Expr::binop(BinOp::Le, lo, x.clone()),
                        Expr::binop(BinOp::Lt, x, hi),
                    ),
                )],
            },
        ];
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    fn unspecialized_guard_value(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let op = self.arg(0);
        let r = self.reg_arg(0);
        let mut stmts = Vec::new();
        self.emit_promote_if(&[op], &mut stmts);
        self.emit_sync(&mut stmts);
        stmts.push(Stmt::Eval(Expr::Call(
            Hook::Op(self.insn.opcode().clone()),
            vec![self.boxed(op), Expr::pc(self.orig_pc)],
        )));
        // The guard has made the register's box constant.
        stmts.push(Stmt::Assign(Local::Boxed(r), Expr::Reg(r)));
        stmts.push(Stmt::Assign(
            Local::Unboxed(r),
            Expr::Unbox(Box::new(Expr::Local(Local::Boxed(r)))),
        ));
        let next = self.next_pc();
        self.emit_jump_to(&mut stmts, next, self.consts.with(r));
        Ok(stmts)
    }

    fn unspecialized_guard_class(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let obj = self.reg_arg(0);
        let res = self.result();
        let boxed = Expr::Local(Local::Boxed(obj));
        let mut stmts = vec![Stmt::Assign(Local::Boxed(obj), Expr::Reg(obj))];
        let next = self.next_pc();
        let target = self.wl.jump_target(self.consts.with(res), next);
        stmts.push(Stmt::If {
            cond: Expr::Call(Hook::ClassKnown, vec![boxed.clone()]),
            then: vec![
                Stmt::Assign(
                    Local::Unboxed(res),
                    Expr::Unbox(Box::new(Expr::Call(Hook::ClsOfBox, vec![boxed.clone()]))),
                ),
                Stmt::Goto(target),
            ],
            else_: Vec::new(),
        });
        self.emit_sync(&mut stmts);
        stmts.push(Stmt::Assign(
            Local::Unboxed(res),
            Expr::Unbox(Box::new(Expr::Call(
                Hook::Op(Opcode::GuardClass),
                vec![boxed, Expr::pc(self.orig_pc)],
            ))),
        ));
        stmts.push(Stmt::Goto(target));
        Ok(stmts)
    }

    fn field_descr(&self) -> (&'a DescrRef, &'a FieldDescr) {
        if let Some(d) = self.insn.descr() {
            if let Descr::Field(fd) = d.descr() {
                return (d, fd);
            }
        }
        panic!("'{}' has no field descriptor", self.insn)
    }

    /// A pure field of a constant object is read directly, unless it holds a GC reference.
    fn specialized_getfield(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let (d, fd) = self.field_descr();
        if !fd.always_pure || fd.ty == FieldTy::Gc {
            return Err(self.unsupported("specialized"));
        }
        let base = self.unboxed(self.arg(0))?;
        let field = self.wl.global(d);
        let mut stmts = vec![Stmt::Assign(
            Local::Unboxed(self.result()),
            Expr::GetField {
                raw: self.insn.opcode() == &Opcode::GetfieldRawI,
                base: Box::new(base),
                field,
            },
        )];
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    /// Only a pure field is worth promoting the object for.
    fn unspecialized_getfield(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let (d, fd) = self.field_descr();
        if !fd.always_pure {
            return Err(self.unsupported("unspecialized"));
        }
        let base = self.arg(0);
        let field = self.wl.global(d);
        let mut stmts = Vec::new();
        self.emit_promote_if(&[base], &mut stmts);
        stmts.push(Stmt::SetReg(
            self.result(),
            Expr::Call(
                Hook::Op(self.insn.opcode().clone()),
                vec![self.boxed(base), Expr::Global(field)],
            ),
        ));
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    fn specialized_branch(&mut self, t: BranchTest) -> Result<Vec<Stmt>, SpecializeError> {
        let cond = match t {
            BranchTest::Unary(f) => f(self.unboxed(self.arg(0))?),
            BranchTest::Binary(op, _) => {
                let lhs = self.unboxed(self.arg(0))?;
                let rhs = self.unboxed(self.arg(1))?;
                Expr::binop(op, lhs, rhs)
            }
        };
        let mut stmts = vec![Stmt::Assign(Local::Cond, cond)];
        let mut then = Vec::new();
        let target = self.label_pc();
        self.emit_jump_to(&mut then, target, self.consts.clone());
        stmts.push(Stmt::If {
            cond: Expr::Not(Box::new(Expr::Local(Local::Cond))),
            then,
            else_: Vec::new(),
        });
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    fn unspecialized_branch(&mut self, t: BranchTest) -> Result<Vec<Stmt>, SpecializeError> {
        let target = self.label_pc();
        let next = self.next_pc();
        let mut stmts = Vec::new();
        let condbox = match &t {
            BranchTest::Unary(_) => {
                let op = self.arg(0);
                self.emit_promote_if(&[op], &mut stmts);
                self.boxed(op)
            }
            BranchTest::Binary(_, cmp) => {
                let (lhs, rhs) = (self.arg(0), self.arg(1));
                self.emit_promote_if(&[lhs, rhs], &mut stmts);
                stmts.push(Stmt::Assign(
                    Local::CondBox,
                    Expr::Call(
                        Hook::Op(cmp.clone()),
                        vec![self.boxed(lhs), self.boxed(rhs)],
                    ),
                ));
                Expr::Local(Local::CondBox)
            }
        };
        self.emit_sync(&mut stmts);
        let hook = match &t {
            BranchTest::Unary(_) => Hook::Op(self.insn.opcode().clone()),
            BranchTest::Binary(..) => Hook::Op(Opcode::GotoIfNot),
        };
        stmts.push(Stmt::Eval(Expr::Call(
            hook,
            vec![condbox, Expr::pc(target), Expr::pc(self.orig_pc)],
        )));
        let target_spec = self.wl.jump_target(self.consts.clone(), target);
        let next_spec = self.wl.jump_target(self.consts.clone(), next);
        stmts.push(Stmt::Redispatch {
            arms: vec![(target, target_spec)],
            fallthrough: Some((next, next_spec)),
        });
        Ok(stmts)
    }

    fn switch_descr(&self) -> (&'a DescrRef, &'a SwitchDescr) {
        if let Some(d) = self.insn.descr() {
            if let Descr::Switch(sd) = d.descr() {
                return (d, sd);
            }
        }
        panic!("'{}' has no switch descriptor", self.insn)
    }

    fn specialized_switch(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let (_, sd) = self.switch_descr();
        let x = self.unboxed(self.arg(0))?;
        let mut arms = Vec::with_capacity(sd.cases.len());
        for (val, target) in &sd.cases {
            let mut then = Vec::new();
            self.emit_jump_to(&mut then, *target, self.consts.clone());
            arms.push((Expr::binop(BinOp::Eq, x.clone(), Expr::int(*val)), then));
        }
        let mut stmts = arms
            .into_iter()
            .rev()
            .fold(Vec::new(), |else_, (cond, then)| {
                vec![Stmt::If { cond, then, else_ }]
            });
        self.emit_jump(&mut stmts);
        Ok(stmts)
    }

    fn unspecialized_switch(&mut self) -> Result<Vec<Stmt>, SpecializeError> {
        let (d, sd) = self.switch_descr();
        let glob = self.wl.global(d);
        let op = self.arg(0);
        let mut stmts = Vec::new();
        self.emit_promote_if(&[op], &mut stmts);
        self.emit_sync(&mut stmts);
        stmts.push(Stmt::Eval(Expr::Call(
            Hook::Op(Opcode::Switch),
            vec![self.boxed(op), Expr::Global(glob), Expr::pc(self.orig_pc)],
        )));
        let mut targets = sd.cases.iter().map(|(_, pc)| *pc).collect::<Vec<_>>();
        targets.sort();
        targets.dedup();
        let next = self.next_pc();
        if !targets.contains(&next) {
            targets.push(next);
        }
        let arms = targets
            .into_iter()
            .map(|pc| (pc, self.wl.jump_target(self.consts.clone(), pc)))
            .collect::<Vec<_>>();
        stmts.push(Stmt::Redispatch {
            arms,
            fallthrough: None,
        });
        Ok(stmts)
    }

    fn emit_return(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        let args = match self.insn.args().first() {
            Some(Operand::Reg(r)) if !self.consts.contains(r) => {
                stmts.push(Stmt::Assign(Local::Boxed(*r), Expr::Reg(*r)));
                vec![Expr::Local(Local::Boxed(*r))]
            }
            Some(op) => vec![self.boxed(op)],
            None => Vec::new(),
        };
        stmts.push(Stmt::Eval(Expr::Call(
            Hook::Op(self.insn.opcode().clone()),
            args,
        )));
        stmts.push(Stmt::Return);
        stmts
    }
}
