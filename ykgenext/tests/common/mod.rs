//! Shared support for integration tests: a [Frame] whose generic operations behave like a tracer
//! (recording every operation on a non-constant box) and a harness which checks that specialized
//! and generic code behave identically.

#![allow(dead_code)]

use fm::{FMBuilder, FMatcher};
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
};
use ykgenext::{
    eval::{BoxVal, EvalError, Frame, Prim, Value},
    insn::{AsmItem, Descr, FieldDescr, Insn, Label},
    ir::{BinOp, Hook},
    GenExt, GenExtCode, GenExtConfig, InsnStream, Opcode, Pc, Register,
};

lazy_static! {
    /// Use `{{name}}` to match non-literal strings in tests.
    static ref PTN_RE: Regex = {
        Regex::new(r"\{\{.+?\}\}").unwrap()
    };

    static ref PTN_RE_IGNORE: Regex = {
        Regex::new(r"\{\{_}\}").unwrap()
    };

    static ref TEXT_RE: Regex = {
        Regex::new(r"[a-zA-Z0-9\._]+").unwrap()
    };
}

pub fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Parse an assembly listing: one instruction per line, `L:` for a label, and `---` for a
/// barrier.
pub fn asm_items(src: &str) -> Vec<AsmItem> {
    src.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            if l == "---" {
                AsmItem::Barrier
            } else if let Some(name) = l.strip_suffix(':') {
                AsmItem::Label(Label::new(name))
            } else {
                AsmItem::Insn(Insn::from_str(l).unwrap())
            }
        })
        .collect()
}

pub fn asm(name: &str, src: &str) -> InsnStream {
    InsnStream::assemble(name, asm_items(src))
}

/// Return the integer a run returned, and whether it was returned in a constant box.
pub fn ret_int(f: &TestFrame) -> (i64, bool) {
    match &f.ret {
        Some(Value::Box(b)) => match b.prim() {
            Prim::Int(x) => (x, b.is_const()),
            p => panic!("returned {p:?}"),
        },
        x => panic!("returned {x:?}"),
    }
}

/// An integer in a constant box and in a non-constant box.
pub fn int_boxes(x: i64) -> [BoxVal; 2] {
    [BoxVal::Const(Prim::Int(x)), BoxVal::Var(Prim::Int(x))]
}

pub fn ref_boxes(x: usize) -> [BoxVal; 2] {
    [BoxVal::Const(Prim::Ref(x)), BoxVal::Var(Prim::Ref(x))]
}

/// Build the generating extension of `stream` and match its pretty-printed form against `ptn`.
pub fn genext_test(stream: &InsnStream, ptn: &str) -> GenExtCode {
    let code = generate(stream, true);
    if let Err(e) = fmatcher(ptn).matches(&code.to_string()) {
        eprintln!("{e}");
        panic!();
    }
    code
}

pub fn generate(stream: &InsnStream, enabled: bool) -> GenExtCode {
    GenExt::with_config(GenExtConfig::default().enabled(enabled))
        .unwrap()
        .generate(stream)
}

fn hook_err(msg: String) -> EvalError {
    EvalError::Hook(msg)
}

fn mk(p: Prim, is_const: bool) -> Value {
    if is_const {
        Value::Box(BoxVal::Const(p))
    } else {
        Value::Box(BoxVal::Var(p))
    }
}

fn unbox_int(v: &Value) -> Result<(i64, bool), EvalError> {
    match v {
        Value::Box(b) => match b.prim() {
            Prim::Int(x) => Ok((x, b.is_const())),
            p => Err(hook_err(format!("expected an integer box, got {p:?}"))),
        },
        v => Err(hook_err(format!("expected a box, got {v:?}"))),
    }
}

fn unbox_ref(v: &Value) -> Result<(usize, bool), EvalError> {
    match v {
        Value::Box(b) => match b.prim() {
            Prim::Ref(x) => Ok((x, b.is_const())),
            p => Err(hook_err(format!("expected a reference box, got {p:?}"))),
        },
        v => Err(hook_err(format!("expected a box, got {v:?}"))),
    }
}

fn pc_arg(v: &Value) -> Result<Pc, EvalError> {
    match v {
        Value::Prim(Prim::Int(x)) => Ok(Pc::new(*x as usize)),
        v => Err(hook_err(format!("expected a pc, got {v:?}"))),
    }
}

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

/// The comparison performed by a fused compare-and-branch opcode.
fn cmp_branch(op: &Opcode) -> Option<Opcode> {
    let cmp = match op {
        Opcode::GotoIfNotIntLt => Opcode::IntLt,
        Opcode::GotoIfNotIntLe => Opcode::IntLe,
        Opcode::GotoIfNotIntGt => Opcode::IntGt,
        Opcode::GotoIfNotIntGe => Opcode::IntGe,
        Opcode::GotoIfNotIntEq => Opcode::IntEq,
        Opcode::GotoIfNotIntNe => Opcode::IntNe,
        _ => return None,
    };
    Some(cmp)
}

/// An interpreter frame plus a tiny heap. Generic operations constant-fold when all their inputs
/// are constant boxes and otherwise append the name of the operation to `trace`, standing in for
/// the trace a tracer would record.
pub struct TestFrame<'a> {
    stream: &'a InsnStream,
    pc: Pc,
    pub regs: HashMap<Register, BoxVal>,
    pub strs: HashMap<usize, Vec<i64>>,
    pub classes: HashMap<usize, i64>,
    pub fields: HashMap<(usize, String), Prim>,
    pub known_classes: HashSet<usize>,
    pub ret: Option<Value>,
    pub trace: Vec<String>,
}

impl<'a> TestFrame<'a> {
    pub fn new(stream: &'a InsnStream, regs: &[(Register, BoxVal)]) -> Self {
        Self {
            stream,
            pc: Pc::new(0),
            regs: regs.iter().copied().collect(),
            strs: HashMap::new(),
            classes: HashMap::new(),
            fields: HashMap::new(),
            known_classes: HashSet::new(),
            ret: None,
            trace: Vec::new(),
        }
    }

    fn record(&mut self, name: &str, is_const: bool) {
        if !is_const {
            self.trace.push(name.to_owned());
        }
    }

    fn branch(&mut self, cond: bool, target: &Value) -> Result<Value, EvalError> {
        if !cond {
            self.pc = pc_arg(target)?;
        }
        Ok(Value::Void)
    }
}

impl Frame for TestFrame<'_> {
    fn pc(&self) -> Pc {
        self.pc
    }

    fn set_pc(&mut self, pc: Pc) {
        self.pc = pc;
    }

    fn reg(&self, r: Register) -> BoxVal {
        match self.regs.get(&r) {
            Some(x) => *x,
            None => panic!("{r} read before being written"),
        }
    }

    fn set_reg(&mut self, r: Register, v: BoxVal) {
        self.regs.insert(r, v);
    }

    fn call(&mut self, hook: &Hook, args: &[Value]) -> Result<Value, EvalError> {
        let op = match hook {
            Hook::ClassKnown => {
                let (a, c) = unbox_ref(&args[0])?;
                let known = c || self.known_classes.contains(&a);
                return Ok(Value::Prim(Prim::Int(i64::from(known))));
            }
            Hook::ClsOfBox => {
                let (a, _) = unbox_ref(&args[0])?;
                return Ok(mk(Prim::Int(self.classof(a)?), true));
            }
            Hook::Op(op) => op,
        };
        if let Some(b) = int_binop(op) {
            let (x, cx) = unbox_int(&args[0])?;
            let (y, cy) = unbox_int(&args[1])?;
            self.record(op.name(), cx && cy);
            return Ok(mk(Prim::Int(b.apply_int(x, y)), cx && cy));
        }
        if let Some(cmp) = cmp_branch(op) {
            let (x, cx) = unbox_int(&args[0])?;
            let (y, cy) = unbox_int(&args[1])?;
            // A fused branch is traced as the comparison followed by a guard.
            self.record(cmp.name(), cx && cy);
            self.record("guard", cx && cy);
            let b = int_binop(&cmp).ok_or_else(|| hook_err(format!("{cmp} is not a comparison")))?;
            return self.branch(b.apply_int(x, y) != 0, &args[2]);
        }
        match op {
            Opcode::GotoIfNot | Opcode::GotoIfNotIntIsTrue | Opcode::GotoIfNotIntIsZero => {
                let (x, c) = unbox_int(&args[0])?;
                self.record("guard", c);
                let cond = if op == &Opcode::GotoIfNotIntIsZero {
                    x == 0
                } else {
                    x != 0
                };
                self.branch(cond, &args[1])
            }
            Opcode::GotoIfNotPtrNonzero | Opcode::GotoIfNotPtrZero => {
                let (x, c) = unbox_ref(&args[0])?;
                self.record("guard", c);
                let cond = if op == &Opcode::GotoIfNotPtrNonzero {
                    x != 0
                } else {
                    x == 0
                };
                self.branch(cond, &args[1])
            }
            Opcode::IntGuardValue | Opcode::RefGuardValue => {
                let b = match &args[0] {
                    Value::Box(b) => *b,
                    v => return Err(hook_err(format!("expected a box, got {v:?}"))),
                };
                if !b.is_const() {
                    self.trace.push("guard_value".to_owned());
                    let orgpc = pc_arg(&args[1])?;
                    let r = match self.stream.insn(orgpc).args()[0].as_reg() {
                        Some(r) => r,
                        None => return Err(hook_err(format!("no register at pc {orgpc}"))),
                    };
                    self.regs.insert(r, BoxVal::Const(b.prim()));
                }
                Ok(Value::Void)
            }
            Opcode::GuardClass => {
                let (a, c) = unbox_ref(&args[0])?;
                let cls = self.classof(a)?;
                if !c && self.known_classes.insert(a) {
                    self.trace.push("guard_class".to_owned());
                }
                Ok(mk(Prim::Int(cls), true))
            }
            Opcode::Switch => {
                let (x, c) = unbox_int(&args[0])?;
                self.record("guard_value", c);
                let Value::Descr(d) = &args[1] else {
                    return Err(hook_err(format!("expected a descriptor, got {:?}", args[1])));
                };
                if let Descr::Switch(sd) = d.descr() {
                    if let Some((_, target)) = sd.cases.iter().find(|(v, _)| *v == x) {
                        self.pc = *target;
                    }
                }
                Ok(Value::Void)
            }
            Opcode::IntCopy | Opcode::RefCopy => Ok(args[0].clone()),
            Opcode::Strgetitem => {
                let (s, cs) = unbox_ref(&args[0])?;
                let (i, ci) = unbox_int(&args[1])?;
                self.record("strgetitem", cs && ci);
                Ok(mk(Prim::Int(self.strgetitem(s, i)?), cs && ci))
            }
            Opcode::IntBetween => {
                let (lo, c1) = unbox_int(&args[0])?;
                let (x, c2) = unbox_int(&args[1])?;
                let (hi, c3) = unbox_int(&args[2])?;
                let c = c1 && c2 && c3;
                self.record("int_between", c);
                Ok(mk(Prim::Int(i64::from(lo <= x && x < hi)), c))
            }
            Opcode::InstancePtrEq => {
                let (a, ca) = unbox_ref(&args[0])?;
                let (b, cb) = unbox_ref(&args[1])?;
                self.record("instance_ptr_eq", ca && cb);
                Ok(mk(Prim::Int(i64::from(a == b)), ca && cb))
            }
            Opcode::GetfieldGcIPure | Opcode::GetfieldGcRPure | Opcode::GetfieldRawI => {
                let b = match &args[0] {
                    Value::Box(b) => *b,
                    v => return Err(hook_err(format!("expected a box, got {v:?}"))),
                };
                let Value::Descr(d) = &args[1] else {
                    return Err(hook_err(format!("expected a descriptor, got {:?}", args[1])));
                };
                let Descr::Field(fd) = d.descr() else {
                    return Err(hook_err(format!("{d} is not a field descriptor")));
                };
                self.record("getfield", b.is_const());
                Ok(mk(self.getfield(b.prim(), fd)?, b.is_const()))
            }
            Opcode::IntReturn | Opcode::RefReturn | Opcode::FloatReturn => {
                self.ret = Some(args[0].clone());
                Ok(Value::Void)
            }
            Opcode::VoidReturn => {
                self.ret = Some(Value::Void);
                Ok(Value::Void)
            }
            Opcode::Other(s) if s == "residual_call_i_i" => {
                let (x, _) = unbox_int(&args[0])?;
                self.trace.push(s.clone());
                Ok(mk(Prim::Int(x.wrapping_mul(3)), false))
            }
            _ => Err(hook_err(format!("no generic implementation of {op}"))),
        }
    }

    fn strgetitem(&self, s: usize, i: i64) -> Result<i64, EvalError> {
        self.strs
            .get(&s)
            .and_then(|x| usize::try_from(i).ok().and_then(|i| x.get(i)))
            .copied()
            .ok_or_else(|| hook_err(format!("string index {i} out of range")))
    }

    fn classof(&self, obj: usize) -> Result<i64, EvalError> {
        self.classes
            .get(&obj)
            .copied()
            .ok_or_else(|| hook_err(format!("no object at {obj:#x}")))
    }

    fn getfield(&self, base: Prim, field: &FieldDescr) -> Result<Prim, EvalError> {
        let addr = match base {
            Prim::Ref(x) => x,
            Prim::Int(x) => x as usize,
            Prim::Float(_) => return Err(hook_err("float used as an address".to_owned())),
        };
        self.fields
            .get(&(addr, field.name.clone()))
            .copied()
            .ok_or_else(|| hook_err(format!("no field {} at {addr:#x}", field.name)))
    }
}

/// Far more bodies than any test stream executes.
pub const MAX_STEPS: usize = 10_000;

/// Run `stream` from pc 0 twice, once through its generating extension and once through generic
/// code only, with frames prepared by `setup`. Both runs must return the same value and record
/// the same trace. Each run may enter at most [MAX_STEPS] bodies. Returns the frame of the
/// specialized run.
pub fn check_sound<'a, F>(stream: &'a InsnStream, setup: F) -> TestFrame<'a>
where
    F: Fn(&mut TestFrame<'a>),
{
    let spec = generate(stream, true);
    let generic = generate(stream, false);
    let mut f1 = TestFrame::new(stream, &[]);
    setup(&mut f1);
    let mut f2 = TestFrame::new(stream, &[]);
    setup(&mut f2);
    if let Err(e) = spec.run_bounded(&mut f1, Pc::new(0), MAX_STEPS) {
        panic!("specialized run failed: {e}\n{spec}");
    }
    if let Err(e) = generic.run_bounded(&mut f2, Pc::new(0), MAX_STEPS) {
        panic!("generic run failed: {e}");
    }
    assert_eq!(f1.ret, f2.ret);
    assert_eq!(f1.trace, f2.trace);
    f1
}
