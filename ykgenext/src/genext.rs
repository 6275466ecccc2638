//! Building a function's generating extension.
//!
//! [GenExt::generate] seeds a [WorkList] with every start point of an instruction stream (under
//! the empty constant set) and then drains the work list, asking each specializer for its code.
//! The result is a [GenExtCode]: one [Body] per specialized pc, plus the tables (globals, register
//! synchronizers, locals, entry points) a backend needs to turn the bodies into a runnable
//! function.
//!
//! A specializer which cannot handle its instruction falls back to generic code. If its constant
//! set is empty, it gets a *generic body* which calls the interpreter's implementation of the
//! opcode and then re-dispatches on the frame's pc. Otherwise its constants are synchronized back
//! into the register file and control continues at a generic body for the same original pc. That
//! is the unspecialized version of the pc if it too is unsupported. If the unspecialized version
//! is supported, it may promote its arguments straight back into the failing specializer, so a
//! separate generic body is created instead.

use crate::{
    config::GenExtConfig,
    consts::ConstRegs,
    insn::{Descr, DescrRef, Insn, InsnStream, Opcode, Operand, Pc, Register},
    ir::{fmt_block, Expr, GlobalIdx, Hook, Stmt},
    log::{
        log_ir, should_log_ir,
        stats::{Counter, Stats, TimingState},
        IRPhase, Log, Verbosity,
    },
    specializer::SpecializeError,
    syncer::{RegSyncer, SyncerIdx},
    worklist::{SpecIdx, WorkList},
};
use index_vec::IndexVec;
use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error,
    fmt,
};

/// How a body was produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyKind {
    /// Every argument was static.
    Specialized,
    /// At least one argument was only known at run-time.
    Unspecialized,
    /// The specializer could not handle the instruction: the body calls generic code.
    Generic,
}

/// The code for one specialized pc.
#[derive(Clone, Debug)]
pub struct Body {
    pub orig_pc: Pc,
    pub spec_pc: Pc,
    pub insn: Insn,
    pub consts: ConstRegs,
    pub kind: BodyKind,
    pub stmts: Vec<Stmt>,
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pc {} (orig {}): {} {}",
            self.spec_pc, self.orig_pc, self.insn, self.consts
        )?;
        fmt_block(f, &self.stmts, 1)
    }
}

/// A function's generating extension.
#[derive(Debug)]
pub struct GenExtCode {
    name: String,
    entries: Vec<Pc>,
    bodies: BTreeMap<Pc, Body>,
    locals: BTreeSet<Register>,
    globals: IndexVec<GlobalIdx, DescrRef>,
    syncers: IndexVec<SyncerIdx, RegSyncer>,
}

impl GenExtCode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pcs at which execution may enter the generated code.
    pub fn entries(&self) -> &[Pc] {
        &self.entries
    }

    pub fn body(&self, pc: Pc) -> Option<&Body> {
        self.bodies.get(&pc)
    }

    /// Iterate over the bodies in specialized pc order.
    pub fn bodies(&self) -> impl Iterator<Item = &Body> {
        self.bodies.values()
    }

    /// Every register that is unboxed into a local somewhere in the generated code.
    pub fn locals(&self) -> &BTreeSet<Register> {
        &self.locals
    }

    pub fn globals(&self) -> &IndexVec<GlobalIdx, DescrRef> {
        &self.globals
    }

    pub fn syncers(&self) -> &IndexVec<SyncerIdx, RegSyncer> {
        &self.syncers
    }
}

impl fmt::Display for GenExtCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "genext {}:", self.name)?;
        let entries = self
            .entries
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "  entries: {entries}")?;
        let locals = self
            .locals
            .iter()
            .map(|r| format!("{}{}", r.kind().prefix(), r.index()))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "  locals: {locals}")?;
        for (i, g) in self.globals.iter_enumerated() {
            writeln!(f, "  glob{} = {g}", i.index())?;
        }
        for s in &self.syncers {
            write!(f, "{s}")?;
        }
        for b in self.bodies.values() {
            write!(f, "{b}")?;
        }
        Ok(())
    }
}

/// Builds generating extensions.
pub struct GenExt {
    config: GenExtConfig,
    log: Log,
    stats: Stats,
}

impl GenExt {
    /// Create a builder configured from the environment.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        Self::with_config(GenExtConfig::from_env()?)
    }

    /// Create a builder with an explicit configuration. Logging is still configured from the
    /// environment.
    pub fn with_config(config: GenExtConfig) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            config,
            log: Log::new()?,
            stats: Stats::new(),
        })
    }

    /// Build the generating extension of `stream`.
    pub fn generate(&self, stream: &InsnStream) -> GenExtCode {
        self.stats.timing_state(TimingState::Generating);
        if should_log_ir(IRPhase::Insns) {
            log_ir(&format!("--- Begin genext-insns ---\n{stream}--- End genext-insns ---\n"));
        }

        let mut wl = WorkList::with_offset(stream, self.config.get_offset());
        for pc in stream.startpoints() {
            wl.specialize_pc(ConstRegs::new(), *pc);
        }
        let mut bodies = BTreeMap::new();
        let mut locals = BTreeSet::new();
        loop {
            let mut body = if let Some(idx) = wl.next_todo() {
                let (kind, stmts) = self.make_body(&mut wl, idx);
                let spec = wl.spec(idx);
                Body {
                    orig_pc: spec.orig_pc(),
                    spec_pc: spec.get_pc(),
                    insn: spec.insn().clone(),
                    consts: spec.constant_registers().clone(),
                    kind,
                    stmts,
                }
            } else if let Some((orig_pc, spec_pc)) = wl.next_generic_todo() {
                let insn = stream.insn(orig_pc);
                Body {
                    orig_pc,
                    spec_pc,
                    insn: insn.clone(),
                    consts: ConstRegs::new(),
                    kind: BodyKind::Generic,
                    stmts: generic_body(&mut wl, insn, orig_pc),
                }
            } else {
                break;
            };
            if let Some(next) = stream.try_next_pc(body.orig_pc) {
                body.stmts.insert(0, Stmt::SetFramePc(next));
            }
            locals.extend(body.consts.iter().copied());
            bodies.insert(body.spec_pc, body);
        }

        self.stats.count(Counter::SpecializersCreated, wl.len() as u64);
        self.stats
            .count(Counter::RegisterSyncers, wl.syncers().len() as u64);
        let (globals, syncers) = wl.into_tables();
        let code = GenExtCode {
            name: stream.name().to_owned(),
            entries: stream.startpoints().to_vec(),
            bodies,
            locals,
            globals,
            syncers,
        };
        self.log.log(
            Verbosity::JITEvent,
            &format!("generated {}: {} bodies", code.name, code.bodies.len()),
        );
        if should_log_ir(IRPhase::Code) {
            log_ir(&format!("--- Begin genext-code ---\n{code}--- End genext-code ---\n"));
        }
        self.stats.timing_state(TimingState::None);
        code
    }

    /// Produce the statements for specializer `idx`, falling back to generic code if needed.
    fn make_body(&self, wl: &mut WorkList, idx: SpecIdx) -> (BodyKind, Vec<Stmt>) {
        let spec = wl.spec(idx);
        let (insn, orig_pc) = (spec.insn(), spec.orig_pc());
        if !self.config.is_enabled() {
            return (BodyKind::Generic, generic_body(wl, insn, orig_pc));
        }
        match wl.make_code(idx) {
            Ok(stmts) => {
                if wl.spec(idx).all_args_static() {
                    self.stats.count(Counter::BodiesSpecialized, 1);
                    (BodyKind::Specialized, stmts)
                } else {
                    self.stats.count(Counter::BodiesUnspecialized, 1);
                    (BodyKind::Unspecialized, stmts)
                }
            }
            Err(SpecializeError::Unsupported(msg)) => {
                self.stats.count(Counter::BodiesUnsupported, 1);
                self.log.log(
                    Verbosity::Warning,
                    &format!("{}: falling back to generic code: {msg}", wl.stream().name()),
                );
                let consts = wl.spec(idx).constant_registers().clone();
                if consts.is_empty() {
                    return (BodyKind::Generic, generic_body(wl, insn, orig_pc));
                }
                let sidx = wl.syncer(&consts);
                let unspec = wl.specialize_pc(ConstRegs::new(), orig_pc);
                let target = if wl.make_code(unspec).is_err() {
                    wl.spec(unspec).get_pc()
                } else {
                    wl.generic_pc(orig_pc)
                };
                let stmts = vec![
                    Stmt::SyncRegs(sidx, consts.iter().copied().collect()),
                    Stmt::Goto(target),
                ];
                (BodyKind::Generic, stmts)
            }
        }
    }
}

impl Drop for GenExt {
    fn drop(&mut self) {
        self.stats.output();
    }
}

/// Return the original pcs control may continue at after `insn`, which is at `pc`.
pub fn next_possible_pcs(stream: &InsnStream, insn: &Insn, pc: Pc) -> Vec<Pc> {
    let op = insn.opcode();
    if op.is_return() || matches!(op, Opcode::Raise | Opcode::Reraise | Opcode::Unreachable) {
        return Vec::new();
    }
    if op == &Opcode::Goto {
        return insn.label().map(|l| stream.label_pc(l)).into_iter().collect();
    }
    let mut pcs = vec![stream.next_pc(pc)];
    if let Some(l) = insn.label() {
        pcs.push(stream.label_pc(l));
    }
    if let Some(Descr::Switch(sd)) = insn.descr().map(|d| d.descr()) {
        pcs.extend(sd.cases.iter().map(|(_, pc)| *pc));
    }
    pcs.sort();
    pcs.dedup();
    pcs
}

/// Produce a generic body for `insn`, which is at `orig_pc`: call the interpreter's
/// implementation of the opcode on the register file and then continue at whichever successor it
/// chose. No register is assumed to be constant.
fn generic_body(wl: &mut WorkList, insn: &Insn, orig_pc: Pc) -> Vec<Stmt> {
    let stream = wl.stream();
    let op = insn.opcode();

    let mut stmts = Vec::new();
    if !matches!(op, Opcode::Live | Opcode::Goto | Opcode::Unreachable) {
        let mut args = insn
            .args()
            .iter()
            .map(|x| match x {
                Operand::Reg(r) => Expr::Reg(*r),
                Operand::Const(c) => Expr::MakeConst(c.kind(), Box::new(Expr::Lit(*c))),
                Operand::Label(l) => Expr::pc(stream.label_pc(l)),
                Operand::Descr(d) => Expr::Global(wl.global(d)),
            })
            .collect::<Vec<_>>();
        if op.needs_orgpc() {
            args.push(Expr::pc(orig_pc));
        }
        let call = Expr::Call(Hook::Op(op.clone()), args);
        match insn.result() {
            Some(r) => stmts.push(Stmt::SetReg(r, call)),
            None => stmts.push(Stmt::Eval(call)),
        }
    }

    match next_possible_pcs(stream, insn, orig_pc).as_slice() {
        [] if op.is_return() => stmts.push(Stmt::Return),
        [] => stmts.push(Stmt::AssertUnreachable),
        [pc] => stmts.push(Stmt::Goto(wl.jump_target(ConstRegs::new(), *pc))),
        pcs => {
            let arms = pcs
                .iter()
                .map(|pc| (*pc, wl.jump_target(ConstRegs::new(), *pc)))
                .collect();
            stmts.push(Stmt::Redispatch {
                arms,
                fallthrough: None,
            });
        }
    }
    stmts
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        insn::{AsmItem, FieldDescr, FieldTy, Label},
        ir::Block,
    };
    use fm::FMBuilder;
    use std::str::FromStr;

    fn insn(s: &str) -> AsmItem {
        AsmItem::Insn(Insn::from_str(s).unwrap())
    }

    fn label(s: &str) -> AsmItem {
        AsmItem::Label(Label::new(s))
    }

    fn loop_stream() -> InsnStream {
        InsnStream::assemble(
            "loop",
            vec![
                label("L1"),
                insn("goto_if_not_int_gt %i22, 4, L2"),
                insn("int_add %i23, %i22 -> %i23"),
                insn("int_sub %i22, 1 -> %i22"),
                insn("goto L1"),
                AsmItem::Barrier,
                label("L2"),
                insn("int_return %i23"),
            ],
        )
    }

    fn genext(enabled: bool) -> GenExt {
        GenExt::with_config(GenExtConfig::default().enabled(enabled)).unwrap()
    }

    fn block_test(stmts: &[Stmt], ptn: &str) {
        let s = Block(stmts).to_string();
        let fmm = FMBuilder::new(ptn).unwrap().build().unwrap();
        if let Err(e) = fmm.matches(&s) {
            eprintln!("{e}");
            panic!();
        }
    }

    #[test]
    fn possible_pcs() {
        let s = loop_stream();
        let pcs = |pc| next_possible_pcs(&s, s.insn(Pc::new(pc)), Pc::new(pc));
        assert_eq!(pcs(0), vec![Pc::new(5), Pc::new(16)]);
        assert_eq!(pcs(5), vec![Pc::new(9)]);
        assert_eq!(pcs(13), vec![Pc::new(0)]);
        assert!(pcs(16).is_empty());
    }

    #[test]
    fn disabled() {
        let s = loop_stream();
        let code = genext(false).generate(&s);
        assert_eq!(
            code.bodies().map(|b| b.spec_pc).collect::<Vec<_>>(),
            s.startpoints()
        );
        assert!(code.bodies().all(|b| b.kind == BodyKind::Generic));
        assert!(code.locals().is_empty());
        assert!(code.syncers().is_empty());
        block_test(
            &code.body(Pc::new(0)).unwrap().stmts,
            "
          frame.pc = 5
          opimpl_goto_if_not_int_gt(regs_i[22], const_i(4), 16, 0)
          pc = frame.pc
          if pc == 5:
              pc = 5
              continue
          elif pc == 16:
              pc = 16
              continue
          else:
              assert 0
        ",
        );
        block_test(
            &code.body(Pc::new(9)).unwrap().stmts,
            "
          frame.pc = 13
          regs_i[22] = opimpl_int_sub(regs_i[22], const_i(1))
          pc = 0
          continue
        ",
        );
        block_test(
            &code.body(Pc::new(13)).unwrap().stmts,
            "
          frame.pc = 16
          pc = 0
          continue
        ",
        );
        block_test(
            &code.body(Pc::new(16)).unwrap().stmts,
            "
          frame.pc = 18
          opimpl_int_return(regs_i[23])
          return
        ",
        );
    }

    #[test]
    fn loop_pcs() {
        let s = loop_stream();
        let code = genext(true).generate(&s);
        assert_eq!(
            code.bodies().map(|b| b.spec_pc.get()).collect::<Vec<_>>(),
            vec![0, 5, 9, 13, 16, 116, 117, 118, 119, 120, 121, 122, 123]
        );
        let kinds = code
            .bodies()
            .filter(|b| b.kind == BodyKind::Specialized)
            .map(|b| b.spec_pc.get())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![13, 116, 117, 118, 121, 122, 123]);
        assert_eq!(
            code.locals().iter().copied().collect::<Vec<_>>(),
            vec![Register::int(22), Register::int(23)]
        );
        assert!(code.globals().is_empty());
        assert_eq!(code.entries(), s.startpoints());
    }

    #[test]
    fn unsupported_fallback() {
        let s = InsnStream::assemble(
            "f",
            vec![
                insn("int_guard_value %i0"),
                insn("residual_call_r_i %i0 -> %i1"),
                insn("int_return %i1"),
            ],
        );
        let code = genext(true).generate(&s);
        assert_eq!(
            code.bodies().map(|b| b.spec_pc.get()).collect::<Vec<_>>(),
            vec![0, 2, 5, 105, 106]
        );

        // With no constants, the generic implementation is called directly.
        let b = code.body(Pc::new(2)).unwrap();
        assert_eq!(b.kind, BodyKind::Generic);
        block_test(
            &b.stmts,
            "
          frame.pc = 5
          regs_i[1] = opimpl_residual_call_r_i(regs_i[0])
          pc = 5
          continue
        ",
        );

        // With constants, they are synced back and the generic version is used.
        let b = code.body(Pc::new(106)).unwrap();
        assert_eq!(b.kind, BodyKind::Generic);
        assert_eq!(b.orig_pc, Pc::new(2));
        block_test(
            &b.stmts,
            "
          frame.pc = 5
          jit_sync_regs_i0(i0)
          pc = 2
          continue
        ",
        );
        assert_eq!(code.syncers().len(), 1);
        assert_eq!(code.syncers()[SyncerIdx::new(0)].regs(), &[Register::int(0)]);
        assert_eq!(
            code.body(Pc::new(105)).unwrap().kind,
            BodyKind::Specialized
        );
    }

    #[test]
    fn promoted_unsupported_fallback() {
        let (r0, r1) = (Register::ref_(0), Register::ref_(1));
        let field = DescrRef::new(Descr::Field(FieldDescr {
            name: "next".to_owned(),
            ty: FieldTy::Gc,
            always_pure: true,
        }));
        let s = InsnStream::new("f")
            .with_insn(
                0,
                Insn::new(Opcode::GetfieldGcRPure, vec![r0.into(), field.into()]).with_result(r1),
            )
            .with_insn(4, Insn::from_str("ref_return %r1").unwrap())
            .with_next_pc(0, 4)
            .with_next_pc(4, 6)
            .with_startpoint(0);
        let code = genext(true).generate(&s);
        assert_eq!(
            code.bodies().map(|b| b.spec_pc.get()).collect::<Vec<_>>(),
            vec![0, 4, 104, 105]
        );
        assert_eq!(
            code.body(Pc::new(0)).unwrap().kind,
            BodyKind::Unspecialized
        );

        // The unspecialized version of pc 0 would promote straight back into pc 104.
        let b = code.body(Pc::new(104)).unwrap();
        assert_eq!(b.kind, BodyKind::Generic);
        block_test(
            &b.stmts,
            "
          frame.pc = 4
          jit_sync_regs_r0(r0)
          pc = 105
          continue
        ",
        );
        let b = code.body(Pc::new(105)).unwrap();
        assert_eq!(b.kind, BodyKind::Generic);
        assert_eq!(b.orig_pc, Pc::new(0));
        assert!(b.consts.is_empty());
        block_test(
            &b.stmts,
            "
          frame.pc = 4
          regs_r[1] = opimpl_getfield_gc_r_pure(regs_r[0], glob0)
          pc = 4
          continue
        ",
        );
        assert_eq!(code.globals().len(), 1);
    }

    #[test]
    fn display() {
        let s = InsnStream::assemble(
            "f",
            vec![insn("int_guard_value %i0"), insn("int_return %i0")],
        );
        let code = genext(true).generate(&s);
        let fmm = FMBuilder::new(
            "
          genext f:
            entries: 0, 2
            locals: i0
          pc 0 (orig 0): int_guard_value %i0 {}
              frame.pc = 2
              ri0 = regs_i[0]
              if is_const(ri0):
                  i0 = unbox(ri0)
                  pc = 102
                  continue
              opimpl_int_guard_value(ri0, 0)
              ri0 = regs_i[0]
              i0 = unbox(ri0)
              pc = 103
              continue
          pc 2 (orig 2): int_return %i0 {}
          ...
          pc 102 (orig 0): int_guard_value %i0 {%i0}
              frame.pc = 2
              # guard_value, argument is already constant
              pc = 103
              continue
          pc 103 (orig 2): int_return %i0 {%i0}
              frame.pc = 4
              opimpl_int_return(const_i(i0))
              return
        ",
        )
        .unwrap()
        .build()
        .unwrap();
        if let Err(e) = fmm.matches(&code.to_string()) {
            eprintln!("{e}");
            panic!();
        }
    }
}
