//! The work list: the registry of every specializer requested while building a generating
//! extension.
//!
//! A specializer is identified by the pair (original pc, set of constant registers). Requesting
//! the same pair twice yields the same specializer, so the (finite) set of specializers reachable
//! from the function's start points is explored exactly once. Newly created specializers are
//! queued in FIFO order, which together with the monotonically increasing free-pc counter makes
//! the numbering of specialized pcs deterministic.

use crate::{
    consts::ConstRegs,
    insn::{DescrRef, Insn, InsnStream, Opcode, Pc},
    ir::{GlobalIdx, Stmt},
    specializer::{Emitter, SpecializeError, Specializer},
    syncer::{RegSyncer, RegSyncers, SyncerIdx},
};
use index_vec::IndexVec;
use std::collections::{HashMap, VecDeque};

/// The default distance between the highest original pc and the first specialized pc.
pub const OFFSET: usize = 100;

index_vec::define_index_type! {
    /// An index into a [WorkList]'s specializers.
    pub struct SpecIdx = u32;
}

pub struct WorkList<'a> {
    stream: &'a InsnStream,
    specs: IndexVec<SpecIdx, Specializer<'a>>,
    /// Deduplicates specializers by (original pc, instruction, constant registers).
    table: HashMap<(Pc, &'a Insn, ConstRegs), SpecIdx>,
    todo: VecDeque<SpecIdx>,
    /// Generic bodies which are not specializers, keyed by original pc.
    generics: HashMap<Pc, Pc>,
    generics_todo: VecDeque<(Pc, Pc)>,
    /// The next pc to hand out to a specializer whose constant set is non-empty.
    free_pc: Pc,
    globals: IndexVec<GlobalIdx, DescrRef>,
    syncers: RegSyncers,
}

impl<'a> WorkList<'a> {
    pub fn new(stream: &'a InsnStream) -> Self {
        Self::with_offset(stream, OFFSET)
    }

    pub fn with_offset(stream: &'a InsnStream, offset: usize) -> Self {
        let free_pc = Pc::new(stream.max_pc().map(|x| x.get()).unwrap_or(0) + offset);
        Self {
            stream,
            specs: IndexVec::new(),
            table: HashMap::new(),
            todo: VecDeque::new(),
            generics: HashMap::new(),
            generics_todo: VecDeque::new(),
            free_pc,
            globals: IndexVec::new(),
            syncers: RegSyncers::default(),
        }
    }

    pub fn stream(&self) -> &'a InsnStream {
        self.stream
    }

    /// Return the specializer for the instruction at `pc` with constant registers `consts`,
    /// creating (and queueing) it if necessary.
    pub fn specialize_pc(&mut self, consts: ConstRegs, pc: Pc) -> SpecIdx {
        let insn = self.stream.insn(pc);
        self.make_spec(insn, consts, pc)
    }

    /// As [Self::specialize_pc], but for callers which already hold the instruction at `pc`.
    ///
    /// # Panics
    ///
    /// If `insn` is not the instruction at `pc`.
    pub fn specialize_insn(&mut self, insn: &Insn, consts: ConstRegs, pc: Pc) -> SpecIdx {
        let stream_insn = self.stream.insn(pc);
        assert_eq!(
            insn, stream_insn,
            "Instruction does not match the instruction at pc {pc}"
        );
        self.make_spec(stream_insn, consts, pc)
    }

    fn make_spec(&mut self, insn: &'a Insn, consts: ConstRegs, pc: Pc) -> SpecIdx {
        let consts = if insn.opcode() == &Opcode::Live {
            consts.retain_live(insn)
        } else {
            consts
        };
        let key = (pc, insn, consts);
        if let Some(x) = self.table.get(&key) {
            return *x;
        }
        let (_, _, consts) = key;
        let spec_pc = if consts.is_empty() {
            pc
        } else {
            self.payout_new_free_pc()
        };
        let idx = self
            .specs
            .push(Specializer::new(insn, consts.clone(), pc, spec_pc));
        self.table.insert((pc, insn, consts), idx);
        self.todo.push_back(idx);
        idx
    }

    /// Hand out a fresh specialized pc. Each call returns a value one greater than the last.
    pub fn payout_new_free_pc(&mut self) -> Pc {
        let pc = self.free_pc;
        self.free_pc = Pc::new(pc.get() + 1);
        pc
    }

    /// Return the pc of a body which runs the generic implementation of the instruction at
    /// `orig_pc` without first checking whether any of its arguments are constant. A fresh pc is
    /// handed out the first time each original pc is requested.
    pub fn generic_pc(&mut self, orig_pc: Pc) -> Pc {
        if let Some(x) = self.generics.get(&orig_pc) {
            return *x;
        }
        let pc = self.payout_new_free_pc();
        self.generics.insert(orig_pc, pc);
        self.generics_todo.push_back((orig_pc, pc));
        pc
    }

    /// Remove and return the oldest `(original pc, pc)` pair created by [Self::generic_pc] that
    /// has not yet been handed out.
    pub fn next_generic_todo(&mut self) -> Option<(Pc, Pc)> {
        self.generics_todo.pop_front()
    }

    /// Follow `-live-` markers and unconditional `goto`s from `pc`, narrowing `consts` at each
    /// liveness marker, until reaching an instruction that is neither. Returns that instruction,
    /// the narrowed constant set, and its pc. A cycle consisting only of such instructions stops
    /// at the first instruction seen twice, and a `-live-` with no known successor stops at the
    /// marker itself.
    pub fn shortcut_live_and_goto(
        &self,
        mut consts: ConstRegs,
        mut pc: Pc,
    ) -> (&'a Insn, ConstRegs, Pc) {
        let mut seen = Vec::new();
        loop {
            let insn = self.stream.insn(pc);
            if seen.contains(&pc) {
                return (insn, consts, pc);
            }
            seen.push(pc);
            match insn.opcode() {
                Opcode::Live => {
                    consts = consts.retain_live(insn);
                    match self.stream.try_next_pc(pc) {
                        Some(x) => pc = x,
                        None => return (insn, consts, pc),
                    }
                }
                Opcode::Goto => match insn.label() {
                    Some(l) => pc = self.stream.label_pc(l),
                    None => panic!("goto at pc {pc} has no label"),
                },
                _ => return (insn, consts, pc),
            }
        }
    }

    /// Return the specialized pc that control should transfer to in order to execute `pc` with
    /// constant registers `consts`, after skipping any `-live-` markers and `goto`s. The target
    /// specializer is created if necessary.
    pub(crate) fn jump_target(&mut self, consts: ConstRegs, pc: Pc) -> Pc {
        let (_, consts, pc) = self.shortcut_live_and_goto(consts, pc);
        let idx = self.specialize_pc(consts, pc);
        self.specs[idx].get_pc()
    }

    /// Return the code for the specializer `idx`, generating it on first request. Generation may
    /// request (and thus create) further specializers. If the specializer cannot handle its
    /// instruction, [SpecializeError::Unsupported] is returned and no other specializers will
    /// have been requested.
    pub fn make_code(&mut self, idx: SpecIdx) -> Result<Vec<Stmt>, SpecializeError> {
        if let Some(x) = self.specs[idx].code() {
            return Ok(x.to_vec());
        }
        let code = Emitter::new(self, idx).make_code()?;
        self.specs[idx].set_code(code.clone());
        Ok(code)
    }

    pub fn spec(&self, idx: SpecIdx) -> &Specializer<'a> {
        &self.specs[idx]
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Remove and return the oldest specializer that has not yet been handed out.
    pub fn next_todo(&mut self) -> Option<SpecIdx> {
        self.todo.pop_front()
    }

    /// Return the index of `d` in the globals table, adding it if it is not already present.
    /// Descriptors are deduplicated by identity.
    pub(crate) fn global(&mut self, d: &DescrRef) -> GlobalIdx {
        match self.globals.iter().position(|x| x == d) {
            Some(x) => GlobalIdx::from_usize(x),
            None => self.globals.push(d.clone()),
        }
    }

    pub fn globals(&self) -> &IndexVec<GlobalIdx, DescrRef> {
        &self.globals
    }

    /// Return the synchronizer for `consts`, creating it if needed.
    pub(crate) fn syncer(&mut self, consts: &ConstRegs) -> SyncerIdx {
        self.syncers.get_or_insert(consts)
    }

    pub fn syncers(&self) -> &RegSyncers {
        &self.syncers
    }

    pub(crate) fn into_tables(
        self,
    ) -> (
        IndexVec<GlobalIdx, DescrRef>,
        IndexVec<SyncerIdx, RegSyncer>,
    ) {
        (self.globals, self.syncers.into_inner())
    }
}
