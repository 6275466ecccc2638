//! Register synchronizers.
//!
//! Before generated code can hand control to a generic opcode implementation, every register the
//! specializer has been treating as a compile-time constant must be written back to the frame's
//! register file, because the generic implementation only looks at the register file. A register
//! synchronizer is a small helper that does that write-back for one particular set of registers.
//! Synchronizers are shared: every specializer that needs to sync the same set of registers calls
//! the same helper.

use crate::{
    consts::ConstRegs,
    insn::Register,
    ir::{Expr, Local, Stmt},
};
use index_vec::IndexVec;
use std::{collections::HashMap, fmt};

index_vec::define_index_type! {
    pub struct SyncerIdx = u32;
}

/// Return the name of the synchronizer for `regs`, e.g. `jit_sync_regs_i1_r0`.
pub(crate) fn syncer_name(regs: &[Register]) -> String {
    let mut s = "jit_sync_regs".to_owned();
    for r in regs {
        s.push('_');
        s.push(r.kind().prefix());
        s.push_str(&r.index().to_string());
    }
    s
}

/// A helper which writes the constant values of a fixed, sorted, list of registers back into the
/// register file.
#[derive(Clone, Debug)]
pub struct RegSyncer {
    regs: Vec<Register>,
}

impl RegSyncer {
    pub fn name(&self) -> String {
        syncer_name(&self.regs)
    }

    /// The registers this synchronizer writes, in the order its parameters are listed.
    pub fn regs(&self) -> &[Register] {
        &self.regs
    }

    /// The body of this synchronizer: one constant-box write per register.
    pub fn body(&self) -> Vec<Stmt> {
        self.regs
            .iter()
            .map(|r| {
                Stmt::SetReg(
                    *r,
                    Expr::MakeConst(r.kind(), Box::new(Expr::Local(Local::Unboxed(*r)))),
                )
            })
            .collect()
    }
}

impl fmt::Display for RegSyncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .regs
            .iter()
            .map(|r| Local::Unboxed(*r).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "def {}({params}):", self.name())?;
        crate::ir::fmt_block(f, &self.body(), 1)
    }
}

/// The synchronizers created so far, deduplicated by their (sorted) register list.
#[derive(Debug, Default)]
pub struct RegSyncers {
    cache: HashMap<Vec<Register>, SyncerIdx>,
    syncers: IndexVec<SyncerIdx, RegSyncer>,
}

impl RegSyncers {
    /// Return the synchronizer for the registers in `consts`, creating it if this is the first
    /// time this set has been seen.
    ///
    /// # Panics
    ///
    /// If `consts` is empty: there is nothing to synchronize.
    pub fn get_or_insert(&mut self, consts: &ConstRegs) -> SyncerIdx {
        assert!(!consts.is_empty());
        let regs = consts.iter().copied().collect::<Vec<_>>();
        if let Some(x) = self.cache.get(&regs) {
            return *x;
        }
        let idx = self.syncers.push(RegSyncer { regs: regs.clone() });
        self.cache.insert(regs, idx);
        idx
    }

    pub fn syncer(&self, idx: SyncerIdx) -> &RegSyncer {
        &self.syncers[idx]
    }

    pub fn len(&self) -> usize {
        self.syncers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syncers.is_empty()
    }

    pub(crate) fn into_inner(self) -> IndexVec<SyncerIdx, RegSyncer> {
        self.syncers
    }
}
