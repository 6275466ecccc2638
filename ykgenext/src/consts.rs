//! Sets of registers known to hold compile-time constants.

use crate::insn::{Insn, Opcode, Operand, Register};
use std::{collections::BTreeSet, fmt};

/// The set of registers whose values are known to be constant at a given program point. The set
/// is ordered so that iterating over it (e.g. when naming a register synchronizer) is
/// deterministic.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ConstRegs(BTreeSet<Register>);

impl ConstRegs {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, r: &Register) -> bool {
        self.0.contains(r)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.0.iter()
    }

    /// Is `op` known at compile-time, either because it is a constant or because it is a
    /// register in this set? Labels and descriptors are always static.
    pub fn is_static(&self, op: &Operand) -> bool {
        match op {
            Operand::Reg(r) => self.contains(r),
            Operand::Const(_) | Operand::Label(_) | Operand::Descr(_) => true,
        }
    }

    /// Return a copy of this set with `r` added.
    pub fn with(&self, r: Register) -> Self {
        let mut s = self.clone();
        s.0.insert(r);
        s
    }

    /// Return a copy of this set with `r` removed.
    pub fn without(&self, r: Register) -> Self {
        let mut s = self.clone();
        s.0.remove(&r);
        s
    }

    /// Return a copy of this set with every register in `ops` added. Non-register operands are
    /// ignored: only registers are ever tracked.
    pub fn with_operands<'a>(&self, ops: impl IntoIterator<Item = &'a Operand>) -> Self {
        let mut s = self.clone();
        s.0.extend(ops.into_iter().filter_map(Operand::as_reg));
        s
    }

    /// Restrict this set to the registers a `-live-` marker says are live.
    ///
    /// # Panics
    ///
    /// If `live` is not a `-live-` instruction.
    pub fn retain_live(&self, live: &Insn) -> Self {
        assert_eq!(live.opcode(), &Opcode::Live);
        let live = live
            .args()
            .iter()
            .filter_map(Operand::as_reg)
            .collect::<BTreeSet<_>>();
        Self(self.0.intersection(&live).copied().collect())
    }
}

impl FromIterator<Register> for ConstRegs {
    fn from_iter<T: IntoIterator<Item = Register>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ConstRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = self
            .0
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{regs}}}")
    }
}
