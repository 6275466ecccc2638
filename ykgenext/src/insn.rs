//! The instruction stream that a generating extension is built from.
//!
//! An [InsnStream] is the decoded form of one function's bytecode: a mapping from program counters
//! to [Insn]s, plus enough side information (fallthrough successors, label targets, and the pcs
//! that the interpreter may enter at) for the specializer to walk it. Streams are immutable once
//! built.
//!
//! The `Display` implementations produce the textual form accepted by [Insn::from_str], e.g.:
//!
//! ```text
//! goto_if_not_int_gt %i22, 4, L2
//! int_add %i23, %i22 -> %i23
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
    str::FromStr,
};
use strum::{EnumString, IntoStaticStr};

/// A program counter: a byte offset into a function's bytecode.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pc(usize);

impl Pc {
    pub const fn new(x: usize) -> Self {
        Self(x)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl From<usize> for Pc {
    fn from(x: usize) -> Self {
        Self(x)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a register bank.
///
/// The derived ordering (ints before refs before floats) is the order in which registers are
/// listed whenever a deterministic order is needed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RegKind {
    Int,
    Ref,
    Float,
}

impl RegKind {
    /// The single character prefix used for this kind in names, e.g. `i` in `i3`.
    pub fn prefix(self) -> char {
        match self {
            RegKind::Int => 'i',
            RegKind::Ref => 'r',
            RegKind::Float => 'f',
        }
    }
}

/// A register in one of the interpreter frame's three register banks.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Register {
    kind: RegKind,
    index: u8,
}

impl Register {
    pub fn new(kind: RegKind, index: u8) -> Self {
        Self { kind, index }
    }

    pub fn int(index: u8) -> Self {
        Self::new(RegKind::Int, index)
    }

    pub fn ref_(index: u8) -> Self {
        Self::new(RegKind::Ref, index)
    }

    pub fn float(index: u8) -> Self {
        Self::new(RegKind::Float, index)
    }

    pub fn kind(&self) -> RegKind {
        self.kind
    }

    pub fn index(&self) -> u8 {
        self.index
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}{}", self.kind.prefix(), self.index)
    }
}

/// A compile-time constant operand.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Const {
    Int(i64),
    /// An opaque reference (i.e. an address). `0` is the null reference.
    Ref(usize),
    /// A float stored as its IEEE-754 bit pattern so that constants can be hashed.
    Float(u64),
}

impl Const {
    pub fn kind(&self) -> RegKind {
        match self {
            Const::Int(_) => RegKind::Int,
            Const::Ref(_) => RegKind::Ref,
            Const::Float(_) => RegKind::Float,
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(x) => write!(f, "{x}"),
            Const::Ref(x) => write!(f, "ref({x:#x})"),
            Const::Float(x) => write!(f, "{:?}", f64::from_bits(*x)),
        }
    }
}

/// A symbolic branch target.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Label(String);

impl Label {
    pub fn new(name: &str) -> Self {
        Self(name.to_owned())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The type of a field read by a `getfield_*` instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldTy {
    Int,
    /// An untraced raw pointer: treated as an integer.
    RawPtr,
    /// A GC reference.
    Gc,
}

/// A description of a field in a heap object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescr {
    pub name: String,
    pub ty: FieldTy,
    /// Is this field immutable once the object containing it has been initialised?
    pub always_pure: bool,
}

/// The cases of a `switch` instruction, in the order they appear in the bytecode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwitchDescr {
    pub cases: Vec<(i64, Pc)>,
}

/// Out-of-band metadata attached to an instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descr {
    Switch(SwitchDescr),
    Field(FieldDescr),
    /// Any other descriptor: opaque to the specializer.
    Other(String),
}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descr::Switch(SwitchDescr { cases }) => {
                let cases = cases
                    .iter()
                    .map(|(v, pc)| format!("{v}: {pc}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "<SwitchDescr {{{cases}}}>")
            }
            Descr::Field(FieldDescr { name, .. }) => write!(f, "<FieldDescr {name}>"),
            Descr::Other(s) => write!(f, "<Descr {s}>"),
        }
    }
}

/// A shared handle to a [Descr]. Two handles are equal iff they point to the same descriptor:
/// descriptors are compared, hashed, and deduplicated by identity, never by content.
#[derive(Clone, Debug)]
pub struct DescrRef(Rc<Descr>);

impl DescrRef {
    pub fn new(d: Descr) -> Self {
        Self(Rc::new(d))
    }

    pub fn descr(&self) -> &Descr {
        &self.0
    }
}

impl PartialEq for DescrRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DescrRef {}

impl Hash for DescrRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Display for DescrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An instruction operand.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Operand {
    Reg(Register),
    Const(Const),
    Label(Label),
    Descr(DescrRef),
}

impl Operand {
    pub fn as_reg(&self) -> Option<Register> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// How many bytes does this operand take up in the bytecode?
    fn encoded_len(&self) -> usize {
        match self {
            Operand::Reg(_) | Operand::Const(_) => 1,
            Operand::Label(_) | Operand::Descr(_) => 2,
        }
    }
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Operand::Reg(r)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

impl From<Label> for Operand {
    fn from(l: Label) -> Self {
        Operand::Label(l)
    }
}

impl From<DescrRef> for Operand {
    fn from(d: DescrRef) -> Self {
        Operand::Descr(d)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(x) => write!(f, "{x}"),
            Operand::Const(x) => write!(f, "{x}"),
            Operand::Label(x) => write!(f, "{x}"),
            Operand::Descr(x) => write!(f, "{x}"),
        }
    }
}

/// An instruction's opcode. Opcodes the specializer has no special knowledge of are carried
/// through as [Opcode::Other] and handled generically.
#[derive(Clone, Debug, EnumString, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    IntAdd,
    IntSub,
    IntMul,
    IntOr,
    IntAnd,
    IntXor,
    IntLshift,
    IntRshift,
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntEq,
    IntNe,
    Strgetitem,
    IntGuardValue,
    RefGuardValue,
    GuardClass,
    GetfieldRawI,
    GetfieldGcIPure,
    GetfieldGcRPure,
    IntCopy,
    RefCopy,
    IntBetween,
    InstancePtrEq,
    Goto,
    GotoIfNot,
    GotoIfNotIntIsTrue,
    GotoIfNotIntIsZero,
    GotoIfNotPtrNonzero,
    GotoIfNotPtrZero,
    GotoIfNotIntLt,
    GotoIfNotIntLe,
    GotoIfNotIntGt,
    GotoIfNotIntGe,
    GotoIfNotIntEq,
    GotoIfNotIntNe,
    Switch,
    Unreachable,
    #[strum(serialize = "-live-")]
    Live,
    IntReturn,
    RefReturn,
    FloatReturn,
    VoidReturn,
    Raise,
    Reraise,
    #[strum(default)]
    Other(String),
}

impl Opcode {
    pub fn name(&self) -> &str {
        match self {
            Opcode::Other(s) => s,
            _ => self.into(),
        }
    }

    /// Does this opcode transfer control to a label operand (in addition to, or instead of,
    /// falling through)?
    pub fn has_label_target(&self) -> bool {
        matches!(
            self,
            Opcode::Goto
                | Opcode::GotoIfNot
                | Opcode::GotoIfNotIntIsTrue
                | Opcode::GotoIfNotIntIsZero
                | Opcode::GotoIfNotPtrNonzero
                | Opcode::GotoIfNotPtrZero
                | Opcode::GotoIfNotIntLt
                | Opcode::GotoIfNotIntLe
                | Opcode::GotoIfNotIntGt
                | Opcode::GotoIfNotIntGe
                | Opcode::GotoIfNotIntEq
                | Opcode::GotoIfNotIntNe
        )
    }

    /// Does the generic implementation of this opcode need to be told the pc of the instruction
    /// it is executing (e.g. to record a guard's resume point)?
    pub fn needs_orgpc(&self) -> bool {
        (self.has_label_target() && *self != Opcode::Goto)
            || matches!(
                self,
                Opcode::IntGuardValue | Opcode::RefGuardValue | Opcode::GuardClass | Opcode::Switch
            )
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self,
            Opcode::IntReturn | Opcode::RefReturn | Opcode::FloatReturn | Opcode::VoidReturn
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single bytecode instruction.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Insn {
    opcode: Opcode,
    args: Vec<Operand>,
    result: Option<Register>,
}

impl Insn {
    pub fn new(opcode: Opcode, args: Vec<Operand>) -> Self {
        Self {
            opcode,
            args,
            result: None,
        }
    }

    pub fn with_result(mut self, result: Register) -> Self {
        self.result = Some(result);
        self
    }

    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    pub fn args(&self) -> &[Operand] {
        &self.args
    }

    pub fn result(&self) -> Option<Register> {
        self.result
    }

    /// Return the first label operand, if there is one.
    pub fn label(&self) -> Option<&Label> {
        self.args.iter().find_map(|x| match x {
            Operand::Label(l) => Some(l),
            _ => None,
        })
    }

    /// Return the first descriptor operand, if there is one.
    pub fn descr(&self) -> Option<&DescrRef> {
        self.args.iter().find_map(|x| match x {
            Operand::Descr(d) => Some(d),
            _ => None,
        })
    }

    /// How many bytes does this instruction take up in the bytecode?
    pub fn encoded_len(&self) -> usize {
        if self.opcode == Opcode::Live {
            // Liveness markers are encoded as an offset into a shared liveness table.
            return 3;
        }
        1 + self.args.iter().map(|x| x.encoded_len()).sum::<usize>()
            + usize::from(self.result.is_some())
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if !self.args.is_empty() {
            let args = self
                .args
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " {args}")?;
        }
        if let Some(r) = self.result {
            write!(f, " -> {r}")?;
        }
        Ok(())
    }
}

impl FromStr for Insn {
    type Err = Box<dyn Error>;

    /// Parse an instruction in the textual format produced by `Display`. Descriptor operands
    /// cannot be expressed textually: build such instructions with [Insn::new].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, result) = match s.split_once("->") {
            Some((body, res)) => (body, Some(parse_reg(res.trim())?)),
            None => (s, None),
        };
        let body = body.trim();
        let (opcode, args) = match body.split_once(char::is_whitespace) {
            Some((op, args)) => (op, args),
            None => (body, ""),
        };
        let opcode = Opcode::from_str(opcode).map_err(|e| format!("{opcode}: {e}"))?;
        let args = args
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(parse_operand)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            opcode,
            args,
            result,
        })
    }
}

fn parse_reg(s: &str) -> Result<Register, Box<dyn Error>> {
    let mut chars = s.chars();
    if chars.next() != Some('%') {
        return Err(format!("Invalid register '{s}'").into());
    }
    let kind = match chars.next() {
        Some('i') => RegKind::Int,
        Some('r') => RegKind::Ref,
        Some('f') => RegKind::Float,
        _ => return Err(format!("Invalid register kind in '{s}'").into()),
    };
    let index = chars
        .as_str()
        .parse::<u8>()
        .map_err(|e| format!("Invalid register index in '{s}': {e}"))?;
    Ok(Register::new(kind, index))
}

fn parse_operand(s: &str) -> Result<Operand, Box<dyn Error>> {
    if s.starts_with('%') {
        return Ok(Operand::Reg(parse_reg(s)?));
    }
    if let Some(x) = s.strip_prefix("ref(").and_then(|x| x.strip_suffix(')')) {
        let x = match x.strip_prefix("0x") {
            Some(hex) => usize::from_str_radix(hex, 16),
            None => x.parse::<usize>(),
        }
        .map_err(|e| format!("Invalid reference '{s}': {e}"))?;
        return Ok(Operand::Const(Const::Ref(x)));
    }
    if s.starts_with(|c: char| c == '-' || c.is_ascii_digit()) {
        if s.contains('.') {
            let x = s
                .parse::<f64>()
                .map_err(|e| format!("Invalid float '{s}': {e}"))?;
            return Ok(Operand::Const(Const::Float(x.to_bits())));
        }
        let x = s
            .parse::<i64>()
            .map_err(|e| format!("Invalid integer '{s}': {e}"))?;
        return Ok(Operand::Const(Const::Int(x)));
    }
    if s.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Ok(Operand::Label(Label::new(s)));
    }
    Err(format!("Invalid operand '{s}'").into())
}

/// An item in an assembly listing: see [InsnStream::assemble].
#[derive(Clone, Debug)]
pub enum AsmItem {
    Label(Label),
    Insn(Insn),
    /// A marker that control cannot fall past this point. Occupies no space.
    Barrier,
}

/// The decoded bytecode of a single function.
#[derive(Clone, Debug, Default)]
pub struct InsnStream {
    name: String,
    pc_to_insn: BTreeMap<Pc, Insn>,
    pc_to_nextpc: HashMap<Pc, Pc>,
    label_to_pc: HashMap<Label, Pc>,
    startpoints: Vec<Pc>,
}

impl InsnStream {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Lay out `items` sequentially from pc 0, assigning each instruction a pc according to its
    /// encoded length. Every instruction is a start point, and every instruction's fallthrough
    /// successor is the pc immediately after it.
    pub fn assemble(name: &str, items: Vec<AsmItem>) -> Self {
        let mut s = Self::new(name);
        let mut pc = 0;
        for item in items {
            match item {
                AsmItem::Label(l) => {
                    s.label_to_pc.insert(l, Pc(pc));
                }
                AsmItem::Insn(insn) => {
                    let next = pc + insn.encoded_len();
                    s.pc_to_nextpc.insert(Pc(pc), Pc(next));
                    s.pc_to_insn.insert(Pc(pc), insn);
                    s.startpoints.push(Pc(pc));
                    pc = next;
                }
                AsmItem::Barrier => (),
            }
        }
        s
    }

    pub fn with_insn(mut self, pc: usize, insn: Insn) -> Self {
        self.pc_to_insn.insert(Pc(pc), insn);
        self
    }

    pub fn with_next_pc(mut self, pc: usize, next: usize) -> Self {
        self.pc_to_nextpc.insert(Pc(pc), Pc(next));
        self
    }

    pub fn with_label(mut self, label: &str, pc: usize) -> Self {
        self.label_to_pc.insert(Label::new(label), Pc(pc));
        self
    }

    pub fn with_startpoint(mut self, pc: usize) -> Self {
        self.startpoints.push(Pc(pc));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the instruction at `pc`.
    ///
    /// # Panics
    ///
    /// If there is no instruction at `pc`.
    pub fn insn(&self, pc: Pc) -> &Insn {
        match self.pc_to_insn.get(&pc) {
            Some(x) => x,
            None => panic!("No instruction at pc {pc} in {}", self.name),
        }
    }

    /// Return the pc of the instruction following `pc`.
    ///
    /// # Panics
    ///
    /// If `pc` has no recorded successor.
    pub fn next_pc(&self, pc: Pc) -> Pc {
        match self.try_next_pc(pc) {
            Some(x) => x,
            None => panic!("No successor recorded for pc {pc} in {}", self.name),
        }
    }

    pub fn try_next_pc(&self, pc: Pc) -> Option<Pc> {
        self.pc_to_nextpc.get(&pc).copied()
    }

    /// Return the pc that `label` refers to.
    ///
    /// # Panics
    ///
    /// If `label` is not defined.
    pub fn label_pc(&self, label: &Label) -> Pc {
        match self.label_to_pc.get(label) {
            Some(x) => *x,
            None => panic!("Undefined label {label} in {}", self.name),
        }
    }

    pub fn max_pc(&self) -> Option<Pc> {
        self.pc_to_insn.keys().next_back().copied()
    }

    pub fn startpoints(&self) -> &[Pc] {
        &self.startpoints
    }

    /// Iterate over `(pc, instruction)` pairs in pc order.
    pub fn iter(&self) -> impl Iterator<Item = (Pc, &Insn)> {
        self.pc_to_insn.iter().map(|(pc, insn)| (*pc, insn))
    }
}

impl fmt::Display for InsnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {}", self.name)?;
        let mut labels = self.label_to_pc.iter().collect::<Vec<_>>();
        labels.sort_by(|(l1, pc1), (l2, pc2)| pc1.cmp(pc2).then_with(|| l1.cmp(l2)));
        let mut labels = labels.into_iter().peekable();
        for (pc, insn) in self.iter() {
            while let Some((l, _)) = labels.next_if(|(_, lpc)| **lpc <= pc) {
                writeln!(f, "{l}:")?;
            }
            writeln!(f, "{pc}: {insn}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_names() {
        assert_eq!(Opcode::IntAdd.name(), "int_add");
        assert_eq!(Opcode::GetfieldGcIPure.name(), "getfield_gc_i_pure");
        assert_eq!(Opcode::GotoIfNotPtrNonzero.name(), "goto_if_not_ptr_nonzero");
        assert_eq!(Opcode::Live.name(), "-live-");
        assert_eq!(Opcode::from_str("-live-").unwrap(), Opcode::Live);
        assert_eq!(Opcode::from_str("strgetitem").unwrap(), Opcode::Strgetitem);
        assert_eq!(
            Opcode::from_str("residual_call_r_r").unwrap(),
            Opcode::Other("residual_call_r_r".to_owned())
        );
        assert_eq!(
            Opcode::Other("residual_call_r_r".to_owned()).name(),
            "residual_call_r_r"
        );
    }

    #[test]
    fn parse_and_display() {
        for s in [
            "int_add %i1, %i0 -> %i1",
            "goto_if_not_int_gt %i22, 4, L2",
            "-live- %i22",
            "void_return",
            "ptr_iszero ref(0x10) -> %i3",
            "float_add %f0, 1.5 -> %f0",
        ] {
            assert_eq!(Insn::from_str(s).unwrap().to_string(), s);
        }
        let insn = Insn::from_str("int_sub %i22, -1 -> %i22").unwrap();
        assert_eq!(insn.opcode(), &Opcode::IntSub);
        assert_eq!(
            insn.args(),
            &[
                Operand::Reg(Register::int(22)),
                Operand::Const(Const::Int(-1))
            ]
        );
        assert_eq!(insn.result(), Some(Register::int(22)));
        assert!(Insn::from_str("int_add %x1").is_err());
        assert!(Insn::from_str("int_add %i1, +").is_err());
    }

    #[test]
    fn descrs_compare_by_identity() {
        let d1 = DescrRef::new(Descr::Other("x".to_owned()));
        let d2 = DescrRef::new(Descr::Other("x".to_owned()));
        assert_eq!(d1, d1.clone());
        assert_ne!(d1, d2);
    }

    #[test]
    fn assemble_layout() {
        let insn = |s: &str| AsmItem::Insn(Insn::from_str(s).unwrap());
        let s = InsnStream::assemble(
            "f",
            vec![
                AsmItem::Label(Label::new("L1")),
                insn("goto_if_not_int_gt %i22, 4, L2"),
                insn("int_add %i23, %i22 -> %i23"),
                insn("int_sub %i22, 1 -> %i22"),
                insn("goto L1"),
                AsmItem::Barrier,
                AsmItem::Label(Label::new("L2")),
                insn("int_return %i23"),
            ],
        );
        assert_eq!(
            s.startpoints(),
            &[Pc(0), Pc(5), Pc(9), Pc(13), Pc(16)]
        );
        assert_eq!(s.next_pc(Pc(16)), Pc(18));
        assert_eq!(s.label_pc(&Label::new("L2")), Pc(16));
        assert_eq!(s.max_pc(), Some(Pc(16)));
        assert_eq!(
            s.to_string(),
            "; f
L1:
0: goto_if_not_int_gt %i22, 4, L2
5: int_add %i23, %i22 -> %i23
9: int_sub %i22, 1 -> %i22
13: goto L1
L2:
16: int_return %i23
"
        );
    }

    #[test]
    fn live_markers_have_a_fixed_length() {
        let live = Insn::from_str("-live- %i0, %i1, %r2").unwrap();
        assert_eq!(live.encoded_len(), 3);
        let sw = Insn::new(
            Opcode::Switch,
            vec![
                Register::int(22).into(),
                DescrRef::new(Descr::Switch(SwitchDescr { cases: vec![] })).into(),
            ],
        );
        assert_eq!(sw.encoded_len(), 4);
    }

    #[test]
    #[should_panic]
    fn missing_insn() {
        InsnStream::new("f").insn(Pc(3));
    }
}
