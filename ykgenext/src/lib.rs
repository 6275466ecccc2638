//! Generating extensions: constant-propagating specialization of jitcode.
//!
//! Given the decoded bytecode of one function (an [InsnStream]), this crate builds that
//! function's *generating extension*: a version of the function which, when run by the tracer,
//! folds away every operation whose operands are known to be constant and only calls the
//! interpreter's generic operation implementations (and thus records trace operations) for the
//! rest.
//!
//! Every reachable (pc, set of constant registers) pair is specialized exactly once by a
//! [Specializer], created on demand through a [WorkList]. [GenExt::generate] drives the whole
//! process and returns a [GenExtCode], a dispatch table of [ir::Stmt] bodies indexed by
//! specialized pc. The [eval] module can run such a table against a [eval::Frame].

pub mod config;
pub mod consts;
pub mod eval;
pub mod genext;
pub mod insn;
pub mod ir;
mod log;
pub mod specializer;
pub mod syncer;
pub mod worklist;

pub use config::GenExtConfig;
pub use consts::ConstRegs;
pub use genext::{Body, BodyKind, GenExt, GenExtCode};
pub use insn::{Insn, InsnStream, Opcode, Pc, Register};
pub use specializer::{SpecializeError, Specializer};
pub use worklist::WorkList;
