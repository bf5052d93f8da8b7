pub mod insn;
pub mod opcode;

pub use insn::{Insn, InsnId};
pub use opcode::{AluOp, Class, JmpOp, MiscOp, Mode, RVal, Size, Src};

/// Number of scratch memory words available to a filter program.
pub const MEMWORDS: usize = 16;
