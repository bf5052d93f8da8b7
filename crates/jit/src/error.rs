use thiserror::Error;

/// Why a filter program failed to compile.
///
/// A failed compile never hands back partial code; callers fall back to
/// the reference interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("program has no instructions")]
    EmptyProgram,

    #[error("program is too long to index")]
    TooManyInsns,

    #[error("branch target out of range at instruction {0}")]
    BranchOutOfRange(usize),

    #[error("unsupported opcode {code:#06x} at instruction {at}")]
    UnsupportedOpcode { at: usize, code: u16 },

    #[error("scratch memory index {index} out of range at instruction {at}")]
    BadMemIndex { at: usize, index: u32 },

    #[error("branch left unresolved during emission")]
    UnresolvedBranch,
}
