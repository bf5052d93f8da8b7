pub mod error;
pub mod machinst;

mod lower;
mod mask;
mod optim;

use toccata_bpf::{Insn, MEMWORDS};

pub use error::CompileError;
pub use machinst::vcode::{CompiledFilter, VCodeBuilder, VOp};
pub use machinst::{
    BinaryOp, Cond, Emitter, FrameLayout, Helper, Loc, Operand, Reg, UnaryOp,
};

/// Compilation switches.
#[derive(Debug, Clone)]
pub struct Config {
    /// Elide length checks a dominating check already covers. Disabling
    /// this forces a check at every packet read; it can only add checks,
    /// never change what a filter accepts.
    pub check_elision: bool,
    /// Emit the chained-buffer fallback path at packet reads, for packets
    /// that are not stored contiguously. Off by default: a failed length
    /// check then rejects outright.
    pub fallback_reads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_elision: true,
            fallback_reads: false,
        }
    }
}

/// Caller-provided mutable state for one filter invocation: the sixteen
/// scratch memory words, plus a save slot the fallback path uses to keep
/// the accumulator alive across a chained-read call.
///
/// The compiled function zeroes exactly the state the program may read
/// before writing, so a `Scratch` can be reused across invocations.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub mem: [u32; MEMWORDS],
    pub(crate) save: usize,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reader for packets stored as a chain of buffer segments, consulted by
/// the fallback path after a contiguous length check fails. Offsets are
/// from the start of the logical packet; `None` reports an out-of-range
/// access and rejects the packet.
pub trait ChainedBuffer {
    fn read_byte(&self, offset: u32) -> Option<u8>;
    fn read_half(&self, offset: u32) -> Option<u16>;
    fn read_word(&self, offset: u32) -> Option<u32>;
}

/// A flat byte slice is the one-segment chain.
impl ChainedBuffer for [u8] {
    fn read_byte(&self, offset: u32) -> Option<u8> {
        self.get(offset as usize).copied()
    }

    fn read_half(&self, offset: u32) -> Option<u16> {
        let at = offset as usize;
        let bytes = self.get(at..at.checked_add(2)?)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_word(&self, offset: u32) -> Option<u32> {
        let at = offset as usize;
        let bytes = self.get(at..at.checked_add(4)?)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Compile a filter program with the default [`Config`].
///
/// The program must already be validated; everything the compiler relies
/// on is still re-checked, and a malformed program fails the compile
/// rather than producing code. Callers are expected to fall back to the
/// interpreter on failure.
pub fn compile(insns: &[Insn]) -> Result<CompiledFilter, CompileError> {
    compile_with_config(insns, &Config::default())
}

pub fn compile_with_config(
    insns: &[Insn],
    config: &Config,
) -> Result<CompiledFilter, CompileError> {
    let analysis = optim::Analysis::compute(insns, config)?;
    let mut vcode = VCodeBuilder::default();
    lower::lower(&mut vcode, insns, &analysis, config)?;
    vcode.finalize()
}
