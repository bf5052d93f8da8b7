//! Whole-program analysis driving code generation.
//!
//! Three ordered walks over the instruction array share one metadata table:
//!
//! 1. [`init`] discovers control flow and the state a program may read
//!    before writing.
//! 2. [`abc`] computes, per program point, the packet length everything
//!    reachable from that point requires, then places the minimal set of
//!    runtime length checks that covers it.
//!
//! The per-target predecessor lists double as the jump graph: edges are
//! owned by the source jump's metadata and reached from the target through
//! plain instruction indices, never pointers.

pub(crate) mod abc;
pub(crate) mod init;

use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;
use toccata_bpf::{Class, Insn, InsnId, Mode, Size, MEMWORDS};

use crate::error::CompileError;
use crate::mask::StateMask;
use crate::Config;

/// Packet lengths are accumulated wider than the 32-bit offsets they come
/// from; anything above `u32::MAX` means the access can never succeed and
/// compiles to an unconditional reject.
pub(crate) const LENGTH_MAX: u64 = u32::MAX as u64 + 1;

#[derive(Clone, Default)]
pub(crate) struct InsnMeta {
    /// No path from the entry reaches this instruction.
    pub unreachable: bool,
    /// State that may still be unwritten when this instruction is entered
    /// through a jump; the union over all jumps that target it.
    pub invalid: StateMask,
    pub kind: MetaKind,
}

#[derive(Clone, Default)]
pub(crate) enum MetaKind {
    #[default]
    Other,
    Jump(JumpMeta),
    Read(ReadMeta),
}

/// Lengths attached to a branch point.
#[derive(Clone)]
pub(crate) struct JumpMeta {
    /// Bytes required by everything reachable from this jump.
    pub abc_length: u64,
    /// Bytes already guaranteed on every path reaching this jump.
    pub checked_length: u64,
}

/// Lengths attached to a packet read.
#[derive(Clone)]
pub(crate) struct ReadMeta {
    /// This read's requirement combined with everything reachable after it.
    pub abc_length: u64,
    /// The runtime check to emit here; `0` when a dominating check already
    /// covers the requirement.
    pub check_length: u64,
}

impl InsnMeta {
    pub fn jump(&self) -> &JumpMeta {
        match &self.kind {
            MetaKind::Jump(meta) => meta,
            _ => unreachable!("predecessor is not a jump"),
        }
    }

    pub fn jump_mut(&mut self) -> &mut JumpMeta {
        match &mut self.kind {
            MetaKind::Jump(meta) => meta,
            _ => unreachable!("predecessor is not a jump"),
        }
    }
}

pub(crate) struct Analysis {
    pub meta: SecondaryMap<InsnId, InsnMeta>,
    /// For each instruction, the jump instructions that target it.
    pub preds: SecondaryMap<InsnId, SmallVec<[InsnId; 2]>>,
    /// State the generated code must zero at entry so that a read of
    /// never-written state sees the same zeros the interpreter provides.
    pub init_mask: StateMask,
    /// Minimum number of scratch registers a backend must reserve.
    pub scratch_regs: u8,
}

impl Analysis {
    pub fn compute(insns: &[Insn], config: &Config) -> Result<Self, CompileError> {
        if insns.is_empty() {
            return Err(CompileError::EmptyProgram);
        }
        if insns.len() > u32::MAX as usize {
            return Err(CompileError::TooManyInsns);
        }
        validate(insns)?;

        let mut analysis = Self {
            meta: SecondaryMap::with_capacity(insns.len()),
            preds: SecondaryMap::with_capacity(insns.len()),
            init_mask: StateMask::NONE,
            scratch_regs: 0,
        };

        init::compute(insns, &mut analysis, config);
        abc::compute_requirements(insns, &analysis.preds, &mut analysis.meta);
        abc::place_checks(insns, &analysis.preds, &mut analysis.meta, config);

        Ok(analysis)
    }
}

/// The packet bytes an instruction reads on its own, `k + width`. Only
/// absolute/indexed loads and the Msh header-length load touch the packet.
pub(crate) fn read_length(insn: &Insn) -> Option<u64> {
    match insn.class() {
        Class::Ld => match insn.mode() {
            Some(Mode::Abs | Mode::Ind) => {
                let width = insn.size()?.width();
                Some(u64::from(insn.k) + u64::from(width))
            }
            _ => None,
        },
        Class::Ldx if insn.mode() == Some(Mode::Msh) => Some(u64::from(insn.k) + 1),
        _ => None,
    }
}

/// Structural validation, run before any analysis: every opcode must
/// decode, every scratch index must be in range and every branch must land
/// inside the program. The program was validated before it got here; this
/// re-checks what the compiler itself relies on.
fn validate(insns: &[Insn]) -> Result<(), CompileError> {
    for (at, insn) in insns.iter().enumerate() {
        let unsupported = CompileError::UnsupportedOpcode {
            at,
            code: insn.code,
        };

        match insn.class() {
            Class::Ld => match insn.mode().ok_or(unsupported)? {
                Mode::Imm | Mode::Len => {}
                Mode::Abs | Mode::Ind => {
                    insn.size().ok_or(unsupported)?;
                }
                Mode::Mem => check_mem_index(at, insn.k)?,
                Mode::Msh => return Err(unsupported),
            },
            Class::Ldx => match insn.mode().ok_or(unsupported)? {
                Mode::Imm | Mode::Len => {}
                Mode::Mem => check_mem_index(at, insn.k)?,
                Mode::Msh => {
                    if insn.size() != Some(Size::B) {
                        return Err(unsupported);
                    }
                }
                Mode::Abs | Mode::Ind => return Err(unsupported),
            },
            Class::St | Class::Stx => check_mem_index(at, insn.k)?,
            Class::Alu => {
                insn.alu_op().ok_or(unsupported)?;
            }
            Class::Jmp => {
                let op = insn.jmp_op().ok_or(unsupported)?;
                let remaining = insns.len() - (at + 1);
                let (jt, jf) = match op {
                    toccata_bpf::JmpOp::Ja => (insn.k as u64, insn.k as u64),
                    _ => (u64::from(insn.jt), u64::from(insn.jf)),
                };
                if jt >= remaining as u64 || jf >= remaining as u64 {
                    return Err(CompileError::BranchOutOfRange(at));
                }
            }
            Class::Ret => match insn.rval() {
                Some(toccata_bpf::RVal::K | toccata_bpf::RVal::A) => {}
                _ => return Err(unsupported),
            },
            Class::Misc => {
                insn.misc_op().ok_or(unsupported)?;
            }
        }
    }
    Ok(())
}

fn check_mem_index(at: usize, index: u32) -> Result<(), CompileError> {
    if index as usize >= MEMWORDS {
        return Err(CompileError::BadMemIndex { at, index });
    }
    Ok(())
}
