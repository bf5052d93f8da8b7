//! Per-instruction code generation.
//!
//! One forward walk over the program, emitting through the abstract
//! [`Emitter`]. Branches are created when their source jump is lowered and
//! patched when the walk reaches the target; a shared patch list collects
//! every branch into the reject epilogue. Classic BPF only branches
//! forward, so a pending branch always resolves later in the walk.

use cranelift_entity::{EntityRef, SecondaryMap};
use smallvec::SmallVec;
use toccata_bpf::{AluOp, Class, Insn, InsnId, JmpOp, MiscOp, Mode, RVal, Size, Src, MEMWORDS};

use crate::error::CompileError;
use crate::machinst::{BinaryOp, Cond, Emitter, FrameLayout, Helper, Loc, Operand, Reg, UnaryOp};
use crate::mask::StateMask;
use crate::optim::{Analysis, MetaKind, ReadMeta};
use crate::Config;

type Pending<E> = SecondaryMap<InsnId, SmallVec<[<E as Emitter>::Jump; 2]>>;

pub(crate) fn lower<E: Emitter>(
    em: &mut E,
    insns: &[Insn],
    analysis: &Analysis,
    config: &Config,
) -> Result<(), CompileError> {
    let mut pending: Pending<E> = SecondaryMap::with_capacity(insns.len());
    let mut ret0: Vec<E::Jump> = Vec::new();

    em.enter(FrameLayout {
        memwords: MEMWORDS as u8,
        scratch_regs: analysis.scratch_regs,
        fallback_slot: config.fallback_reads,
    });

    // State the program may read before writing starts out zero, exactly
    // as the interpreter leaves it.
    if analysis.init_mask.has(StateMask::A) {
        em.mov(Loc::Reg(Reg::A), Operand::Imm(0));
    }
    if analysis.init_mask.has(StateMask::X) {
        em.mov(Loc::Reg(Reg::X), Operand::Imm(0));
    }
    for word in analysis.init_mask.mem_words() {
        em.mov(Loc::Mem(word as u8), Operand::Imm(0));
    }

    for (at, insn) in insns.iter().enumerate() {
        let id = InsnId::new(at);
        if analysis.meta[id].unreachable {
            continue;
        }

        if !analysis.preds[id].is_empty() {
            let label = em.label();
            for jump in core::mem::take(&mut pending[id]) {
                em.set_target(jump, label);
            }
        }

        match insn.class() {
            Class::Ld | Class::Ldx => {
                lower_load(em, insn, at, id, analysis, config, &mut ret0)?;
            }
            Class::St => {
                check_mem_index(at, insn.k)?;
                em.mov(Loc::Mem(insn.k as u8), Operand::Reg(Reg::A));
            }
            Class::Stx => {
                check_mem_index(at, insn.k)?;
                em.mov(Loc::Mem(insn.k as u8), Operand::Reg(Reg::X));
            }
            Class::Alu => lower_alu(em, insn, at, &mut ret0)?,
            Class::Jmp => lower_jump::<E>(em, insn, at, &mut pending)?,
            Class::Ret => match insn.rval() {
                Some(RVal::K) => em.ret(Operand::Imm(insn.k)),
                Some(RVal::A) => em.ret(Operand::Reg(Reg::A)),
                _ => return Err(unsupported(at, insn)),
            },
            Class::Misc => match insn.misc_op() {
                Some(MiscOp::Tax) => em.mov(Loc::Reg(Reg::X), Operand::Reg(Reg::A)),
                Some(MiscOp::Txa) => em.mov(Loc::Reg(Reg::A), Operand::Reg(Reg::X)),
                None => return Err(unsupported(at, insn)),
            },
        }
    }

    // Reject epilogue, and the landing spot if control ever falls off the
    // end of the program.
    let label = em.label();
    for jump in ret0 {
        em.set_target(jump, label);
    }
    em.ret(Operand::Imm(0));

    Ok(())
}

fn lower_load<E: Emitter>(
    em: &mut E,
    insn: &Insn,
    at: usize,
    id: InsnId,
    analysis: &Analysis,
    config: &Config,
    ret0: &mut Vec<E::Jump>,
) -> Result<(), CompileError> {
    let dst = if insn.class() == Class::Ld {
        Reg::A
    } else {
        Reg::X
    };

    match insn.mode() {
        Some(Mode::Imm) => em.mov(Loc::Reg(dst), Operand::Imm(insn.k)),
        Some(Mode::Len) => em.mov(Loc::Reg(dst), Operand::Reg(Reg::WireLen)),
        Some(Mode::Mem) => {
            check_mem_index(at, insn.k)?;
            em.mov(Loc::Reg(dst), Operand::Mem(insn.k as u8));
        }
        Some(Mode::Abs | Mode::Ind) if insn.class() == Class::Ld => {
            let size = insn.size().ok_or_else(|| unsupported(at, insn))?;
            let read = read_meta(analysis, id).ok_or_else(|| unsupported(at, insn))?;
            emit_pkt_read(em, insn, size, read, config, ret0);
        }
        Some(Mode::Msh) if insn.class() == Class::Ldx && insn.size() == Some(Size::B) => {
            let read = read_meta(analysis, id).ok_or_else(|| unsupported(at, insn))?;
            emit_pkt_read(em, insn, Size::B, read, config, ret0);
        }
        _ => return Err(unsupported(at, insn)),
    }
    Ok(())
}

/// A guarded packet read.
///
/// The contiguous path checks the view length once (when the placement
/// pass asks for it), guards the index register for indexed loads, then
/// assembles the value from single-byte loads in network byte order.
/// With fallback reads enabled, failed guards re-validate through the
/// chained reader instead of rejecting: a short contiguous view says
/// nothing about the length of the whole packet.
fn emit_pkt_read<E: Emitter>(
    em: &mut E,
    insn: &Insn,
    size: Size,
    read: &ReadMeta,
    config: &Config,
    ret0: &mut Vec<E::Jump>,
) {
    let k = insn.k;
    let width = size.width();
    let own = u64::from(k) + u64::from(width);
    let msh = insn.mode() == Some(Mode::Msh);
    let indexed = insn.mode() == Some(Mode::Ind);
    let dst = if msh { Reg::X } else { Reg::A };

    // No packet can satisfy a requirement past the 32-bit range.
    if read.abc_length > u32::MAX as u64 {
        ret0.push(em.jump());
        return;
    }

    let mut guards: SmallVec<[E::Jump; 2]> = SmallVec::new();

    // With fallback reads, a check-elided read still has to route chained
    // packets (empty contiguous view) to the trailer.
    let check = if config.fallback_reads {
        read.check_length.max(own)
    } else {
        read.check_length
    };
    if check > 0 {
        guards.push(em.branch(Cond::Ult, Reg::BufLen, Operand::Imm(check as u32)));
    }

    if indexed {
        // The index register must not push the access past the view:
        // reject when X > buflen - (k + width). No underflow; the check
        // above or a dominating one guarantees buflen >= k + width here.
        em.mov(Loc::Reg(Reg::Tmp0), Operand::Reg(Reg::BufLen));
        em.op2(BinaryOp::Sub, Reg::Tmp0, Operand::Imm(own as u32));
        guards.push(em.branch(Cond::Ugt, Reg::X, Operand::Reg(Reg::Tmp0)));
    }

    em.mov(Loc::Reg(dst), Operand::PktByte { offset: k, indexed });
    for byte in 1..width {
        em.op2(BinaryOp::Shl, dst, Operand::Imm(8));
        em.mov(
            Loc::Reg(Reg::Tmp1),
            Operand::PktByte {
                offset: k + byte,
                indexed,
            },
        );
        em.op2(BinaryOp::Or, dst, Operand::Reg(Reg::Tmp1));
    }
    if msh {
        em.op2(BinaryOp::And, dst, Operand::Imm(0xf));
        em.op2(BinaryOp::Shl, dst, Operand::Imm(2));
    }

    if !config.fallback_reads {
        ret0.extend(guards);
        return;
    }

    // Fallback trailer, shared by this site's guards.
    let skip = em.jump();
    let trailer = em.label();
    for jump in guards {
        em.set_target(jump, trailer);
    }

    if msh {
        // The helper clobbers A; park it for the duration of the call.
        em.mov(Loc::Save, Operand::Reg(Reg::A));
    }
    if indexed {
        em.mov(Loc::Reg(Reg::Tmp0), Operand::Reg(Reg::X));
        if k > 0 {
            em.op2(BinaryOp::Add, Reg::Tmp0, Operand::Imm(k));
            // A wrapped offset must not sneak back into range.
            ret0.push(em.branch(Cond::Ult, Reg::Tmp0, Operand::Imm(k)));
        }
    } else {
        em.mov(Loc::Reg(Reg::Tmp0), Operand::Imm(k));
    }
    em.call(match size {
        Size::W => Helper::ReadWord,
        Size::H => Helper::ReadHalf,
        Size::B => Helper::ReadByte,
    });
    ret0.push(em.branch(Cond::Ne, Reg::Tmp1, Operand::Imm(0)));
    em.mov(Loc::Reg(dst), Operand::Reg(Reg::Tmp0));
    if msh {
        em.op2(BinaryOp::And, dst, Operand::Imm(0xf));
        em.op2(BinaryOp::Shl, dst, Operand::Imm(2));
        em.mov(Loc::Reg(Reg::A), Operand::Save);
    }

    let done = em.label();
    em.set_target(skip, done);
}

fn lower_alu<E: Emitter>(
    em: &mut E,
    insn: &Insn,
    at: usize,
    ret0: &mut Vec<E::Jump>,
) -> Result<(), CompileError> {
    let operand = match insn.src() {
        Src::K => Operand::Imm(insn.k),
        Src::X => Operand::Reg(Reg::X),
    };

    match insn.alu_op() {
        Some(AluOp::Neg) => em.op1(UnaryOp::Neg, Reg::A),
        Some(AluOp::Add) => em.op2(BinaryOp::Add, Reg::A, operand),
        Some(AluOp::Sub) => em.op2(BinaryOp::Sub, Reg::A, operand),
        Some(AluOp::Mul) => em.op2(BinaryOp::Mul, Reg::A, operand),
        Some(AluOp::Or) => em.op2(BinaryOp::Or, Reg::A, operand),
        Some(AluOp::And) => em.op2(BinaryOp::And, Reg::A, operand),
        Some(AluOp::Xor) => em.op2(BinaryOp::Xor, Reg::A, operand),
        Some(op @ (AluOp::Lsh | AluOp::Rsh)) => {
            let bin = if op == AluOp::Lsh {
                BinaryOp::Shl
            } else {
                BinaryOp::Shr
            };
            if insn.src() == Src::K && insn.k >= 32 {
                em.mov(Loc::Reg(Reg::A), Operand::Imm(0));
            } else {
                em.op2(bin, Reg::A, operand);
            }
        }
        Some(op @ (AluOp::Div | AluOp::Mod)) => {
            let helper = if op == AluOp::Div {
                Helper::UDiv
            } else {
                Helper::URem
            };
            match insn.src() {
                Src::K if insn.k == 0 => {
                    // Same as the interpreter: compiles, always rejects.
                    ret0.push(em.jump());
                }
                Src::K if insn.k.is_power_of_two() => {
                    if op == AluOp::Div {
                        let shift = insn.k.trailing_zeros();
                        if shift > 0 {
                            em.op2(BinaryOp::Shr, Reg::A, Operand::Imm(shift));
                        }
                    } else {
                        em.op2(BinaryOp::And, Reg::A, Operand::Imm(insn.k - 1));
                    }
                }
                Src::K => {
                    em.mov(Loc::Reg(Reg::Tmp0), Operand::Imm(insn.k));
                    em.call(helper);
                }
                Src::X => {
                    ret0.push(em.branch(Cond::Eq, Reg::X, Operand::Imm(0)));
                    em.mov(Loc::Reg(Reg::Tmp0), Operand::Reg(Reg::X));
                    em.call(helper);
                }
            }
        }
        None => return Err(unsupported(at, insn)),
    }
    Ok(())
}

fn lower_jump<E: Emitter>(
    em: &mut E,
    insn: &Insn,
    at: usize,
    pending: &mut Pending<E>,
) -> Result<(), CompileError> {
    let op = insn.jmp_op().ok_or_else(|| unsupported(at, insn))?;
    let (jt, jf) = match op {
        JmpOp::Ja => (insn.k as usize, insn.k as usize),
        _ => (insn.jt as usize, insn.jf as usize),
    };
    let t = InsnId::new(at + 1 + jt);
    let f = InsnId::new(at + 1 + jf);

    if t == f {
        // Both arms agree; at most one unconditional jump, none when the
        // target is the next instruction.
        if jt > 0 {
            pending[t].push(em.jump());
        }
        return Ok(());
    }

    let operand = match insn.src() {
        Src::K => Operand::Imm(insn.k),
        Src::X => Operand::Reg(Reg::X),
    };
    let (lhs, rhs, cond) = match op {
        JmpOp::Jeq => (Reg::A, operand, Cond::Eq),
        JmpOp::Jgt => (Reg::A, operand, Cond::Ugt),
        JmpOp::Jge => (Reg::A, operand, Cond::Uge),
        JmpOp::Jset => {
            em.mov(Loc::Reg(Reg::Tmp0), Operand::Reg(Reg::A));
            em.op2(BinaryOp::And, Reg::Tmp0, operand);
            (Reg::Tmp0, Operand::Imm(0), Cond::Ne)
        }
        JmpOp::Ja => unreachable!("handled by the merged-target case"),
    };

    if jt == 0 {
        // The taken arm is the fall through; branch the other way on the
        // negated condition.
        pending[f].push(em.branch(negate(cond), lhs, rhs));
    } else {
        pending[t].push(em.branch(cond, lhs, rhs));
        if jf > 0 {
            pending[f].push(em.jump());
        }
    }
    Ok(())
}

fn negate(cond: Cond) -> Cond {
    match cond {
        Cond::Eq => Cond::Ne,
        Cond::Ne => Cond::Eq,
        Cond::Ult => Cond::Uge,
        Cond::Uge => Cond::Ult,
        Cond::Ule => Cond::Ugt,
        Cond::Ugt => Cond::Ule,
    }
}

fn read_meta(analysis: &Analysis, id: InsnId) -> Option<&ReadMeta> {
    match &analysis.meta[id].kind {
        MetaKind::Read(read) => Some(read),
        _ => None,
    }
}

fn unsupported(at: usize, insn: &Insn) -> CompileError {
    CompileError::UnsupportedOpcode {
        at,
        code: insn.code,
    }
}

fn check_mem_index(at: usize, index: u32) -> Result<(), CompileError> {
    if index as usize >= MEMWORDS {
        return Err(CompileError::BadMemIndex { at, index });
    }
    Ok(())
}
