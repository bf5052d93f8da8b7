//! Portable virtual-code backend.
//!
//! Emission produces a flat array of virtual ops with branch targets
//! patched in as they become known, the same shape a machine backend
//! would give its instruction stream before encoding. The finished
//! [`CompiledFilter`] evaluates the ops directly; it is the stand-in for
//! native execution and what the differential tests observe.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};

use super::{BinaryOp, Cond, Emitter, FrameLayout, Helper, Loc, Operand, Reg, UnaryOp};
use crate::error::CompileError;
use crate::{ChainedBuffer, Scratch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VCodeInst(u32);
entity_impl!(VCodeInst);

/// One virtual instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VOp {
    Enter {
        frame: FrameLayout,
    },
    Mov {
        dst: Loc,
        src: Operand,
    },
    Op1 {
        op: UnaryOp,
        reg: Reg,
    },
    Op2 {
        op: BinaryOp,
        dst: Reg,
        src: Operand,
    },
    /// Conditional branch; `target` is patched after creation.
    Branch {
        cond: Cond,
        lhs: Reg,
        rhs: Operand,
        target: PackedOption<VCodeInst>,
    },
    Jump {
        target: PackedOption<VCodeInst>,
    },
    Call {
        helper: Helper,
    },
    Ret {
        val: Operand,
    },
}

/// Collects virtual ops during lowering.
#[derive(Default)]
pub struct VCodeBuilder {
    insts: PrimaryMap<VCodeInst, VOp>,
}

impl Emitter for VCodeBuilder {
    type Jump = VCodeInst;
    type Label = VCodeInst;
    type Output = CompiledFilter;

    fn enter(&mut self, frame: FrameLayout) {
        self.insts.push(VOp::Enter { frame });
    }

    fn mov(&mut self, dst: Loc, src: Operand) {
        self.insts.push(VOp::Mov { dst, src });
    }

    fn op1(&mut self, op: UnaryOp, reg: Reg) {
        self.insts.push(VOp::Op1 { op, reg });
    }

    fn op2(&mut self, op: BinaryOp, dst: Reg, src: Operand) {
        self.insts.push(VOp::Op2 { op, dst, src });
    }

    fn branch(&mut self, cond: Cond, lhs: Reg, rhs: Operand) -> VCodeInst {
        self.insts.push(VOp::Branch {
            cond,
            lhs,
            rhs,
            target: None.into(),
        })
    }

    fn jump(&mut self) -> VCodeInst {
        self.insts.push(VOp::Jump {
            target: None.into(),
        })
    }

    fn label(&mut self) -> VCodeInst {
        self.insts.next_key()
    }

    fn set_target(&mut self, jump: VCodeInst, label: VCodeInst) {
        match &mut self.insts[jump] {
            VOp::Branch { target, .. } | VOp::Jump { target } => *target = label.into(),
            _ => unreachable!("patched instruction is not a branch"),
        }
    }

    fn call(&mut self, helper: Helper) {
        self.insts.push(VOp::Call { helper });
    }

    fn ret(&mut self, val: Operand) {
        self.insts.push(VOp::Ret { val });
    }

    fn finalize(self) -> Result<CompiledFilter, CompileError> {
        let len = self.insts.len();
        for op in self.insts.values() {
            if let VOp::Branch { target, .. } | VOp::Jump { target } = op {
                match target.expand() {
                    Some(t) if t.index() < len => {}
                    _ => return Err(CompileError::UnresolvedBranch),
                }
            }
        }
        Ok(CompiledFilter { code: self.insts })
    }
}

/// A compiled filter program.
///
/// Pure over its inputs: no interior state, safe to share across threads;
/// per-invocation mutable state lives in the caller's [`Scratch`].
pub struct CompiledFilter {
    code: PrimaryMap<VCodeInst, VOp>,
}

enum Packet<'a> {
    Contiguous(&'a [u8]),
    Chained(&'a dyn ChainedBuffer),
}

impl CompiledFilter {
    /// Run the filter over a contiguous packet. Returns the number of
    /// bytes to accept, `0` to reject.
    pub fn filter(&self, pkt: &[u8], wirelen: u32, scratch: &mut Scratch) -> u32 {
        let buflen = u32::try_from(pkt.len()).unwrap_or(u32::MAX);
        self.run(Packet::Contiguous(pkt), buflen, wirelen, scratch)
    }

    /// Run the filter over a non-contiguous packet. The contiguous view is
    /// empty, so every guarded read goes through `chain`; a filter
    /// compiled without fallback reads rejects at the first packet access.
    pub fn filter_chained(
        &self,
        chain: &dyn ChainedBuffer,
        wirelen: u32,
        scratch: &mut Scratch,
    ) -> u32 {
        self.run(Packet::Chained(chain), 0, wirelen, scratch)
    }

    /// The generated code, for inspection.
    pub fn ops(&self) -> impl Iterator<Item = &VOp> + '_ {
        self.code.values()
    }

    fn run(&self, pkt: Packet<'_>, buflen: u32, wirelen: u32, scratch: &mut Scratch) -> u32 {
        let mut regs = Regs {
            a: 0,
            x: 0,
            t0: 0,
            t1: 0,
            buflen,
            wirelen,
        };

        let mut pc = VCodeInst::new(0);
        loop {
            let Some(op) = self.code.get(pc) else {
                return 0;
            };
            let mut next = VCodeInst::new(pc.index() + 1);

            match *op {
                VOp::Enter { .. } => {}
                VOp::Mov { dst, src } => {
                    let Some(value) = operand(src, &regs, &pkt, scratch) else {
                        return 0;
                    };
                    match dst {
                        Loc::Reg(reg) => regs.set(reg, value),
                        Loc::Mem(slot) => match scratch.mem.get_mut(slot as usize) {
                            Some(word) => *word = value,
                            None => return 0,
                        },
                        Loc::Save => scratch.save = value as usize,
                    }
                }
                VOp::Op1 {
                    op: UnaryOp::Neg,
                    reg,
                } => regs.set(reg, regs.get(reg).wrapping_neg()),
                VOp::Op2 { op, dst, src } => {
                    let Some(rhs) = operand(src, &regs, &pkt, scratch) else {
                        return 0;
                    };
                    let lhs = regs.get(dst);
                    let value = match op {
                        BinaryOp::Add => lhs.wrapping_add(rhs),
                        BinaryOp::Sub => lhs.wrapping_sub(rhs),
                        BinaryOp::Mul => lhs.wrapping_mul(rhs),
                        BinaryOp::Or => lhs | rhs,
                        BinaryOp::And => lhs & rhs,
                        BinaryOp::Xor => lhs ^ rhs,
                        BinaryOp::Shl => lhs.checked_shl(rhs).unwrap_or(0),
                        BinaryOp::Shr => lhs.checked_shr(rhs).unwrap_or(0),
                    };
                    regs.set(dst, value);
                }
                VOp::Branch {
                    cond,
                    lhs,
                    rhs,
                    target,
                } => {
                    let Some(rhs) = operand(rhs, &regs, &pkt, scratch) else {
                        return 0;
                    };
                    let lhs = regs.get(lhs);
                    let taken = match cond {
                        Cond::Eq => lhs == rhs,
                        Cond::Ne => lhs != rhs,
                        Cond::Ult => lhs < rhs,
                        Cond::Ule => lhs <= rhs,
                        Cond::Ugt => lhs > rhs,
                        Cond::Uge => lhs >= rhs,
                    };
                    if taken {
                        let Some(target) = target.expand() else {
                            return 0;
                        };
                        next = target;
                    }
                }
                VOp::Jump { target } => {
                    let Some(target) = target.expand() else {
                        return 0;
                    };
                    next = target;
                }
                VOp::Call { helper } => match helper {
                    Helper::UDiv => match regs.a.checked_div(regs.t0) {
                        Some(quotient) => regs.a = quotient,
                        None => return 0,
                    },
                    Helper::URem => match regs.a.checked_rem(regs.t0) {
                        Some(remainder) => regs.a = remainder,
                        None => return 0,
                    },
                    Helper::ReadWord | Helper::ReadHalf | Helper::ReadByte => {
                        let offset = regs.t0;
                        let value = match (&pkt, helper) {
                            (Packet::Contiguous(p), Helper::ReadWord) => {
                                read_contiguous(p, offset, 4)
                            }
                            (Packet::Contiguous(p), Helper::ReadHalf) => {
                                read_contiguous(p, offset, 2)
                            }
                            (Packet::Contiguous(p), _) => read_contiguous(p, offset, 1),
                            (Packet::Chained(c), Helper::ReadWord) => c.read_word(offset),
                            (Packet::Chained(c), Helper::ReadHalf) => {
                                c.read_half(offset).map(u32::from)
                            }
                            (Packet::Chained(c), _) => c.read_byte(offset).map(u32::from),
                        };
                        // The helpers are calls; A is caller-saved.
                        regs.a = 0;
                        match value {
                            Some(value) => {
                                regs.t0 = value;
                                regs.t1 = 0;
                            }
                            None => {
                                regs.t0 = 0;
                                regs.t1 = 1;
                            }
                        }
                    }
                },
                VOp::Ret { val } => {
                    return operand(val, &regs, &pkt, scratch).unwrap_or(0);
                }
            }

            pc = next;
        }
    }
}

struct Regs {
    a: u32,
    x: u32,
    t0: u32,
    t1: u32,
    buflen: u32,
    wirelen: u32,
}

impl Regs {
    fn get(&self, reg: Reg) -> u32 {
        match reg {
            Reg::A => self.a,
            Reg::X => self.x,
            Reg::Tmp0 => self.t0,
            Reg::Tmp1 => self.t1,
            Reg::BufLen => self.buflen,
            Reg::WireLen => self.wirelen,
        }
    }

    fn set(&mut self, reg: Reg, value: u32) {
        match reg {
            Reg::A => self.a = value,
            Reg::X => self.x = value,
            Reg::Tmp0 => self.t0 = value,
            Reg::Tmp1 => self.t1 = value,
            Reg::BufLen => self.buflen = value,
            Reg::WireLen => self.wirelen = value,
        }
    }
}

fn operand(src: Operand, regs: &Regs, pkt: &Packet<'_>, scratch: &Scratch) -> Option<u32> {
    match src {
        Operand::Reg(reg) => Some(regs.get(reg)),
        Operand::Imm(value) => Some(value),
        Operand::Mem(slot) => scratch.mem.get(slot as usize).copied(),
        Operand::Save => Some(scratch.save as u32),
        Operand::PktByte { offset, indexed } => {
            let Packet::Contiguous(p) = pkt else {
                // Chained packets present an empty contiguous view; the
                // emitted guards route every read to the fallback call.
                return None;
            };
            let mut at = u64::from(offset);
            if indexed {
                at += u64::from(regs.x);
            }
            usize::try_from(at).ok().and_then(|at| p.get(at)).map(|b| u32::from(*b))
        }
    }
}

fn read_contiguous(pkt: &[u8], offset: u32, width: u32) -> Option<u32> {
    let end = u64::from(offset) + u64::from(width);
    if end > pkt.len() as u64 {
        return None;
    }
    let mut value = 0u32;
    for i in 0..width as usize {
        value = value << 8 | u32::from(pkt[offset as usize + i]);
    }
    Some(value)
}
