//! Reference evaluation of filter programs.
//!
//! This is the behavioral baseline the compiler must reproduce exactly.
//! Every run-time misstep (an out-of-bounds packet read, a scratch index
//! past the last memory word, division by zero, a malformed opcode) ends
//! the program with a reject (`0`) rather than an error. Scratch state is
//! implicitly zero at entry.
//!
//! Shift amounts of 32 or more produce 0; the historical C interpreter
//! leaves them undefined, and both this machine and the compiled code pin
//! down the same result.

use byteorder::{BigEndian, ByteOrder};
use toccata_bpf::{AluOp, Class, Insn, JmpOp, MiscOp, Mode, RVal, Size, Src, MEMWORDS};

struct Machine {
    a: u32,
    x: u32,
    mem: [u32; MEMWORDS],
}

/// Run `prog` against `pkt`, with `wirelen` the original length of the
/// packet on the wire. Returns the number of bytes to accept, `0` to
/// reject.
pub fn filter(prog: &[Insn], pkt: &[u8], wirelen: u32) -> u32 {
    let mut m = Machine {
        a: 0,
        x: 0,
        mem: [0; MEMWORDS],
    };

    let mut pc = 0usize;
    loop {
        let Some(insn) = prog.get(pc) else {
            return 0;
        };
        pc += 1;

        match insn.class() {
            Class::Ld => {
                let Some(value) = m.load(insn, pkt, wirelen) else {
                    return 0;
                };
                m.a = value;
            }
            Class::Ldx => match insn.mode() {
                Some(Mode::Msh) if insn.size() == Some(Size::B) => {
                    let Some(&byte) = pkt.get(insn.k as usize) else {
                        return 0;
                    };
                    m.x = 4 * u32::from(byte & 0xf);
                }
                _ => {
                    let Some(value) = m.load(insn, pkt, wirelen) else {
                        return 0;
                    };
                    m.x = value;
                }
            },
            Class::St => {
                let Some(slot) = m.mem.get_mut(insn.k as usize) else {
                    return 0;
                };
                *slot = m.a;
            }
            Class::Stx => {
                let Some(slot) = m.mem.get_mut(insn.k as usize) else {
                    return 0;
                };
                *slot = m.x;
            }
            Class::Alu => {
                let operand = match insn.src() {
                    Src::K => insn.k,
                    Src::X => m.x,
                };
                m.a = match insn.alu_op() {
                    Some(AluOp::Add) => m.a.wrapping_add(operand),
                    Some(AluOp::Sub) => m.a.wrapping_sub(operand),
                    Some(AluOp::Mul) => m.a.wrapping_mul(operand),
                    Some(AluOp::Div) => match m.a.checked_div(operand) {
                        Some(q) => q,
                        None => return 0,
                    },
                    Some(AluOp::Mod) => match m.a.checked_rem(operand) {
                        Some(r) => r,
                        None => return 0,
                    },
                    Some(AluOp::Or) => m.a | operand,
                    Some(AluOp::And) => m.a & operand,
                    Some(AluOp::Xor) => m.a ^ operand,
                    Some(AluOp::Lsh) => m.a.checked_shl(operand).unwrap_or(0),
                    Some(AluOp::Rsh) => m.a.checked_shr(operand).unwrap_or(0),
                    Some(AluOp::Neg) => m.a.wrapping_neg(),
                    None => return 0,
                };
            }
            Class::Jmp => {
                let taken = match insn.jmp_op() {
                    Some(JmpOp::Ja) => {
                        pc += insn.k as usize;
                        continue;
                    }
                    Some(op) => {
                        let operand = match insn.src() {
                            Src::K => insn.k,
                            Src::X => m.x,
                        };
                        match op {
                            JmpOp::Jeq => m.a == operand,
                            JmpOp::Jgt => m.a > operand,
                            JmpOp::Jge => m.a >= operand,
                            JmpOp::Jset => m.a & operand != 0,
                            JmpOp::Ja => unreachable!(),
                        }
                    }
                    None => return 0,
                };
                pc += usize::from(if taken { insn.jt } else { insn.jf });
            }
            Class::Ret => {
                return match insn.rval() {
                    Some(RVal::K) => insn.k,
                    Some(RVal::A) => m.a,
                    _ => 0,
                };
            }
            Class::Misc => match insn.misc_op() {
                Some(MiscOp::Tax) => m.x = m.a,
                Some(MiscOp::Txa) => m.a = m.x,
                None => return 0,
            },
        }
    }
}

impl Machine {
    /// Evaluate a load operand; `None` rejects the packet.
    fn load(&self, insn: &Insn, pkt: &[u8], wirelen: u32) -> Option<u32> {
        match insn.mode()? {
            Mode::Imm => Some(insn.k),
            Mode::Len => Some(wirelen),
            Mode::Mem => self.mem.get(insn.k as usize).copied(),
            Mode::Abs => read_pkt(pkt, insn.k as u64, insn.size()?),
            Mode::Ind => read_pkt(pkt, u64::from(self.x) + u64::from(insn.k), insn.size()?),
            Mode::Msh => None,
        }
    }
}

fn read_pkt(pkt: &[u8], offset: u64, size: Size) -> Option<u32> {
    let end = offset.checked_add(u64::from(size.width()))?;
    if end > pkt.len() as u64 {
        return None;
    }
    let at = offset as usize;
    Some(match size {
        Size::B => u32::from(pkt[at]),
        Size::H => u32::from(BigEndian::read_u16(&pkt[at..at + 2])),
        Size::W => BigEndian::read_u32(&pkt[at..at + 4]),
    })
}

#[cfg(test)]
mod tests {
    use super::filter;
    use toccata_bpf::{AluOp, Insn, JmpOp, Size};

    #[test]
    fn accept_constant() {
        let prog = [Insn::ret_k(96)];
        assert_eq!(filter(&prog, &[], 0), 96);
    }

    #[test]
    fn network_byte_order() {
        let pkt = [0x12, 0x34, 0x56, 0x78];
        let prog = [Insn::ld_abs(Size::W, 0), Insn::ret_a()];
        assert_eq!(filter(&prog, &pkt, 4), 0x12345678);

        let prog = [Insn::ld_abs(Size::H, 1), Insn::ret_a()];
        assert_eq!(filter(&prog, &pkt, 4), 0x3456);
    }

    #[test]
    fn short_packet_rejects() {
        let prog = [Insn::ld_abs(Size::W, 2), Insn::ret_k(1)];
        assert_eq!(filter(&prog, &[0; 5], 5), 0);
        assert_eq!(filter(&prog, &[0; 6], 6), 1);
    }

    #[test]
    fn indexed_load_overflow_rejects() {
        let prog = [
            Insn::ldx_imm(u32::MAX),
            Insn::ld_ind(Size::B, u32::MAX),
            Insn::ret_k(1),
        ];
        assert_eq!(filter(&prog, &[0; 16], 16), 0);
    }

    #[test]
    fn division_by_zero_rejects() {
        let prog = [
            Insn::ld_imm(5),
            Insn::ldx_imm(0),
            Insn::alu_x(AluOp::Div),
            Insn::ret_k(7),
        ];
        assert_eq!(filter(&prog, &[], 0), 0);
    }

    #[test]
    fn scratch_memory_round_trip() {
        let prog = [
            Insn::ld_imm(0xdead),
            Insn::st(3),
            Insn::ld_imm(0),
            Insn::ld_mem(3),
            Insn::ret_a(),
        ];
        assert_eq!(filter(&prog, &[], 0), 0xdead);
    }

    #[test]
    fn unwritten_scratch_reads_zero() {
        let prog = [Insn::ld_mem(9), Insn::ret_a()];
        assert_eq!(filter(&prog, &[], 0), 0);
    }

    #[test]
    fn conditional_branches() {
        let pkt = [0x08, 0x00];
        let prog = [
            Insn::ld_abs(Size::H, 0),
            Insn::jmp_k(JmpOp::Jeq, 0x0800, 0, 1),
            Insn::ret_k(u32::MAX),
            Insn::ret_k(0),
        ];
        assert_eq!(filter(&prog, &pkt, 2), u32::MAX);
        assert_eq!(filter(&prog, &[0x08, 0x06], 2), 0);
    }

    #[test]
    fn oversized_shift_is_zero() {
        let prog = [
            Insn::ld_imm(0xffff_ffff),
            Insn::alu_k(AluOp::Lsh, 32),
            Insn::ret_a(),
        ];
        assert_eq!(filter(&prog, &[], 0), 0);
    }
}
