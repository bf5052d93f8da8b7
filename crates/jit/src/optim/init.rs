//! Control-flow discovery and read-before-write analysis.
//!
//! A single forward walk; classic BPF branches only move forward, so every
//! jump is seen before its target and the per-target predecessor lists are
//! complete by the time the walk reaches them.
//!
//! The running `invalid` set tracks which state may still be unwritten on
//! the path being walked. Whatever an instruction reads while the bit is
//! still invalid lands in the entry zero-initialization mask. A target
//! entered through jumps starts from the union of what every source left
//! invalid: if any path leaves a bit unwritten, the bit needs guarding.
//! A program that never reads unwritten state (every well-formed filter)
//! produces an empty mask.

use cranelift_entity::EntityRef;
use toccata_bpf::{AluOp, Class, Insn, InsnId, JmpOp, MiscOp, Mode, RVal, Size, Src};

use super::{Analysis, JumpMeta, MetaKind, ReadMeta, LENGTH_MAX};
use crate::mask::StateMask;
use crate::Config;

pub(super) fn compute(insns: &[Insn], analysis: &mut Analysis, config: &Config) {
    let mut invalid = StateMask::ALL;
    let mut unreachable = false;

    let mut uses_x = false;
    let mut wide_read = false;
    let mut msh_read = false;

    for (i, insn) in insns.iter().enumerate() {
        let id = InsnId::new(i);

        if !analysis.preds[id].is_empty() {
            unreachable = false;
        }
        analysis.meta[id].unreachable = unreachable;
        if unreachable {
            continue;
        }

        invalid |= analysis.meta[id].invalid;

        match insn.class() {
            Class::Ld => {
                match insn.mode() {
                    Some(Mode::Imm | Mode::Len) => {}
                    Some(Mode::Abs) => {
                        wide_read |= insn.size() == Some(Size::W);
                        analysis.meta[id].kind = MetaKind::Read(ReadMeta {
                            abc_length: 0,
                            check_length: 0,
                        });
                    }
                    Some(Mode::Ind) => {
                        analysis.init_mask |= invalid & StateMask::X;
                        uses_x = true;
                        wide_read |= insn.size() == Some(Size::W);
                        analysis.meta[id].kind = MetaKind::Read(ReadMeta {
                            abc_length: 0,
                            check_length: 0,
                        });
                    }
                    Some(Mode::Mem) => {
                        analysis.init_mask |= invalid & StateMask::mem(insn.k);
                    }
                    _ => unreachable!("validated load mode"),
                }
                invalid.remove(StateMask::A);
            }
            Class::Ldx => {
                match insn.mode() {
                    Some(Mode::Imm | Mode::Len) => {}
                    Some(Mode::Mem) => {
                        analysis.init_mask |= invalid & StateMask::mem(insn.k);
                    }
                    Some(Mode::Msh) => {
                        msh_read = true;
                        analysis.meta[id].kind = MetaKind::Read(ReadMeta {
                            abc_length: 0,
                            check_length: 0,
                        });
                    }
                    _ => unreachable!("validated load mode"),
                }
                uses_x = true;
                invalid.remove(StateMask::X);
            }
            Class::St => {
                analysis.init_mask |= invalid & StateMask::A;
                invalid.remove(StateMask::mem(insn.k));
            }
            Class::Stx => {
                analysis.init_mask |= invalid & StateMask::X;
                uses_x = true;
                invalid.remove(StateMask::mem(insn.k));
            }
            Class::Alu => {
                analysis.init_mask |= invalid & StateMask::A;
                if insn.alu_op() != Some(AluOp::Neg) && insn.src() == Src::X {
                    analysis.init_mask |= invalid & StateMask::X;
                    uses_x = true;
                }
                invalid.remove(StateMask::A);
            }
            Class::Jmp => {
                let (jt, jf) = match insn.jmp_op() {
                    Some(JmpOp::Ja) => (insn.k as usize, insn.k as usize),
                    _ => {
                        analysis.init_mask |= invalid & StateMask::A;
                        if insn.src() == Src::X {
                            analysis.init_mask |= invalid & StateMask::X;
                            uses_x = true;
                        }
                        (insn.jt as usize, insn.jf as usize)
                    }
                };

                // Nothing falls through when both branches move away.
                if jt > 0 && jf > 0 {
                    unreachable = true;
                }

                let t = InsnId::new(i + 1 + jt);
                let f = InsnId::new(i + 1 + jf);
                analysis.preds[t].push(id);
                analysis.meta[t].invalid |= invalid;
                if f != t {
                    analysis.preds[f].push(id);
                    analysis.meta[f].invalid |= invalid;
                }

                analysis.meta[id].kind = MetaKind::Jump(JumpMeta {
                    abc_length: LENGTH_MAX,
                    checked_length: 0,
                });

                // Every continuation flows through the pushed sets.
                invalid = StateMask::NONE;
            }
            Class::Ret => {
                if insn.rval() == Some(RVal::A) {
                    analysis.init_mask |= invalid & StateMask::A;
                }
                unreachable = true;
            }
            Class::Misc => match insn.misc_op() {
                Some(MiscOp::Tax) => {
                    analysis.init_mask |= invalid & StateMask::A;
                    uses_x = true;
                    invalid.remove(StateMask::X);
                }
                Some(MiscOp::Txa) => {
                    analysis.init_mask |= invalid & StateMask::X;
                    uses_x = true;
                    invalid.remove(StateMask::A);
                }
                None => unreachable!("validated misc op"),
            },
        }
    }

    // Accumulator plus one temporary always; the index register, the
    // temporary for assembling 4-byte reads and the save slot for an Msh
    // fallback call are only reserved when some instruction needs them.
    analysis.scratch_regs = 2
        + u8::from(uses_x)
        + u8::from(wide_read)
        + u8::from(msh_read && config.fallback_reads);
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;
    use toccata_bpf::{AluOp, Insn, JmpOp, Size};

    use super::super::Analysis;
    use crate::mask::StateMask;
    use crate::Config;

    fn analyze(insns: &[Insn]) -> Analysis {
        Analysis::compute(insns, &Config::default()).unwrap()
    }

    #[test]
    fn well_formed_program_needs_no_zeroing() {
        let prog = [
            Insn::ld_abs(Size::H, 12),
            Insn::st(0),
            Insn::ld_mem(0),
            Insn::ret_a(),
        ];
        assert!(analyze(&prog).init_mask.is_empty());
    }

    #[test]
    fn read_of_unwritten_scratch_word() {
        let prog = [Insn::ld_mem(5), Insn::ret_a()];
        let analysis = analyze(&prog);
        assert!(analysis.init_mask.has(StateMask::mem(5)));
        assert!(!analysis.init_mask.has(StateMask::A));
    }

    #[test]
    fn read_of_unwritten_accumulator_and_index() {
        let prog = [Insn::alu_x(AluOp::Add), Insn::ret_a()];
        let analysis = analyze(&prog);
        assert!(analysis.init_mask.has(StateMask::A));
        assert!(analysis.init_mask.has(StateMask::X));
    }

    #[test]
    fn join_unions_unwritten_state() {
        // One branch writes M[0] before the join, the other does not; any
        // path leaving the word unwritten keeps it in the mask.
        let prog = [
            Insn::ld_imm(7),
            Insn::jmp_k(JmpOp::Jeq, 7, 0, 1),
            Insn::st(0),
            Insn::ld_mem(0),
            Insn::ret_a(),
        ];
        let analysis = analyze(&prog);
        assert!(analysis.init_mask.has(StateMask::mem(0)));
        assert!(!analysis.init_mask.has(StateMask::A));
    }

    #[test]
    fn code_after_return_is_unreachable_until_a_label() {
        let prog = [
            Insn::jmp_k(JmpOp::Jeq, 7, 0, 2),
            Insn::ret_k(0),
            Insn::ld_mem(3), // dead: nothing jumps here
            Insn::ret_k(1),  // target of jf
        ];
        let analysis = analyze(&prog);
        let meta = &analysis.meta;
        assert!(!meta[toccata_bpf::InsnId::new(1)].unreachable);
        assert!(meta[toccata_bpf::InsnId::new(2)].unreachable);
        assert!(!meta[toccata_bpf::InsnId::new(3)].unreachable);
        // The dead read never contributes to the mask.
        assert!(!analysis.init_mask.has(StateMask::mem(3)));
    }

    #[test]
    fn scratch_register_demand() {
        let base = [Insn::ld_abs(Size::B, 0), Insn::ret_a()];
        assert_eq!(analyze(&base).scratch_regs, 2);

        let wide = [Insn::ld_abs(Size::W, 0), Insn::ret_a()];
        assert_eq!(analyze(&wide).scratch_regs, 3);

        let indexed = [
            Insn::ldx_imm(2),
            Insn::ld_ind(Size::W, 0),
            Insn::ret_a(),
        ];
        assert_eq!(analyze(&indexed).scratch_regs, 4);
    }
}
