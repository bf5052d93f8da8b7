//! Array bounds check elimination.
//!
//! Two walks over the same metadata. The backward walk computes, per
//! program point, the packet length everything reachable from that point
//! requires: reads raise the running value with `max`, and joins at branch
//! points lower each predecessor jump with `min`, so a requirement crosses
//! a branch only when both arms need it. A rejecting `ret #0` satisfies
//! any requirement; it seeds the sentinel maximum and lets checks hoist
//! freely across paths that were going to reject anyway.
//!
//! The forward walk then decides where checks actually go. It tracks the
//! length already proven on every path (`min` over predecessors: a point
//! is only as checked as its least-checked predecessor) and emits a check
//! only where the requirement exceeds it, sized for the requirement. A
//! chain of increasing-offset reads collapses into a single check for the
//! deepest one.

use cranelift_entity::{EntityRef, SecondaryMap};
use smallvec::SmallVec;
use toccata_bpf::{Class, Insn, InsnId, RVal};

use super::{read_length, InsnMeta, MetaKind, LENGTH_MAX};
use crate::Config;

type Preds = SecondaryMap<InsnId, SmallVec<[InsnId; 2]>>;

/// Backward pass: fill in `abc_length` for every reachable jump and read.
pub(super) fn compute_requirements(
    insns: &[Insn],
    preds: &Preds,
    meta: &mut SecondaryMap<InsnId, InsnMeta>,
) {
    let mut abc_length: u64 = 0;

    for (i, insn) in insns.iter().enumerate().rev() {
        let id = InsnId::new(i);
        if meta[id].unreachable {
            continue;
        }

        match insn.class() {
            Class::Ret => {
                // Rejecting returns satisfy any requirement; accepting
                // ones constrain nothing downstream.
                abc_length = if insn.rval() == Some(RVal::K) && insn.k == 0 {
                    LENGTH_MAX
                } else {
                    0
                };
            }
            Class::Jmp => {
                abc_length = meta[id].jump().abc_length;
            }
            _ => {
                if let Some(own) = read_length(insn) {
                    abc_length = abc_length.max(own);
                    match &mut meta[id].kind {
                        MetaKind::Read(read) => read.abc_length = abc_length,
                        _ => unreachable!("packet read without read metadata"),
                    }
                }
            }
        }

        for &src in &preds[id] {
            let jump = meta[src].jump_mut();
            jump.abc_length = jump.abc_length.min(abc_length);
        }
    }
}

/// Forward pass: decide which reads still need a runtime check. With check
/// elision disabled every read checks its own requirement.
pub(super) fn place_checks(
    insns: &[Insn],
    preds: &Preds,
    meta: &mut SecondaryMap<InsnId, InsnMeta>,
    config: &Config,
) {
    if !config.check_elision {
        for (i, insn) in insns.iter().enumerate() {
            let id = InsnId::new(i);
            if meta[id].unreachable {
                continue;
            }
            if let Some(own) = read_length(insn) {
                match &mut meta[id].kind {
                    MetaKind::Read(read) => read.check_length = own,
                    _ => unreachable!("packet read without read metadata"),
                }
            }
        }
        return;
    }

    let mut checked_length: u64 = 0;

    for (i, insn) in insns.iter().enumerate() {
        let id = InsnId::new(i);
        if meta[id].unreachable {
            continue;
        }

        for &src in &preds[id] {
            checked_length = checked_length.min(meta[src].jump().checked_length);
        }

        if insn.class() == Class::Jmp {
            meta[id].jump_mut().checked_length = checked_length;
        } else if read_length(insn).is_some() {
            match &mut meta[id].kind {
                MetaKind::Read(read) => {
                    read.check_length = 0;
                    if checked_length < read.abc_length {
                        checked_length = read.abc_length;
                        read.check_length = checked_length;
                    }
                }
                _ => unreachable!("packet read without read metadata"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;
    use toccata_bpf::{Insn, InsnId, JmpOp, Size};

    use super::super::{Analysis, MetaKind, LENGTH_MAX};
    use crate::Config;

    fn analyze(insns: &[Insn]) -> Analysis {
        Analysis::compute(insns, &Config::default()).unwrap()
    }

    fn check_length(analysis: &Analysis, at: usize) -> u64 {
        match &analysis.meta[InsnId::new(at)].kind {
            MetaKind::Read(read) => read.check_length,
            _ => panic!("instruction {at} is not a read"),
        }
    }

    #[test]
    fn increasing_reads_share_one_check() {
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::ld_abs(Size::B, 1),
            Insn::ld_abs(Size::B, 2),
            Insn::ret_a(),
        ];
        let analysis = analyze(&prog);
        // The first read checks for the deepest requirement; the rest are
        // covered.
        assert_eq!(check_length(&analysis, 0), 3);
        assert_eq!(check_length(&analysis, 1), 0);
        assert_eq!(check_length(&analysis, 2), 0);
    }

    #[test]
    fn requirement_does_not_cross_a_one_sided_branch() {
        // Only the true arm reads deep into the packet, so the read before
        // the branch must not over-check.
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::jmp_k(JmpOp::Jeq, 1, 0, 1),
            Insn::ld_abs(Size::B, 40), // true arm
            Insn::ret_a(),             // false arm joins here
        ];
        let analysis = analyze(&prog);
        assert_eq!(check_length(&analysis, 0), 1);
        assert_eq!(check_length(&analysis, 2), 41);
    }

    #[test]
    fn requirement_crosses_when_both_arms_read() {
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::jmp_k(JmpOp::Jeq, 1, 0, 2),
            Insn::ld_abs(Size::B, 10),
            Insn::ret_a(),
            Insn::ld_abs(Size::B, 20),
            Insn::ret_a(),
        ];
        let analysis = analyze(&prog);
        // Both arms read at least 11 bytes, so the head check absorbs the
        // smaller arm.
        assert_eq!(check_length(&analysis, 0), 11);
        assert_eq!(check_length(&analysis, 2), 0);
        assert_eq!(check_length(&analysis, 4), 21);
    }

    #[test]
    fn rejecting_return_lets_checks_hoist() {
        // The false arm rejects outright; requiring the true arm's bytes
        // up front cannot change any outcome, so the head check absorbs
        // the deep read.
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::jmp_k(JmpOp::Jeq, 1, 0, 2),
            Insn::ld_abs(Size::B, 30), // true arm
            Insn::ret_a(),
            Insn::ret_k(0), // false arm
        ];
        let analysis = analyze(&prog);
        assert_eq!(check_length(&analysis, 0), 31);
        assert_eq!(check_length(&analysis, 2), 0);
    }

    #[test]
    fn accepting_return_blocks_hoisting() {
        // The false arm accepts without reading, so the deep requirement
        // must not cross the branch; the true arm checks on its own.
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::jmp_k(JmpOp::Jeq, 1, 0, 2),
            Insn::ld_abs(Size::B, 50), // true arm
            Insn::ja(1),               // over the accept, to the tail read
            Insn::ret_k(1),            // false arm accepts
            Insn::ld_abs(Size::B, 50),
            Insn::ret_a(),
        ];
        let analysis = analyze(&prog);
        assert_eq!(check_length(&analysis, 0), 1);
        assert_eq!(check_length(&analysis, 2), 51);
        // The tail is only entered through the ja, but the forward walk
        // folds the running value of the accepting arm too; the join is
        // only as checked as its least-checked way in.
        assert_eq!(check_length(&analysis, 5), 51);
    }

    #[test]
    fn huge_offset_is_the_sentinel() {
        let prog = [Insn::ld_abs(Size::W, u32::MAX), Insn::ret_a()];
        let analysis = analyze(&prog);
        assert!(check_length(&analysis, 0) > u32::MAX as u64);
        assert!(check_length(&analysis, 0) >= LENGTH_MAX);
    }

    #[test]
    fn disabled_elision_checks_every_read() {
        let prog = [
            Insn::ld_abs(Size::B, 0),
            Insn::ld_abs(Size::B, 1),
            Insn::ld_abs(Size::B, 2),
            Insn::ret_a(),
        ];
        let config = Config {
            check_elision: false,
            ..Config::default()
        };
        let analysis = Analysis::compute(&prog, &config).unwrap();
        assert_eq!(check_length(&analysis, 0), 1);
        assert_eq!(check_length(&analysis, 1), 2);
        assert_eq!(check_length(&analysis, 2), 3);
    }
}
