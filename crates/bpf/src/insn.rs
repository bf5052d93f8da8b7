//! The classic BPF instruction record.
//!
//! A program is an ordered slice of fixed-format instructions; the index of
//! an instruction doubles as its address. Branch offsets `jt`/`jf` are
//! unsigned and relative to the next instruction, so control flow can only
//! move forward.

use core::fmt;

use cranelift_entity::entity_impl;

use crate::opcode::{AluOp, Class, JmpOp, MiscOp, Mode, RVal, Size, Src};

/// Address of an instruction within a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(pub u32);
entity_impl!(InsnId);

/// A single filter instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Insn {
    /// Packed opcode fields
    pub code: u16,
    /// Branch offset when the condition holds
    pub jt: u8,
    /// Branch offset when the condition does not hold
    pub jf: u8,
    /// Immediate operand
    pub k: u32,
}

impl Insn {
    #[inline]
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    #[inline]
    pub const fn class(&self) -> Class {
        Class::from_code(self.code)
    }

    #[inline]
    pub const fn size(&self) -> Option<Size> {
        Size::from_code(self.code)
    }

    #[inline]
    pub const fn mode(&self) -> Option<Mode> {
        Mode::from_code(self.code)
    }

    #[inline]
    pub const fn alu_op(&self) -> Option<AluOp> {
        AluOp::from_code(self.code)
    }

    #[inline]
    pub const fn jmp_op(&self) -> Option<JmpOp> {
        JmpOp::from_code(self.code)
    }

    #[inline]
    pub const fn src(&self) -> Src {
        Src::from_code(self.code)
    }

    #[inline]
    pub const fn rval(&self) -> Option<RVal> {
        RVal::from_code(self.code)
    }

    #[inline]
    pub const fn misc_op(&self) -> Option<MiscOp> {
        MiscOp::from_code(self.code)
    }

    // Builders, mostly for assembling programs in tests.

    /// `A <- k`
    pub const fn ld_imm(k: u32) -> Self {
        Self::new(Class::Ld as u16 | Mode::Imm as u16, 0, 0, k)
    }

    /// `A <- P[k:width]`
    pub const fn ld_abs(size: Size, k: u32) -> Self {
        Self::new(Class::Ld as u16 | Mode::Abs as u16 | size as u16, 0, 0, k)
    }

    /// `A <- P[X+k:width]`
    pub const fn ld_ind(size: Size, k: u32) -> Self {
        Self::new(Class::Ld as u16 | Mode::Ind as u16 | size as u16, 0, 0, k)
    }

    /// `A <- wirelen`
    pub const fn ld_len() -> Self {
        Self::new(Class::Ld as u16 | Mode::Len as u16, 0, 0, 0)
    }

    /// `A <- M[k]`
    pub const fn ld_mem(k: u32) -> Self {
        Self::new(Class::Ld as u16 | Mode::Mem as u16, 0, 0, k)
    }

    /// `X <- k`
    pub const fn ldx_imm(k: u32) -> Self {
        Self::new(Class::Ldx as u16 | Mode::Imm as u16, 0, 0, k)
    }

    /// `X <- wirelen`
    pub const fn ldx_len() -> Self {
        Self::new(Class::Ldx as u16 | Mode::Len as u16, 0, 0, 0)
    }

    /// `X <- M[k]`
    pub const fn ldx_mem(k: u32) -> Self {
        Self::new(Class::Ldx as u16 | Mode::Mem as u16, 0, 0, k)
    }

    /// `X <- 4 * (P[k:1] & 0xf)`
    pub const fn ldx_msh(k: u32) -> Self {
        Self::new(
            Class::Ldx as u16 | Mode::Msh as u16 | Size::B as u16,
            0,
            0,
            k,
        )
    }

    /// `M[k] <- A`
    pub const fn st(k: u32) -> Self {
        Self::new(Class::St as u16, 0, 0, k)
    }

    /// `M[k] <- X`
    pub const fn stx(k: u32) -> Self {
        Self::new(Class::Stx as u16, 0, 0, k)
    }

    /// `A <- A op k`
    pub const fn alu_k(op: AluOp, k: u32) -> Self {
        Self::new(Class::Alu as u16 | op as u16 | Src::K as u16, 0, 0, k)
    }

    /// `A <- A op X`
    pub const fn alu_x(op: AluOp) -> Self {
        Self::new(Class::Alu as u16 | op as u16 | Src::X as u16, 0, 0, 0)
    }

    /// `A <- -A`
    pub const fn neg() -> Self {
        Self::new(Class::Alu as u16 | AluOp::Neg as u16, 0, 0, 0)
    }

    /// `pc <- pc + 1 + k`
    pub const fn ja(k: u32) -> Self {
        Self::new(Class::Jmp as u16 | JmpOp::Ja as u16, 0, 0, k)
    }

    /// `pc <- pc + 1 + (A op k ? jt : jf)`
    pub const fn jmp_k(op: JmpOp, k: u32, jt: u8, jf: u8) -> Self {
        Self::new(Class::Jmp as u16 | op as u16 | Src::K as u16, jt, jf, k)
    }

    /// `pc <- pc + 1 + (A op X ? jt : jf)`
    pub const fn jmp_x(op: JmpOp, jt: u8, jf: u8) -> Self {
        Self::new(Class::Jmp as u16 | op as u16 | Src::X as u16, jt, jf, 0)
    }

    /// Accept `k` bytes of the packet (`0` rejects)
    pub const fn ret_k(k: u32) -> Self {
        Self::new(Class::Ret as u16 | RVal::K as u16, 0, 0, k)
    }

    /// Accept `A` bytes of the packet
    pub const fn ret_a() -> Self {
        Self::new(Class::Ret as u16 | RVal::A as u16, 0, 0, 0)
    }

    /// `X <- A`
    pub const fn tax() -> Self {
        Self::new(Class::Misc as u16 | MiscOp::Tax as u16, 0, 0, 0)
    }

    /// `A <- X`
    pub const fn txa() -> Self {
        Self::new(Class::Misc as u16 | MiscOp::Txa as u16, 0, 0, 0)
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Insn")
            .field("code", &format_args!("{:#06x}", self.code))
            .field("jt", &self.jt)
            .field("jf", &self.jf)
            .field("k", &self.k)
            .finish()
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            Class::Ld | Class::Ldx => {
                let reg = if self.class() == Class::Ld { "a" } else { "x" };
                match self.mode() {
                    Some(Mode::Imm) => write!(f, "ld {reg}, #{}", self.k),
                    Some(Mode::Abs) => {
                        let w = self.size().map_or(0, Size::width);
                        write!(f, "ld {reg}, p[{}:{w}]", self.k)
                    }
                    Some(Mode::Ind) => {
                        let w = self.size().map_or(0, Size::width);
                        write!(f, "ld {reg}, p[x+{}:{w}]", self.k)
                    }
                    Some(Mode::Mem) => write!(f, "ld {reg}, m[{}]", self.k),
                    Some(Mode::Len) => write!(f, "ld {reg}, len"),
                    Some(Mode::Msh) => write!(f, "ldx 4*(p[{}:1]&0xf)", self.k),
                    None => write!(f, "ld?! {:#06x}", self.code),
                }
            }
            Class::St => write!(f, "st m[{}], a", self.k),
            Class::Stx => write!(f, "st m[{}], x", self.k),
            Class::Alu => match self.alu_op() {
                Some(AluOp::Neg) => write!(f, "neg a"),
                Some(op) if self.src() == Src::X => write!(f, "{op} a, x"),
                Some(op) => write!(f, "{op} a, #{}", self.k),
                None => write!(f, "alu?! {:#06x}", self.code),
            },
            Class::Jmp => match self.jmp_op() {
                Some(JmpOp::Ja) => write!(f, "ja +{}", self.k),
                Some(op) if self.src() == Src::X => {
                    write!(f, "{op} a, x, +{}, +{}", self.jt, self.jf)
                }
                Some(op) => write!(f, "{op} a, #{}, +{}, +{}", self.k, self.jt, self.jf),
                None => write!(f, "jmp?! {:#06x}", self.code),
            },
            Class::Ret => match self.rval() {
                Some(RVal::A) => write!(f, "ret a"),
                Some(RVal::K) => write!(f, "ret #{}", self.k),
                _ => write!(f, "ret?! {:#06x}", self.code),
            },
            Class::Misc => match self.misc_op() {
                Some(MiscOp::Tax) => write!(f, "tax"),
                Some(MiscOp::Txa) => write!(f, "txa"),
                None => write!(f, "misc?! {:#06x}", self.code),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size() {
        assert_eq!(core::mem::size_of::<Insn>(), 8);
    }

    #[test]
    fn field_decode() {
        let insn = Insn::ld_abs(Size::H, 12);
        assert_eq!(insn.class(), Class::Ld);
        assert_eq!(insn.mode(), Some(Mode::Abs));
        assert_eq!(insn.size(), Some(Size::H));
        assert_eq!(insn.k, 12);

        let insn = Insn::jmp_k(JmpOp::Jeq, 0x800, 1, 4);
        assert_eq!(insn.class(), Class::Jmp);
        assert_eq!(insn.jmp_op(), Some(JmpOp::Jeq));
        assert_eq!(insn.src(), Src::K);
        assert_eq!((insn.jt, insn.jf), (1, 4));

        let insn = Insn::alu_x(AluOp::And);
        assert_eq!(insn.src(), Src::X);
        assert_eq!(insn.alu_op(), Some(AluOp::And));
    }

    #[test]
    fn msh_is_byte_sized() {
        let insn = Insn::ldx_msh(14);
        assert_eq!(insn.class(), Class::Ldx);
        assert_eq!(insn.mode(), Some(Mode::Msh));
        assert_eq!(insn.size(), Some(Size::B));
    }

    #[test]
    fn invalid_size_bits() {
        // 0x18 in the size field decodes to no width at all.
        let insn = Insn::new(Class::Ld as u16 | Mode::Abs as u16 | 0x18, 0, 0, 0);
        assert_eq!(insn.size(), None);
    }

    #[test]
    fn display() {
        assert_eq!(Insn::ld_abs(Size::W, 26).to_string(), "ld a, p[26:4]");
        assert_eq!(Insn::ldx_msh(14).to_string(), "ldx 4*(p[14:1]&0xf)");
        assert_eq!(
            Insn::jmp_k(JmpOp::Jset, 0x1fff, 3, 0).to_string(),
            "jset a, #8191, +3, +0"
        );
        assert_eq!(Insn::ret_k(u32::MAX).to_string(), "ret #4294967295");
        assert_eq!(Insn::alu_k(AluOp::Div, 4).to_string(), "div a, #4");
    }
}
