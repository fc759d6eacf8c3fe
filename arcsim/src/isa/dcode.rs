//! Instruction predecode
//!
//! [`predecode`] turns raw instruction parcels into a [`Dcode`], a flat
//! record the interpreter can dispatch on without re-examining encoding
//! bits. It is a pure function of the parcels, the PC and the ISA options;
//! the same inputs always produce the same record, which is what makes the
//! decoded-instruction cache sound.

use super::{Cond, DcodeFlags, OpKind, Operand};
use crate::options::IsaOptions;
use sim_types::GuestAddr;

/// Raw instruction words handed to [`predecode`]. `p1` and `limm` are only
/// meaningful when the encoding calls for them; [`encoded_length`] tells
/// the fetcher how much to read.
#[derive(Clone, Copy, Debug, Default)]
pub struct Parcels {
    pub p0: u16,
    pub p1: u16,
    pub limm: u32,
}

/// One predecoded guest instruction. Immutable once produced; owned by the
/// DcodeCache slot it occupies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dcode {
    pub kind: OpKind,
    pub ops: [Operand; 3],
    pub cond: Cond,
    pub flags: DcodeFlags,
    /// Encoded length in bytes: 2, 4 or 8.
    pub len: u8,
    /// Interpreter dispatch index.
    pub exec: u8,
    /// Index into the engine's EIA extension registry.
    pub eia: Option<u16>,
}

impl Dcode {
    fn new(kind: OpKind) -> Dcode {
        Dcode {
            kind,
            ops: [Operand::None; 3],
            cond: Cond::Al,
            flags: DcodeFlags::empty(),
            len: 4,
            exec: kind as u8,
            eia: None,
        }
    }

    fn illegal() -> Dcode {
        let mut dcode = Dcode::new(OpKind::Illegal);
        dcode.len = 4;
        dcode
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(DcodeFlags::IS_BRANCH)
    }

    pub fn has_delay_slot(&self) -> bool {
        self.flags.contains(DcodeFlags::HAS_DELAY_SLOT)
    }
}

/// Whether the first parcel selects the 16-bit compact encoding.
#[inline]
pub fn is_compact(p0: u16) -> bool {
    (p0 >> 12) == 0xf
}

/// Encoded length in bytes implied by the first (and, for long-immediate
/// forms, second) parcel. Lets the fetcher read exactly the bytes the
/// instruction occupies.
pub fn encoded_length(p0: u16, p1: u16) -> u8 {
    if is_compact(p0) {
        return 2;
    }
    let c6 = ((p1 >> 10) & 0x3f) as u8;
    let major = (p0 >> 11) as u8;
    if uses_c_operand(major) && c6 == LIMM {
        8
    } else {
        4
    }
}

const LIMM: u8 = 0x3e;
const NONE_FIELD: u8 = 0x3f;

/// Majors whose C operand field is live (and may therefore request a long
/// immediate).
fn uses_c_operand(major: u8) -> bool {
    matches!(major, 0x00..=0x09 | 0x0b | 0x0f | 0x10 | 0x11 | 0x15 | 0x16)
}

fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decodes the destination field: a register, or absent.
fn dest_operand(a6: u8) -> Option<Operand> {
    match a6 {
        0..=31 => Some(Operand::Reg(a6)),
        NONE_FIELD => Some(Operand::None),
        _ => None,
    }
}

/// Decodes the C source field: register, short immediate or long immediate.
fn src_c(c6: u8, s10: i32, limm: u32) -> Option<(Operand, bool)> {
    match c6 {
        0..=31 => Some((Operand::Reg(c6), false)),
        LIMM => Some((Operand::Imm(limm as i32), true)),
        NONE_FIELD => Some((Operand::Imm(s10), false)),
        _ => None,
    }
}

/// Predecode one instruction. Illegal encodings produce a Dcode tagged
/// [`OpKind::Illegal`] rather than an error, so a known-bad PC can be
/// cached and re-raised without re-decoding.
pub fn predecode(parcels: Parcels, pc: GuestAddr, isa: &IsaOptions) -> Dcode {
    if is_compact(parcels.p0) {
        if !isa.compact_enabled {
            let mut dcode = Dcode::illegal();
            dcode.len = 2;
            return dcode;
        }
        return predecode_compact(parcels.p0);
    }
    predecode_wide(parcels, pc, isa)
}

fn predecode_compact(p0: u16) -> Dcode {
    let op4 = ((p0 >> 8) & 0xf) as u8;
    let b = ((p0 >> 4) & 0xf) as u8;
    let c = (p0 & 0xf) as u8;

    let mut dcode = match op4 {
        0x0 => Dcode::new(OpKind::Nop),
        0x1 => {
            let mut d = Dcode::new(OpKind::Mov);
            d.ops = [Operand::Reg(b), Operand::Reg(c), Operand::None];
            d
        }
        0x2 => {
            let mut d = Dcode::new(OpKind::Add);
            d.ops = [Operand::Reg(b), Operand::Reg(b), Operand::Reg(c)];
            d
        }
        0x3 => {
            let mut d = Dcode::new(OpKind::Sub);
            d.ops = [Operand::Reg(b), Operand::Reg(b), Operand::Reg(c)];
            d
        }
        0x5 => {
            let mut d = Dcode::new(OpKind::Mov);
            d.ops = [Operand::Reg(b), Operand::Imm(c as i32), Operand::None];
            d
        }
        0x6 => {
            let mut d = Dcode::new(OpKind::Cmp);
            d.ops = [Operand::Reg(b), Operand::Reg(c), Operand::None];
            d
        }
        0x7 => {
            let mut d = Dcode::new(OpKind::J);
            d.ops = [Operand::Reg(b), Operand::None, Operand::None];
            d.flags |= DcodeFlags::WRITES_PC | DcodeFlags::IS_BRANCH;
            d
        }
        0x9 => Dcode::new(OpKind::Brk),
        0xa => {
            let mut d = Dcode::new(OpKind::Trap);
            d.ops = [Operand::Imm(c as i32), Operand::None, Operand::None];
            d
        }
        _ => Dcode::illegal(),
    };
    dcode.len = 2;
    dcode.exec = dcode.kind as u8;
    dcode
}

fn predecode_wide(parcels: Parcels, pc: GuestAddr, isa: &IsaOptions) -> Dcode {
    let p0 = parcels.p0;
    let p1 = parcels.p1;
    let major = (p0 >> 11) as u8;
    let a6 = ((p0 >> 5) & 0x3f) as u8;
    let b5 = (p0 & 0x1f) as u8;
    let c6 = ((p1 >> 10) & 0x3f) as u8;
    let s10 = sext((p1 & 0x3ff) as u32, 10);

    let long = uses_c_operand(major) && c6 == LIMM;
    let len: u8 = if long { 8 } else { 4 };

    let illegal = || {
        let mut d = Dcode::illegal();
        d.len = len;
        d
    };

    let mut dcode = match major {
        // mov dest, c
        0x00 => {
            let (Some(dest), Some((src, limm))) = (dest_operand(a6), src_c(c6, s10, parcels.limm))
            else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Mov);
            d.ops = [dest, src, Operand::None];
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            d
        }
        // three-operand ALU: op dest, b, c
        0x01..=0x08 => {
            let kind = match major {
                0x01 => OpKind::Add,
                0x02 => OpKind::Sub,
                0x03 => OpKind::And,
                0x04 => OpKind::Or,
                0x05 => OpKind::Xor,
                0x06 => OpKind::Asl,
                0x07 => OpKind::Lsr,
                _ => OpKind::Mpy,
            };
            if kind == OpKind::Mpy && !isa.mpy_enabled {
                return illegal();
            }
            let (Some(dest), Some((src, limm))) = (dest_operand(a6), src_c(c6, s10, parcels.limm))
            else {
                return illegal();
            };
            let mut d = Dcode::new(kind);
            d.ops = [dest, Operand::Reg(b5), src];
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            d
        }
        // cmp b, c
        0x09 => {
            let Some((src, limm)) = src_c(c6, s10, parcels.limm) else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Cmp);
            d.ops = [Operand::Reg(b5), src, Operand::None];
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            d
        }
        // ld dest, [b, s10]
        0x0a => {
            let Some(dest) = dest_operand(a6) else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Ld);
            d.ops = [dest, Operand::Reg(b5), Operand::Imm(s10)];
            d.flags |= DcodeFlags::IS_MEMORY;
            d
        }
        // st c, [b, s10]; the stored value must be a register or limm
        0x0b => {
            let Some((src, limm)) = src_c(c6, s10, parcels.limm) else {
                return illegal();
            };
            if c6 == NONE_FIELD {
                return illegal();
            }
            let mut d = Dcode::new(OpKind::St);
            d.ops = [src, Operand::Reg(b5), Operand::Imm(s10)];
            d.flags |= DcodeFlags::IS_MEMORY;
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            d
        }
        // b / bl: 20-bit halfword displacement from a[4:0]:b:imm10
        0x0c | 0x0d => {
            let disp = ((a6 as u32 & 0x1f) << 15) | ((b5 as u32) << 10) | (p1 as u32 & 0x3ff);
            let target = pc.wrapping_add((sext(disp, 20) as u32) << 1);
            let kind = if major == 0x0c { OpKind::B } else { OpKind::Bl };
            let mut d = Dcode::new(kind);
            d.ops = [Operand::Imm(target as i32), Operand::None, Operand::None];
            d.flags |= DcodeFlags::READS_PC | DcodeFlags::WRITES_PC | DcodeFlags::IS_BRANCH;
            if a6 & 0x20 != 0 {
                if !isa.delay_slots_enabled {
                    return illegal();
                }
                d.flags |= DcodeFlags::HAS_DELAY_SLOT;
            }
            d
        }
        // bcc: condition in a[3:0], 15-bit halfword displacement
        0x0e => {
            let Some(cond) = Cond::from_field(a6 & 0xf) else {
                return illegal();
            };
            let disp = ((b5 as u32) << 10) | (p1 as u32 & 0x3ff);
            let target = pc.wrapping_add((sext(disp, 15) as u32) << 1);
            let mut d = Dcode::new(OpKind::Bcc);
            d.cond = cond;
            d.ops = [Operand::Imm(target as i32), Operand::None, Operand::None];
            d.flags |= DcodeFlags::READS_PC | DcodeFlags::WRITES_PC | DcodeFlags::IS_BRANCH;
            if a6 & 0x20 != 0 {
                if !isa.delay_slots_enabled {
                    return illegal();
                }
                d.flags |= DcodeFlags::HAS_DELAY_SLOT;
            }
            d
        }
        // brcc: compare b against c and branch on eq/ne, s10 displacement
        0x0f => {
            if c6 > 31 {
                return illegal();
            }
            let target = pc.wrapping_add((s10 as u32) << 1);
            let mut d = Dcode::new(OpKind::Brcc);
            d.cond = if a6 & 1 == 0 { Cond::Eq } else { Cond::Ne };
            d.ops = [
                Operand::Reg(b5),
                Operand::Reg(c6),
                Operand::Imm(target as i32),
            ];
            d.flags |= DcodeFlags::READS_PC | DcodeFlags::WRITES_PC | DcodeFlags::IS_BRANCH;
            if a6 & 0x20 != 0 {
                if !isa.delay_slots_enabled {
                    return illegal();
                }
                d.flags |= DcodeFlags::HAS_DELAY_SLOT;
            }
            d
        }
        // j / jl: absolute target from c
        0x10 | 0x11 => {
            let Some((src, limm)) = src_c(c6, s10, parcels.limm) else {
                return illegal();
            };
            let kind = if major == 0x10 { OpKind::J } else { OpKind::Jl };
            let mut d = Dcode::new(kind);
            d.ops = [src, Operand::None, Operand::None];
            d.flags |= DcodeFlags::WRITES_PC | DcodeFlags::IS_BRANCH;
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            if a6 & 0x20 != 0 {
                if !isa.delay_slots_enabled {
                    return illegal();
                }
                d.flags |= DcodeFlags::HAS_DELAY_SLOT;
            }
            d
        }
        // lr dest, aux
        0x12 => {
            let Some(dest) = dest_operand(a6) else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Lr);
            d.ops = [dest, Operand::Aux((p1 & 0x3ff) as u16), Operand::None];
            d
        }
        // sr b, aux
        0x13 => {
            let mut d = Dcode::new(OpKind::Sr);
            d.ops = [Operand::Reg(b5), Operand::Aux((p1 & 0x3ff) as u16), Operand::None];
            d
        }
        0x14 => {
            let mut d = Dcode::new(OpKind::Trap);
            d.ops = [Operand::Imm(s10), Operand::None, Operand::None];
            d
        }
        0x15 => {
            let Some((src, limm)) = src_c(c6, s10, parcels.limm) else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Flag);
            d.ops = [src, Operand::None, Operand::None];
            if limm {
                d.flags |= DcodeFlags::HAS_LONG_IMM;
            }
            d
        }
        // extension space: sub-opcode in c, operands dest(a) and b
        0x16 => {
            let Some(&index) = isa.eia_subops.get(&c6) else {
                return illegal();
            };
            let Some(dest) = dest_operand(a6) else {
                return illegal();
            };
            let mut d = Dcode::new(OpKind::Eia);
            d.ops = [dest, Operand::Reg(b5), Operand::Imm(s10)];
            d.eia = Some(index);
            d
        }
        _ => return illegal(),
    };

    dcode.len = len;
    dcode.exec = dcode.kind as u8;
    dcode
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide(major: u8, a6: u8, b5: u8, c6: u8, imm10: u16) -> Parcels {
        Parcels {
            p0: ((major as u16) << 11) | ((a6 as u16) << 5) | b5 as u16,
            p1: ((c6 as u16) << 10) | (imm10 & 0x3ff),
            limm: 0,
        }
    }

    #[test]
    fn test_compact_decode() {
        let isa = IsaOptions::default();
        // mov_s r3, 7
        let dcode = predecode(
            Parcels { p0: 0xf537, p1: 0, limm: 0 },
            0x100,
            &isa,
        );
        assert_eq!(dcode.kind, OpKind::Mov);
        assert_eq!(dcode.len, 2);
        assert_eq!(dcode.ops[0], Operand::Reg(3));
        assert_eq!(dcode.ops[1], Operand::Imm(7));
    }

    #[test]
    fn test_compact_disabled() {
        let mut isa = IsaOptions::default();
        isa.compact_enabled = false;
        let dcode = predecode(Parcels { p0: 0xf000, p1: 0, limm: 0 }, 0, &isa);
        assert_eq!(dcode.kind, OpKind::Illegal);
        assert_eq!(dcode.len, 2);
    }

    #[test]
    fn test_add_with_short_imm() {
        let isa = IsaOptions::default();
        let dcode = predecode(wide(0x01, 2, 1, 0x3f, 0x3ff), 0, &isa);
        assert_eq!(dcode.kind, OpKind::Add);
        assert_eq!(dcode.ops[0], Operand::Reg(2));
        assert_eq!(dcode.ops[1], Operand::Reg(1));
        // imm10 of 0x3ff sign-extends to -1
        assert_eq!(dcode.ops[2], Operand::Imm(-1));
        assert_eq!(dcode.len, 4);
    }

    #[test]
    fn test_long_immediate_length() {
        let isa = IsaOptions::default();
        let mut parcels = wide(0x00, 5, 0, 0x3e, 0);
        parcels.limm = 0xdead_beef;
        assert_eq!(encoded_length(parcels.p0, parcels.p1), 8);
        let dcode = predecode(parcels, 0, &isa);
        assert_eq!(dcode.kind, OpKind::Mov);
        assert_eq!(dcode.len, 8);
        assert!(dcode.flags.contains(DcodeFlags::HAS_LONG_IMM));
        assert_eq!(dcode.ops[1], Operand::Imm(0xdead_beefu32 as i32));
    }

    #[test]
    fn test_branch_target_resolution() {
        let isa = IsaOptions::default();
        // b +8 halfwords from pc 0x1000
        let dcode = predecode(wide(0x0c, 0, 0, 0, 8), 0x1000, &isa);
        assert_eq!(dcode.kind, OpKind::B);
        assert_eq!(dcode.ops[0], Operand::Imm(0x1010));
        assert!(dcode.flags.contains(DcodeFlags::IS_BRANCH));
        assert!(!dcode.has_delay_slot());

        // backward displacement
        let dcode = predecode(wide(0x0c, 0x1f, 0x1f, 0, 0x3ff), 0x1000, &isa);
        assert_eq!(dcode.ops[0], Operand::Imm(0x1000 - 2));
    }

    #[test]
    fn test_delay_slot_flag() {
        let isa = IsaOptions::default();
        let dcode = predecode(wide(0x0c, 0x20, 0, 0, 4), 0x100, &isa);
        assert!(dcode.has_delay_slot());

        let mut no_delay = IsaOptions::default();
        no_delay.delay_slots_enabled = false;
        let dcode = predecode(wide(0x0c, 0x20, 0, 0, 4), 0x100, &no_delay);
        assert_eq!(dcode.kind, OpKind::Illegal);
    }

    #[test]
    fn test_mpy_gated_by_option() {
        let isa = IsaOptions::default();
        assert_eq!(predecode(wide(0x08, 1, 2, 3, 0), 0, &isa).kind, OpKind::Mpy);

        let mut no_mpy = IsaOptions::default();
        no_mpy.mpy_enabled = false;
        assert_eq!(
            predecode(wide(0x08, 1, 2, 3, 0), 0, &no_mpy).kind,
            OpKind::Illegal
        );
    }

    #[test]
    fn test_eia_requires_registration() {
        let mut isa = IsaOptions::default();
        assert_eq!(predecode(wide(0x16, 1, 2, 5, 0), 0, &isa).kind, OpKind::Illegal);

        isa.eia_subops.insert(5, 0);
        let dcode = predecode(wide(0x16, 1, 2, 5, 0), 0, &isa);
        assert_eq!(dcode.kind, OpKind::Eia);
        assert_eq!(dcode.eia, Some(0));
    }

    #[test]
    fn test_reserved_major_is_illegal() {
        let isa = IsaOptions::default();
        let dcode = predecode(wide(0x1a, 0, 0, 0, 0), 0, &isa);
        assert_eq!(dcode.kind, OpKind::Illegal);
    }

    #[test]
    fn test_predecode_is_pure() {
        let isa = IsaOptions::default();
        let parcels = wide(0x01, 2, 1, 4, 0);
        let a = predecode(parcels, 0x200, &isa);
        let b = predecode(parcels, 0x200, &isa);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.ops, b.ops);
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.len, b.len);
    }
}
