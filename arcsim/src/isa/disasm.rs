//! Instruction disassembly
//!
//! `Display` for [`Dcode`], used by the trace option and test output.

use super::dcode::Dcode;
use super::{Cond, OpKind, Operand};
use std::fmt;

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => write!(f, "_"),
            Operand::Reg(r) => write!(f, "r{r}"),
            Operand::Imm(i) => {
                if *i < 0 || *i > 9 {
                    write!(f, "{:#x}", *i as u32)
                } else {
                    write!(f, "{i}")
                }
            }
            Operand::Aux(a) => write!(f, "aux[{a:#x}]"),
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cond::Al => "",
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Ltu => "lo",
            Cond::Geu => "hs",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Dcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delay = if self.has_delay_slot() { ".d" } else { "" };
        match self.kind {
            OpKind::Nop => write!(f, "nop"),
            OpKind::Brk => write!(f, "brk"),
            OpKind::Illegal => write!(f, "<illegal>"),
            OpKind::Mov => write!(f, "mov {}, {}", self.ops[0], self.ops[1]),
            OpKind::Cmp => write!(f, "cmp {}, {}", self.ops[0], self.ops[1]),
            OpKind::Add | OpKind::Sub | OpKind::And | OpKind::Or | OpKind::Xor
            | OpKind::Asl | OpKind::Lsr | OpKind::Mpy => {
                let mnemonic = match self.kind {
                    OpKind::Add => "add",
                    OpKind::Sub => "sub",
                    OpKind::And => "and",
                    OpKind::Or => "or",
                    OpKind::Xor => "xor",
                    OpKind::Asl => "asl",
                    OpKind::Lsr => "lsr",
                    _ => "mpy",
                };
                write!(f, "{mnemonic} {}, {}, {}", self.ops[0], self.ops[1], self.ops[2])
            }
            OpKind::Ld => write!(f, "ld {}, [{}, {}]", self.ops[0], self.ops[1], self.ops[2]),
            OpKind::St => write!(f, "st {}, [{}, {}]", self.ops[0], self.ops[1], self.ops[2]),
            OpKind::B => write!(f, "b{delay} {}", self.ops[0]),
            OpKind::Bl => write!(f, "bl{delay} {}", self.ops[0]),
            OpKind::Bcc => write!(f, "b{}{delay} {}", self.cond, self.ops[0]),
            OpKind::Brcc => write!(
                f,
                "br{}{delay} {}, {}, {}",
                self.cond, self.ops[0], self.ops[1], self.ops[2]
            ),
            OpKind::J => write!(f, "j{delay} [{}]", self.ops[0]),
            OpKind::Jl => write!(f, "jl{delay} [{}]", self.ops[0]),
            OpKind::Lr => write!(f, "lr {}, {}", self.ops[0], self.ops[1]),
            OpKind::Sr => write!(f, "sr {}, {}", self.ops[0], self.ops[1]),
            OpKind::Trap => write!(f, "trap {}", self.ops[0]),
            OpKind::Flag => write!(f, "flag {}", self.ops[0]),
            OpKind::Eia => write!(
                f,
                "ext{} {}, {}",
                self.eia.unwrap_or(0),
                self.ops[0],
                self.ops[1]
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::dcode::{predecode, Parcels};
    use crate::options::IsaOptions;

    fn decode(p0: u16, p1: u16) -> Dcode {
        predecode(Parcels { p0, p1, limm: 0 }, 0x1000, &IsaOptions::default())
    }

    #[test]
    fn test_display_forms() {
        // add r2, r1, r4
        let add = decode((0x01 << 11) | (2 << 5) | 1, 4 << 10);
        assert_eq!(add.to_string(), "add r2, r1, r4");

        // b.d +4 halfwords from 0x1000
        let branch = decode((0x0c << 11) | (0x20 << 5), 4);
        assert_eq!(branch.to_string(), "b.d 0x1008");

        // nop_s
        assert_eq!(decode(0xf000, 0).to_string(), "nop");
    }
}
