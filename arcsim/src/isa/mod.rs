//! The guest instruction set
//!
//! The simulated target is a 32-bit RISC machine in the ARC mould:
//! little-endian 16-bit instruction parcels, a 16-bit compact encoding
//! alongside the full 32-bit one, an optional trailing 32-bit long
//! immediate, branches with optional delay slots, and an auxiliary register
//! file addressed by dedicated `lr`/`sr` instructions.
//!
//! [`dcode::Dcode`] is the predecoded form of one instruction;
//! [`dcode_cache::DcodeCache`] memoizes predecode results per PC.

pub mod dcode;
pub mod dcode_cache;
pub mod disasm;

use bitflags::bitflags;

/// Register index of the link register written by `bl`/`jl`.
pub const BLINK: u8 = 31;

/// Auxiliary register numbers the core knows about.
pub mod aux {
    /// Combined status word: condition flags and halt bit.
    pub const STATUS32: u16 = 0x0a;
    /// Free-running instruction count, read-only.
    pub const ICOUNT: u16 = 0x21;
}

/// Semantic classification of an instruction, doubling as the
/// interpreter's dispatch index (see `cpu::exec::EXEC_TABLE`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum OpKind {
    Nop = 0,
    Mov,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Asl,
    Lsr,
    Mpy,
    Cmp,
    Ld,
    St,
    B,
    Bl,
    Bcc,
    Brcc,
    J,
    Jl,
    Lr,
    Sr,
    Trap,
    Flag,
    Brk,
    Eia,
    Illegal,
}

/// Number of [`OpKind`] variants; the interpreter table has this many rows.
pub const OP_KIND_COUNT: usize = OpKind::Illegal as usize + 1;

/// One operand descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Operand {
    #[default]
    None,
    /// Core register r0..r31.
    Reg(u8),
    /// Immediate, sign-extended at decode time. Long immediates and
    /// decode-resolved branch targets also land here.
    Imm(i32),
    /// Auxiliary register number.
    Aux(u16),
}

bitflags! {
    /// Semantic flags attached to a decoded instruction.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DcodeFlags: u16 {
        /// Decode resolved a PC-relative target.
        const READS_PC = 1 << 0;
        /// Execution may redirect control flow.
        const WRITES_PC = 1 << 1;
        /// Ends a basic block.
        const IS_BRANCH = 1 << 2;
        /// The following instruction executes before the branch takes
        /// effect.
        const HAS_DELAY_SLOT = 1 << 3;
        /// Loads or stores guest memory.
        const IS_MEMORY = 1 << 4;
        /// A 32-bit long immediate follows the instruction word.
        const HAS_LONG_IMM = 1 << 5;
    }
}

/// Branch condition codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum Cond {
    #[default]
    Al = 0,
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
    Gt,
    Le,
    Mi,
    Pl,
}

impl Cond {
    pub fn from_field(field: u8) -> Option<Cond> {
        Some(match field {
            0 => Cond::Al,
            1 => Cond::Eq,
            2 => Cond::Ne,
            3 => Cond::Lt,
            4 => Cond::Ge,
            5 => Cond::Ltu,
            6 => Cond::Geu,
            7 => Cond::Gt,
            8 => Cond::Le,
            9 => Cond::Mi,
            10 => Cond::Pl,
            _ => return None,
        })
    }

    /// Evaluates the condition against the current flag state.
    pub fn holds(&self, z: bool, n: bool, c: bool, v: bool) -> bool {
        match self {
            Cond::Al => true,
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Lt => n != v,
            Cond::Ge => n == v,
            Cond::Ltu => c,
            Cond::Geu => !c,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            Cond::Mi => n,
            Cond::Pl => !n,
        }
    }
}
