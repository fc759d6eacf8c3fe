//! Guest trap records
//!
//! Traps are simulation state, not host errors: they never cross the public
//! API as `Err` values. The dispatcher converts them into guest-visible
//! behaviour (or, with trap emulation enabled, handles them itself).

use sim_types::GuestAddr;
use std::fmt;

/// A guest-originated fault raised during fetch, decode or execution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trap {
    /// Access to an unmapped guest address.
    MemoryFault { addr: GuestAddr, write: bool },
    /// The bytes at `pc` do not decode under the current ISA options.
    IllegalInstruction { pc: GuestAddr },
    /// A privileged operation was attempted from user state.
    PrivilegeViolation { pc: GuestAddr },
    /// An explicit `trap` instruction.
    UserTrap { pc: GuestAddr, cause: u32 },
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::MemoryFault { addr, write: true } => {
                write!(f, "memory fault on write to {addr:#010x}")
            }
            Trap::MemoryFault { addr, write: false } => {
                write!(f, "memory fault on read from {addr:#010x}")
            }
            Trap::IllegalInstruction { pc } => write!(f, "illegal instruction at {pc:#010x}"),
            Trap::PrivilegeViolation { pc } => write!(f, "privilege violation at {pc:#010x}"),
            Trap::UserTrap { pc, cause } => write!(f, "trap {cause} at {pc:#010x}"),
        }
    }
}
