//! Table-driven interpreter
//!
//! One handler per [`OpKind`], dispatched through a flat function table
//! indexed by the Dcode's dispatch index. Handlers never advance the PC;
//! control-flow effects are reported through [`ExecOutcome`] and applied by
//! the dispatch loop, which is what keeps delay-slot and block-boundary
//! handling in one place.

use super::state::CpuState;
use crate::eia::EiaRegistry;
use crate::isa::dcode::Dcode;
use crate::isa::{Cond, OpKind, Operand, BLINK, OP_KIND_COUNT};
use crate::mem::GuestMemory;
use crate::trap::Trap;
use sim_types::GuestAddr;

/// Control-flow effect of one executed instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecOutcome {
    /// Fall through to the next instruction.
    Next,
    /// Branch taken; the dispatcher applies the target (possibly after a
    /// delay slot).
    Taken(GuestAddr),
    /// Conditional branch not taken. Still closes the block.
    NotTaken,
    /// The guest halted.
    Halt,
}

pub type ExecFn =
    fn(&mut CpuState, &mut GuestMemory, &EiaRegistry, &Dcode) -> Result<ExecOutcome, Trap>;

/// Executes one decoded instruction.
#[inline]
pub fn execute(
    cpu: &mut CpuState,
    mem: &mut GuestMemory,
    eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    EXEC_TABLE[dcode.exec as usize](cpu, mem, eia, dcode)
}

/// Dispatch table; row order must match the [`OpKind`] discriminants.
pub static EXEC_TABLE: [ExecFn; OP_KIND_COUNT] = [
    exec_nop,     // Nop
    exec_mov,     // Mov
    exec_alu,     // Add
    exec_alu,     // Sub
    exec_alu,     // And
    exec_alu,     // Or
    exec_alu,     // Xor
    exec_alu,     // Asl
    exec_alu,     // Lsr
    exec_alu,     // Mpy
    exec_cmp,     // Cmp
    exec_ld,      // Ld
    exec_st,      // St
    exec_b,       // B
    exec_bl,      // Bl
    exec_bcc,     // Bcc
    exec_brcc,    // Brcc
    exec_j,       // J
    exec_jl,      // Jl
    exec_lr,      // Lr
    exec_sr,      // Sr
    exec_trap,    // Trap
    exec_flag,    // Flag
    exec_brk,     // Brk
    exec_eia,     // Eia
    exec_illegal, // Illegal
];

#[inline]
fn write_dest(cpu: &mut CpuState, dest: Operand, value: u32) {
    if let Operand::Reg(r) = dest {
        cpu.set_reg(r, value);
    }
}

fn exec_nop(
    _cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    _dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    Ok(ExecOutcome::Next)
}

fn exec_mov(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let value = cpu.operand_value(dcode.ops[1]);
    write_dest(cpu, dcode.ops[0], value);
    Ok(ExecOutcome::Next)
}

fn exec_alu(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let lhs = cpu.operand_value(dcode.ops[1]);
    let rhs = cpu.operand_value(dcode.ops[2]);
    let value = match dcode.kind {
        OpKind::Add => lhs.wrapping_add(rhs),
        OpKind::Sub => lhs.wrapping_sub(rhs),
        OpKind::And => lhs & rhs,
        OpKind::Or => lhs | rhs,
        OpKind::Xor => lhs ^ rhs,
        OpKind::Asl => lhs.wrapping_shl(rhs & 31),
        OpKind::Lsr => lhs.wrapping_shr(rhs & 31),
        OpKind::Mpy => lhs.wrapping_mul(rhs),
        _ => unreachable!("non-ALU kind routed to exec_alu"),
    };
    write_dest(cpu, dcode.ops[0], value);
    Ok(ExecOutcome::Next)
}

fn exec_cmp(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let lhs = cpu.operand_value(dcode.ops[0]);
    let rhs = cpu.operand_value(dcode.ops[1]);
    cpu.set_flags_sub(lhs, rhs);
    Ok(ExecOutcome::Next)
}

fn exec_ld(
    cpu: &mut CpuState,
    mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let base = cpu.operand_value(dcode.ops[1]);
    let offset = cpu.operand_value(dcode.ops[2]);
    let value = mem.read(base.wrapping_add(offset), 4)?;
    write_dest(cpu, dcode.ops[0], value);
    Ok(ExecOutcome::Next)
}

fn exec_st(
    cpu: &mut CpuState,
    mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let value = cpu.operand_value(dcode.ops[0]);
    let base = cpu.operand_value(dcode.ops[1]);
    let offset = cpu.operand_value(dcode.ops[2]);
    mem.write(base.wrapping_add(offset), 4, value)?;
    Ok(ExecOutcome::Next)
}

fn exec_b(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[0])))
}

fn exec_bl(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    cpu.set_reg(BLINK, cpu.pc.wrapping_add(dcode.len as u32));
    Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[0])))
}

fn exec_bcc(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    if dcode.cond.holds(cpu.z, cpu.n, cpu.c, cpu.v) {
        Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[0])))
    } else {
        Ok(ExecOutcome::NotTaken)
    }
}

fn exec_brcc(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let lhs = cpu.operand_value(dcode.ops[0]);
    let rhs = cpu.operand_value(dcode.ops[1]);
    let taken = match dcode.cond {
        Cond::Eq => lhs == rhs,
        Cond::Ne => lhs != rhs,
        _ => unreachable!("brcc decodes only eq/ne"),
    };
    if taken {
        Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[2])))
    } else {
        Ok(ExecOutcome::NotTaken)
    }
}

fn exec_j(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[0]) & !1))
}

fn exec_jl(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    cpu.set_reg(BLINK, cpu.pc.wrapping_add(dcode.len as u32));
    Ok(ExecOutcome::Taken(cpu.operand_value(dcode.ops[0]) & !1))
}

fn exec_lr(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let Operand::Aux(number) = dcode.ops[1] else {
        return Err(Trap::IllegalInstruction { pc: cpu.pc });
    };
    let value = cpu.aux_read(number)?;
    write_dest(cpu, dcode.ops[0], value);
    Ok(ExecOutcome::Next)
}

fn exec_sr(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let Operand::Aux(number) = dcode.ops[1] else {
        return Err(Trap::IllegalInstruction { pc: cpu.pc });
    };
    let value = cpu.operand_value(dcode.ops[0]);
    cpu.aux_write(number, value)?;
    if cpu.halted {
        return Ok(ExecOutcome::Halt);
    }
    Ok(ExecOutcome::Next)
}

fn exec_trap(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    Err(Trap::UserTrap {
        pc: cpu.pc,
        cause: cpu.operand_value(dcode.ops[0]),
    })
}

fn exec_flag(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    if cpu.operand_value(dcode.ops[0]) & 1 != 0 {
        cpu.halted = true;
        return Ok(ExecOutcome::Halt);
    }
    Ok(ExecOutcome::Next)
}

fn exec_brk(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    _dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    cpu.halted = true;
    Ok(ExecOutcome::Halt)
}

fn exec_eia(
    cpu: &mut CpuState,
    mem: &mut GuestMemory,
    eia: &EiaRegistry,
    dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    let Some(index) = dcode.eia else {
        return Err(Trap::IllegalInstruction { pc: cpu.pc });
    };
    eia.execute(index, cpu, mem, dcode)?;
    Ok(ExecOutcome::Next)
}

fn exec_illegal(
    cpu: &mut CpuState,
    _mem: &mut GuestMemory,
    _eia: &EiaRegistry,
    _dcode: &Dcode,
) -> Result<ExecOutcome, Trap> {
    Err(Trap::IllegalInstruction { pc: cpu.pc })
}
