//! EIA user-extension instructions
//!
//! Embedders can plug extension instructions into the extension major
//! opcode. Registration produces the sub-opcode → registry-index map the
//! decoder consults (part of the ISA options, hence of the option
//! fingerprint); execution dispatches through the registry.

use crate::cpu::state::CpuState;
use crate::isa::dcode::Dcode;
use crate::mem::GuestMemory;
use crate::trap::Trap;
use std::sync::Arc;

/// One extension instruction supplied by the embedder.
pub trait EiaInstruction: Send + Sync {
    fn name(&self) -> &str;

    /// Executes the instruction. The Dcode carries the destination and
    /// source operands decoded from the extension encoding.
    fn execute(
        &self,
        cpu: &mut CpuState,
        mem: &mut GuestMemory,
        dcode: &Dcode,
    ) -> Result<(), Trap>;
}

/// Registry of extension instructions, indexed by the value stored in
/// `Dcode::eia`.
#[derive(Default, Clone)]
pub struct EiaRegistry {
    insts: Vec<Arc<dyn EiaInstruction>>,
}

impl EiaRegistry {
    pub fn new() -> Self {
        EiaRegistry::default()
    }

    /// Adds an instruction and returns its registry index.
    pub fn register(&mut self, inst: Arc<dyn EiaInstruction>) -> u16 {
        self.insts.push(inst);
        (self.insts.len() - 1) as u16
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn execute(
        &self,
        index: u16,
        cpu: &mut CpuState,
        mem: &mut GuestMemory,
        dcode: &Dcode,
    ) -> Result<(), Trap> {
        match self.insts.get(index as usize) {
            Some(inst) => inst.execute(cpu, mem, dcode),
            None => Err(Trap::IllegalInstruction { pc: cpu.pc }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{OpKind, Operand};

    struct DoubleReg;

    impl EiaInstruction for DoubleReg {
        fn name(&self) -> &str {
            "dbl"
        }

        fn execute(
            &self,
            cpu: &mut CpuState,
            _mem: &mut GuestMemory,
            dcode: &Dcode,
        ) -> Result<(), Trap> {
            if let (Operand::Reg(dest), Operand::Reg(src)) = (dcode.ops[0], dcode.ops[1]) {
                let value = cpu.reg(src);
                cpu.set_reg(dest, value.wrapping_mul(2));
            }
            Ok(())
        }
    }

    fn eia_dcode(index: u16) -> Dcode {
        let mut dcode = crate::isa::dcode::predecode(
            crate::isa::dcode::Parcels { p0: 0xf000, p1: 0, limm: 0 },
            0,
            &crate::options::IsaOptions::default(),
        );
        dcode.kind = OpKind::Eia;
        dcode.eia = Some(index);
        dcode.ops = [Operand::Reg(1), Operand::Reg(2), Operand::None];
        dcode
    }

    #[test]
    fn test_registered_instruction_executes() {
        let mut registry = EiaRegistry::new();
        let index = registry.register(Arc::new(DoubleReg));
        let mut cpu = CpuState::new();
        let mut mem = GuestMemory::new();
        cpu.set_reg(2, 21);

        registry
            .execute(index, &mut cpu, &mut mem, &eia_dcode(index))
            .unwrap();
        assert_eq!(cpu.reg(1), 42);
    }

    #[test]
    fn test_unknown_index_is_illegal() {
        let registry = EiaRegistry::new();
        let mut cpu = CpuState::new();
        cpu.pc = 0x300;
        let mut mem = GuestMemory::new();
        assert_eq!(
            registry.execute(9, &mut cpu, &mut mem, &eia_dcode(9)),
            Err(Trap::IllegalInstruction { pc: 0x300 })
        );
    }
}
