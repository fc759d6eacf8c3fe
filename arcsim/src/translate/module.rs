//! Translation modules and the compiler backend
//!
//! A [`TranslationModule`] is the produced native artifact for one page's
//! hot blocks: per-block entry functions plus the metadata the cache needs
//! to publish and later retire them. The backend contract is deliberately
//! thin (a work unit goes in, a module with an entry-function table comes
//! out) so that the compilation strategy can be swapped without touching
//! the pipeline.
//!
//! The shipped [`TraceBackend`] compiles in-process: each block's Dcode
//! sequence is lowered to a pre-bound straight-line execution sequence with
//! per-instruction handler pointers and pre-resolved PCs, entered through a
//! single boxed function. No per-instruction dispatch, decode or cache
//! lookup remains on the entered path.

use super::work_unit::TranslationWorkUnit;
use crate::cpu::exec::{ExecFn, ExecOutcome, EXEC_TABLE};
use crate::cpu::state::CpuState;
use crate::eia::EiaRegistry;
use crate::isa::dcode::Dcode;
use crate::isa::OpKind;
use crate::mem::GuestMemory;
use crate::trap::Trap;
use sim_types::{GuestAddr, OptionFingerprint, PageFrame};
use std::sync::Arc;
use thiserror::Error;

/// Why a native entry returned to the dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NativeStop {
    /// The block ended; the continuation PC has no entry in this trace.
    BranchUncompiled,
    /// An interrupt needs servicing.
    Irq,
    /// A guest trap was raised; the trap record is on the CPU state.
    Trap,
    /// Instrumentation demands the slow path.
    InstrumentationDemand,
    /// The execution quantum ended (including guest halt).
    QuantumExpired,
}

/// Result of running one native entry.
#[derive(Clone, Copy, Debug)]
pub struct NativeExit {
    /// PC at which native execution stopped.
    pub next_pc: GuestAddr,
    /// Instructions retired inside the entry.
    pub retired: u64,
    pub stop: NativeStop,
}

/// A compiled block entry function.
pub type NativeEntryFn = Box<dyn Fn(&mut CpuState, &mut GuestMemory) -> NativeExit + Send + Sync>;

/// One lowered instruction: resolved PC, handler, decoded form.
type TraceStep = (GuestAddr, ExecFn, Dcode);

/// One block's native entry plus the metadata needed for publish and
/// retirement.
pub struct TmEntry {
    pub start: GuestAddr,
    pub len_bytes: u32,
    pub insts: u32,
    pub exec: NativeEntryFn,
}

/// A loaded native artifact: the entry table for one page's hot blocks.
/// Owns its compiled code; the translation cache refers to it only through
/// an arena handle.
pub struct TranslationModule {
    page: PageFrame,
    fingerprint: OptionFingerprint,
    entries: Vec<TmEntry>,
}

impl TranslationModule {
    pub fn new(page: PageFrame, fingerprint: OptionFingerprint, entries: Vec<TmEntry>) -> Self {
        TranslationModule {
            page,
            fingerprint,
            entries,
        }
    }

    pub fn page(&self) -> PageFrame {
        self.page
    }

    pub fn fingerprint(&self) -> OptionFingerprint {
        self.fingerprint
    }

    pub fn entries(&self) -> &[TmEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u32) -> Option<&TmEntry> {
        self.entries.get(index as usize)
    }
}

/// Translation failures. Logged and swallowed by the worker; the affected
/// blocks simply stay interpreted.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("compiler invocation failed: {0}")]
    CompilerInvokeFailed(String),
    #[error("loading compiled artifact failed: {0}")]
    LoaderFailed(String),
}

/// The backend contract: lower a work unit into a module with an
/// entry-function table.
pub trait TranslationBackend: Send + Sync {
    fn compile(&self, unit: &TranslationWorkUnit) -> Result<TranslationModule, TranslateError>;
}

/// The in-process backend.
pub struct TraceBackend {
    eia: Arc<EiaRegistry>,
}

impl TraceBackend {
    pub fn new(eia: Arc<EiaRegistry>) -> Self {
        TraceBackend { eia }
    }

    fn compile_block(
        &self,
        start: GuestAddr,
        dcodes: &[Dcode],
    ) -> Result<TmEntry, TranslateError> {
        if dcodes.is_empty() {
            return Err(TranslateError::CompilerInvokeFailed(format!(
                "empty block at {start:#010x}"
            )));
        }
        if dcodes.iter().any(|d| d.kind == OpKind::Illegal) {
            return Err(TranslateError::CompilerInvokeFailed(format!(
                "illegal instruction in block at {start:#010x}"
            )));
        }

        // pre-resolve the per-instruction PC and handler; the entered path
        // runs the sequence without any further dispatch
        let mut pc = start;
        let mut trace: Vec<TraceStep> = Vec::with_capacity(dcodes.len());
        for dcode in dcodes {
            trace.push((pc, EXEC_TABLE[dcode.exec as usize], *dcode));
            pc = pc.wrapping_add(dcode.len as u32);
        }
        let end_pc = pc;
        let len_bytes = end_pc.wrapping_sub(start);
        let insts = dcodes.len() as u32;
        let eia = self.eia.clone();

        let exec: NativeEntryFn = Box::new(move |cpu, mem| {
            let mut retired = 0u64;
            let mut index = 0usize;
            while index < trace.len() {
                let (pc, handler, dcode) = &trace[index];
                cpu.pc = *pc;
                match handler(cpu, mem, &eia, dcode) {
                    Err(trap) => {
                        cpu.pending_trap = Some(trap);
                        return NativeExit {
                            next_pc: *pc,
                            retired,
                            stop: NativeStop::Trap,
                        };
                    }
                    Ok(ExecOutcome::Next) => {
                        retired += 1;
                        cpu.icount += 1;
                        index += 1;
                    }
                    Ok(ExecOutcome::NotTaken) => {
                        retired += 1;
                        cpu.icount += 1;
                        return NativeExit {
                            next_pc: pc.wrapping_add(dcode.len as u32),
                            retired,
                            stop: NativeStop::BranchUncompiled,
                        };
                    }
                    Ok(ExecOutcome::Taken(target)) => {
                        retired += 1;
                        cpu.icount += 1;
                        if dcode.has_delay_slot() {
                            if index + 1 >= trace.len() {
                                // the snapshot ended at the branch (bounds
                                // recorded from a not-taken pass); defer
                                // the redirect and let the dispatcher
                                // retire the slot instruction
                                cpu.delay_target = Some(target);
                                return NativeExit {
                                    next_pc: pc.wrapping_add(dcode.len as u32),
                                    retired,
                                    stop: NativeStop::BranchUncompiled,
                                };
                            }
                            match Self::run_delay_slot(cpu, mem, &eia, &trace, index) {
                                Ok(()) => retired += 1,
                                Err(exit_pc) => {
                                    return NativeExit {
                                        next_pc: exit_pc,
                                        retired,
                                        stop: NativeStop::Trap,
                                    }
                                }
                            }
                        }
                        return NativeExit {
                            next_pc: target,
                            retired,
                            stop: NativeStop::BranchUncompiled,
                        };
                    }
                    Ok(ExecOutcome::Halt) => {
                        retired += 1;
                        cpu.icount += 1;
                        return NativeExit {
                            next_pc: pc.wrapping_add(dcode.len as u32),
                            retired,
                            stop: NativeStop::QuantumExpired,
                        };
                    }
                }
            }
            NativeExit {
                next_pc: end_pc,
                retired,
                stop: NativeStop::BranchUncompiled,
            }
        });

        Ok(TmEntry {
            start,
            len_bytes,
            insts,
            exec,
        })
    }

    /// Executes the delay-slot instruction following a taken branch.
    /// Returns `Err(pc)` when the slot trapped (trap record already on the
    /// CPU state).
    fn run_delay_slot(
        cpu: &mut CpuState,
        mem: &mut GuestMemory,
        eia: &EiaRegistry,
        trace: &[TraceStep],
        branch_index: usize,
    ) -> Result<(), GuestAddr> {
        let (pc, handler, dcode) = &trace[branch_index + 1];
        cpu.pc = *pc;
        if dcode.is_branch() {
            cpu.pending_trap = Some(Trap::IllegalInstruction { pc: *pc });
            return Err(*pc);
        }
        match handler(cpu, mem, eia, dcode) {
            Ok(_) => {
                cpu.icount += 1;
                Ok(())
            }
            Err(trap) => {
                cpu.pending_trap = Some(trap);
                Err(*pc)
            }
        }
    }
}

impl TranslationBackend for TraceBackend {
    fn compile(&self, unit: &TranslationWorkUnit) -> Result<TranslationModule, TranslateError> {
        if unit.blocks.is_empty() {
            return Err(TranslateError::CompilerInvokeFailed(format!(
                "empty work unit for {}",
                unit.page
            )));
        }
        let mut entries = Vec::with_capacity(unit.blocks.len());
        for block in &unit.blocks {
            entries.push(self.compile_block(block.start, &block.dcodes)?);
        }
        Ok(TranslationModule::new(unit.page, unit.fingerprint, entries))
    }
}
