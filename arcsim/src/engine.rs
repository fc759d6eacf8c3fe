//! The engine: the public face of one simulator instance
//!
//! An [`Engine`] is an owned value (no process-wide registry): it holds the
//! guest core's dispatcher, the shared translation state and the worker
//! pool, and tears all of it down on drop. Thread-safe control crosses
//! through [`EngineControl`] and the instrumentation manager; everything
//! else is externally synchronized through `&mut self`.

use crate::cpu::{Processor, RunExit, SimCounters, StepState};
use crate::eia::EiaRegistry;
use crate::invalidate::{CommandQueue, Invalidator};
use crate::ipt::IptManager;
use crate::loader;
use crate::loader::LoadError;
use crate::mem::GuestMemory;
use crate::options::{ConfigError, IsaOptions, SimOptions, SimToggle};
use crate::pipeline::{PipelineModel, ScalarPipeline};
use crate::translate::{TmArena, TraceBackend, TranslateQueue, TranslationCache, WorkerPool};
use sim_types::{CounterId, GuestAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Engine {
    proc: Processor,
    queue: Arc<TranslateQueue>,
    workers: Option<WorkerPool>,
    ipt: Arc<IptManager>,
    invalidator: Arc<Invalidator>,
    stop: Arc<AtomicBool>,
}

impl Engine {
    /// Creates a simulator with the default pipeline model and no
    /// extension instructions.
    pub fn new(opts: SimOptions) -> Result<Engine, ConfigError> {
        Engine::with_extensions(opts, EiaRegistry::new())
    }

    /// Creates a simulator with embedder-supplied extension instructions.
    pub fn with_extensions(opts: SimOptions, eia: EiaRegistry) -> Result<Engine, ConfigError> {
        opts.validate()?;
        for (&subop, &index) in &opts.isa.eia_subops {
            if index as usize >= eia.len() {
                return Err(ConfigError::InvalidOption(format!(
                    "extension sub-opcode {subop:#x} maps to unregistered instruction {index}"
                )));
            }
        }

        let tc = Arc::new(TranslationCache::new(
            opts.max_live_modules,
            opts.isa.fingerprint(),
        ));
        let arena = Arc::new(TmArena::new());
        let queue = Arc::new(TranslateQueue::new(opts.queue_capacity));
        let commands = Arc::new(CommandQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let invalidator = Arc::new(Invalidator::new(
            tc.clone(),
            arena.clone(),
            commands.clone(),
        ));
        let ipt = Arc::new(IptManager::new(tc.clone(), invalidator.clone()));
        let eia = Arc::new(eia);
        let backend = Arc::new(TraceBackend::new(eia.clone()));
        let workers = WorkerPool::spawn(
            opts.workers,
            queue.clone(),
            tc.clone(),
            arena.clone(),
            commands.clone(),
            backend,
        );
        let pipeline: Box<dyn PipelineModel> = Box::new(ScalarPipeline::default());
        let proc = Processor::new(
            opts,
            pipeline,
            eia,
            tc,
            arena,
            queue.clone(),
            ipt.clone(),
            commands,
            stop.clone(),
        );

        Ok(Engine {
            proc,
            queue,
            workers: Some(workers),
            ipt,
            invalidator,
            stop,
        })
    }

    /// The instrumentation manager. Callable from any thread.
    pub fn ipt(&self) -> Arc<IptManager> {
        self.ipt.clone()
    }

    /// A cloneable, thread-safe control handle.
    pub fn control(&self) -> EngineControl {
        EngineControl {
            invalidator: self.invalidator.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Executes one dispatch step.
    pub fn step(&mut self) -> StepState {
        self.proc.step()
    }

    /// Executes until halt, stop, fatal, or an instrumentation subscriber
    /// demands control.
    pub fn run(&mut self) -> RunExit {
        self.proc.run()
    }

    pub fn counter(&self, id: CounterId) -> u64 {
        self.proc.counters.get(id)
    }

    pub fn counters(&self) -> &SimCounters {
        &self.proc.counters
    }

    pub fn pc(&self) -> GuestAddr {
        self.proc.cpu.pc
    }

    pub fn set_pc(&mut self, pc: GuestAddr) {
        self.proc.cpu.pc = pc;
    }

    pub fn reg(&self, index: u8) -> u32 {
        self.proc.cpu.reg(index)
    }

    pub fn set_reg(&mut self, index: u8, value: u32) {
        self.proc.cpu.set_reg(index, value);
    }

    pub fn halted(&self) -> bool {
        self.proc.cpu.halted
    }

    /// Read access to the full architectural state.
    pub fn cpu_state(&self) -> &crate::cpu::CpuState {
        &self.proc.cpu
    }

    /// Direct guest-memory access for embedders and tests. Writes made
    /// here behave like guest writes, invalidation included.
    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.proc.mem
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.proc.mem
    }

    pub fn options(&self) -> &SimOptions {
        self.proc.options()
    }

    /// Loads a raw binary image at `base` and points the PC at it.
    pub fn load_binary_image(&mut self, path: &Path, base: GuestAddr) -> Result<(), LoadError> {
        let entry = loader::load_binary_image(&mut self.proc.mem, path, base)?;
        self.proc.cpu.pc = entry;
        Ok(())
    }

    /// Loads an Intel-HEX image; the PC moves to the recorded start
    /// address when the image carries one.
    pub fn load_hex_image(&mut self, path: &Path) -> Result<(), LoadError> {
        if let Some(entry) = loader::load_hex_image(&mut self.proc.mem, path)? {
            self.proc.cpu.pc = entry;
        }
        Ok(())
    }

    /// Loads an ELF32 executable and points the PC at its entry.
    pub fn load_elf_image(&mut self, path: &Path) -> Result<(), LoadError> {
        let entry = loader::load_elf_image(&mut self.proc.mem, path)?;
        self.proc.cpu.pc = entry;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(pool) = self.workers.take() {
            pool.shutdown(&self.queue);
        }
    }
}

/// Thread-safe simulator control: option toggles and the stop request.
/// Every operation takes effect at the dispatcher's next block boundary.
#[derive(Clone)]
pub struct EngineControl {
    invalidator: Arc<Invalidator>,
    stop: Arc<AtomicBool>,
}

impl EngineControl {
    /// Requests that the dispatcher return at the next block boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn set_toggle(&self, toggle: SimToggle, on: bool) {
        self.invalidator.toggle(toggle, on);
    }

    pub fn set_debug(&self, on: bool) {
        self.set_toggle(SimToggle::Debug, on);
    }

    pub fn set_fast(&self, on: bool) {
        self.set_toggle(SimToggle::Fast, on);
    }

    pub fn set_cosim(&self, on: bool) {
        self.set_toggle(SimToggle::Cosim, on);
    }

    pub fn set_memory_model(&self, on: bool) {
        self.set_toggle(SimToggle::MemoryModel, on);
    }

    pub fn set_cycle_accurate(&self, on: bool) {
        self.set_toggle(SimToggle::CycleAccurate, on);
    }

    pub fn set_trace(&self, on: bool) {
        self.set_toggle(SimToggle::Trace, on);
    }

    pub fn set_verbose(&self, on: bool) {
        self.set_toggle(SimToggle::Verbose, on);
    }

    pub fn set_emulate_traps(&self, on: bool) {
        self.set_toggle(SimToggle::EmulateTraps, on);
    }

    /// Replaces the ISA option set; every decode- and translation-derived
    /// cache is flushed when this lands.
    pub fn set_isa_options(&self, isa: IsaOptions) {
        self.invalidator.isa_changed(isa);
    }
}
