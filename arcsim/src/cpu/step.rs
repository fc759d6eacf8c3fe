//! The dispatch loop
//!
//! Per simulated step the dispatcher chooses between entering published
//! native code, interpreting a decoded instruction, or decoding. All
//! cross-thread coherence lands at block boundaries: the command queue is
//! drained, dirty code pages are invalidated, the instrumentation snapshot
//! is refreshed and the observed translation epoch is advanced before a
//! new block is entered.
//!
//! Callback ordering within a block is BeginBasicBlock, then per
//! instruction BeginInstructionExecution, then AboutToExecuteInstruction.

use super::exec::{self, ExecOutcome};
use super::state::CpuState;
use super::SimCounters;
use crate::eia::EiaRegistry;
use crate::invalidate::{Command, CommandQueue};
use crate::ipt::{IptAction, IptEnv, IptManager, IptSnapshot};
use crate::isa::dcode::Dcode;
use crate::isa::dcode_cache::DcodeCache;
use crate::mem::GuestMemory;
use crate::options::SimOptions;
use crate::pipeline::PipelineModel;
use crate::profile::{EntryKind, PhysicalProfile};
use crate::translate::{
    NativeStop, PushOutcome, TmArena, TranslateQueue, TranslationCache, TranslationWorkUnit,
    WorkUnitBlock,
};
use crate::trap::Trap;
use log::{debug, info, trace};
use sim_types::{page_frame, GuestAddr, OptionFingerprint, PageFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Result of one dispatch step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepState {
    Running,
    /// An instrumentation subscriber demanded control.
    Paused,
    Halted,
    /// The stop flag was observed at a block boundary.
    Stopped,
    /// An unrecoverable host condition; the dispatcher will not continue.
    Fatal,
}

/// Why `run` returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunExit {
    Paused,
    Halted,
    Stopped,
    Fatal,
}

/// One guest core's dispatcher and the state it owns outright: the
/// architectural state, memory, the decoded-instruction cache and the
/// physical profile. Shared translation and instrumentation state is
/// reached through `Arc`s.
pub struct Processor {
    pub cpu: CpuState,
    pub mem: GuestMemory,
    pub counters: SimCounters,
    dcache: DcodeCache,
    profile: PhysicalProfile,
    opts: SimOptions,
    fingerprint: OptionFingerprint,
    pipeline: Box<dyn PipelineModel>,
    eia: Arc<EiaRegistry>,

    tc: Arc<TranslationCache>,
    arena: Arc<TmArena>,
    queue: Arc<TranslateQueue>,
    ipt: Arc<IptManager>,
    commands: Arc<CommandQueue>,
    stop: Arc<AtomicBool>,
    observed_epoch: Arc<AtomicU64>,
    snapshot: Arc<IptSnapshot>,

    at_boundary: bool,
    block_start: GuestAddr,
    block_bytes: u32,
    block_insts: u32,
    /// Per-page invalidation generation; stale publishes are refused a
    /// binding by comparing against this.
    page_gens: HashMap<PageFrame, u64>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: SimOptions,
        pipeline: Box<dyn PipelineModel>,
        eia: Arc<EiaRegistry>,
        tc: Arc<TranslationCache>,
        arena: Arc<TmArena>,
        queue: Arc<TranslateQueue>,
        ipt: Arc<IptManager>,
        commands: Arc<CommandQueue>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let observed_epoch = Arc::new(AtomicU64::new(tc.epoch()));
        tc.register_observer(observed_epoch.clone());
        let snapshot = ipt.snapshot();
        let fingerprint = opts.isa.fingerprint();
        Processor {
            cpu: CpuState::new(),
            mem: GuestMemory::new(),
            counters: SimCounters::default(),
            dcache: DcodeCache::new(opts.dcode_cache_slots),
            profile: PhysicalProfile::new(),
            opts,
            fingerprint,
            pipeline,
            eia,
            tc,
            arena,
            queue,
            ipt,
            commands,
            stop,
            observed_epoch,
            snapshot,
            at_boundary: true,
            block_start: 0,
            block_bytes: 0,
            block_insts: 0,
            page_gens: HashMap::new(),
        }
    }

    fn page_generation(&self, frame: PageFrame) -> u64 {
        self.page_gens.get(&frame).copied().unwrap_or(0)
    }

    pub fn options(&self) -> &SimOptions {
        &self.opts
    }

    /// Executes until halt, stop, a fatal condition, or an instrumentation
    /// subscriber demands control.
    pub fn run(&mut self) -> RunExit {
        loop {
            match self.step() {
                StepState::Running => continue,
                StepState::Paused => return RunExit::Paused,
                StepState::Halted => return RunExit::Halted,
                StepState::Stopped => return RunExit::Stopped,
                StepState::Fatal => return RunExit::Fatal,
            }
        }
    }

    /// One dispatch step: at a block boundary this services coherence,
    /// enters the next block and possibly runs a whole native trace;
    /// inside a block it interprets one instruction.
    pub fn step(&mut self) -> StepState {
        if self.cpu.halted {
            return StepState::Halted;
        }

        if self.at_boundary {
            self.service_boundary();
            if self.stop.swap(false, Ordering::AcqRel) {
                return StepState::Stopped;
            }
            if self.tc.is_fatal() {
                return StepState::Fatal;
            }
            self.enter_block();
            if self.cpu.halted {
                return StepState::Halted;
            }
            if let Some(state) = self.try_native() {
                return state;
            }
            self.at_boundary = false;
        }

        self.interpret_one()
    }

    /// Block-boundary bookkeeping: dirty code pages, deferred commands,
    /// epoch observation, instrumentation snapshot refresh.
    fn service_boundary(&mut self) {
        for frame in self.mem.take_dirty_code_pages() {
            self.invalidate_code_page(frame);
        }
        for command in self.commands.drain() {
            self.apply_command(command);
        }
        self.observed_epoch.store(self.tc.epoch(), Ordering::Release);
        self.tc.reclaim();
        self.snapshot = self.ipt.snapshot();
    }

    /// Coherence for a guest write into a page holding decoded code.
    fn invalidate_code_page(&mut self, frame: PageFrame) {
        debug!("code write detected in {frame}, invalidating");
        *self.page_gens.entry(frame).or_insert(0) += 1;
        self.dcache.invalidate_range(frame.base(), frame.limit());
        self.profile.drop_page(frame);
        self.mem.forget_code_page(frame);
        for block in self.tc.retire_page(frame, &self.arena) {
            if let Some(entry) = self.profile.block_mut(block) {
                entry.revert(false);
            }
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::IptInstalled(pc) => {
                self.dcache.invalidate(pc);
                self.profile
                    .for_blocks_spanning(pc, |block| block.revert(true));
            }
            Command::IptRemoved(pc) => {
                self.profile.for_blocks_spanning(pc, |block| {
                    if block.kind() == EntryKind::InstrumentedInterpret {
                        block.revert(false);
                    }
                });
            }
            Command::BindNative { pc, handle, generation } => {
                // refuse bindings compiled before the page was overwritten
                if generation != self.page_generation(page_frame(pc)) {
                    debug!("dropping stale native binding for {pc:#010x}");
                    return;
                }
                if let Some(entry) = self.profile.block_mut(pc) {
                    entry.bind_native(handle);
                }
            }
            Command::RevertEntry { block, instrumented } => {
                if let Some(entry) = self.profile.block_mut(block) {
                    entry.revert(instrumented);
                }
            }
            Command::Toggle { toggle, on } => {
                debug!("applying option toggle {toggle:?} = {on}");
                self.opts.apply_toggle(toggle, on);
            }
            Command::SetIsa(isa) => {
                info!("ISA options changed, flushing decoded and translated state");
                self.opts.isa = isa;
                self.fingerprint = self.opts.isa.fingerprint();
                self.tc.set_expected_fingerprint(self.fingerprint);
                self.dcache.invalidate_all();
                self.profile.clear_bindings();
                self.tc.retire_all(&self.arena);
            }
        }
    }

    /// Begins a new block at the current PC: fires BeginBasicBlock
    /// subscribers, observes the block and reacts to the hotness
    /// threshold.
    fn enter_block(&mut self) {
        let pc = self.cpu.pc;
        self.block_start = pc;
        self.block_bytes = 0;
        self.block_insts = 0;

        let snapshot = self.snapshot.clone();
        if !snapshot.begin_block().is_empty() {
            let ipt = self.ipt.clone();
            let mut env = IptEnv { ipt: &*ipt, cpu: &mut self.cpu };
            for sub in snapshot.begin_block() {
                (sub.callback)(&mut env, sub.opaque, pc);
            }
        }

        let hot_threshold = self.opts.hot_threshold;
        let fast = self.opts.fast && !self.opts.cycle_accurate;
        let entry = self.profile.get_or_create_block(pc);
        let count = entry.observe();
        let qualifies = fast
            && count >= hot_threshold
            && !entry.hot
            && entry.bounded()
            && entry.kind() == EntryKind::Interpret;
        if !qualifies {
            return;
        }

        entry.hot = true;
        let frame = page_frame(pc);
        let page = self
            .profile
            .page_mut(frame)
            .expect("observed block has a page profile");
        page.hot_pending += 1;
        if page.hot_pending >= self.opts.page_translate_threshold {
            page.hot_pending = 0;
            self.form_work_unit(frame);
        }
    }

    /// Snapshots all hot blocks of a page into a work unit and offers it
    /// to the translation queue.
    fn form_work_unit(&mut self, frame: PageFrame) {
        let hot: Vec<(GuestAddr, u32)> = match self.profile.page(frame) {
            Some(page) => page.hot_blocks().map(|b| (b.start, b.len_bytes)).collect(),
            None => return,
        };

        let starts: Vec<GuestAddr> = hot.iter().map(|&(start, _)| start).collect();
        let mut blocks = Vec::with_capacity(hot.len());
        for (start, len_bytes) in hot {
            if let Some(dcodes) = self.snapshot_block(start, len_bytes) {
                blocks.push(WorkUnitBlock { start, dcodes });
            }
        }
        if blocks.is_empty() {
            return;
        }

        let generation = self.page_generation(frame);
        let unit = TranslationWorkUnit::new(frame, self.fingerprint, generation, blocks);
        match self.queue.push(unit) {
            PushOutcome::Queued => debug!("queued work unit for {frame}"),
            outcome => {
                debug!("work unit for {frame} dropped: {outcome:?}");
                // let the blocks re-qualify once the in-flight unit clears
                for start in starts {
                    if let Some(entry) = self.profile.block_mut(start) {
                        entry.hot = false;
                    }
                }
            }
        }
    }

    /// Clones the Dcode sequence of one block. Returns `None` when the
    /// block cannot be translated (decode fault, or an instrumented PC
    /// inside the block).
    fn snapshot_block(&mut self, start: GuestAddr, len_bytes: u32) -> Option<Vec<Dcode>> {
        let end = start as u64 + len_bytes as u64;
        let mut pc = start;
        let mut dcodes = Vec::new();
        while (pc as u64) < end {
            if self.tc.is_no_compile(pc) {
                return None;
            }
            let dcode = self.dcache.get(pc, &mut self.mem, &self.opts.isa).ok()?;
            dcodes.push(dcode);
            pc = pc.wrapping_add(dcode.len as u32);
        }
        Some(dcodes)
    }

    /// Fast path: enter published native code when the block is bound and
    /// no instrumentation forces interpretation.
    fn try_native(&mut self) -> Option<StepState> {
        if !self.opts.fast || self.opts.cycle_accurate || self.snapshot.forces_slow_path() {
            return None;
        }
        let pc = self.cpu.pc;
        let kind = self.profile.touch(pc).map(|entry| entry.kind());
        let Some(EntryKind::CompiledNative(_)) = kind else {
            return None;
        };

        // the lookup converts the binding into a short-lived ticket; a
        // stale binding (retired behind our back) falls back to
        // interpretation
        let Some((module, index)) = self.tc.lookup(pc, &self.arena) else {
            if let Some(entry) = self.profile.block_mut(pc) {
                entry.revert(false);
            }
            return None;
        };
        let entry = module.entry(index)?;

        let exit = (entry.exec)(&mut self.cpu, &mut self.mem);
        self.counters.native.add(exit.retired);
        self.cpu.pc = exit.next_pc;
        self.at_boundary = true;

        if exit.stop == NativeStop::Trap {
            let trap = self
                .cpu
                .pending_trap
                .take()
                .expect("native trap exit carries a trap record");
            return Some(self.handle_trap(trap));
        }
        if self.cpu.halted {
            return Some(StepState::Halted);
        }
        Some(StepState::Running)
    }

    /// Interprets one instruction through the decode cache, honouring
    /// instrumentation points.
    fn interpret_one(&mut self) -> StepState {
        let pc = self.cpu.pc;
        if self.opts.debug && pc & 1 != 0 {
            self.close_block();
            return self.handle_trap(Trap::IllegalInstruction { pc });
        }

        let dcode = match self.dcache.get(pc, &mut self.mem, &self.opts.isa) {
            Ok(dcode) => dcode,
            Err(trap) => {
                self.close_block();
                return self.handle_trap(trap);
            }
        };
        if self.opts.trace {
            trace!("{pc:#010x}: {dcode}");
        }

        // a branch may not sit in a delay slot
        if self.cpu.delay_target.is_some() && dcode.is_branch() {
            self.close_block();
            return self.handle_trap(Trap::IllegalInstruction { pc });
        }

        let snapshot = self.snapshot.clone();
        let mut consumed = false;
        if !snapshot.begin_inst().is_empty() || snapshot.about_at(pc).is_some() {
            let ipt = self.ipt.clone();
            let mut env = IptEnv { ipt: &*ipt, cpu: &mut self.cpu };
            for sub in snapshot.begin_inst() {
                (sub.callback)(&mut env, sub.opaque, pc, dcode.len as u32);
            }
            if let Some(subs) = snapshot.about_at(pc) {
                for sub in subs {
                    if (sub.callback)(&mut env, sub.opaque, pc) == IptAction::Consume {
                        consumed = true;
                    }
                }
            }
        }
        if consumed {
            // the instruction is skipped: the PC advances past it, guest
            // state stays untouched, and control returns to the caller
            self.cpu.pc = pc.wrapping_add(dcode.len as u32);
            return StepState::Paused;
        }

        let outcome = match exec::execute(&mut self.cpu, &mut self.mem, &self.eia, &dcode) {
            Ok(outcome) => outcome,
            Err(trap) => {
                self.close_block();
                return self.handle_trap(trap);
            }
        };

        self.counters.interp.increment();
        self.cpu.icount += 1;
        if self.opts.cycle_accurate {
            self.counters.cycles.add(self.pipeline.retire(&dcode));
        }
        self.block_insts += 1;
        self.block_bytes += dcode.len as u32;

        match outcome {
            ExecOutcome::Next => {
                if let Some(target) = self.cpu.delay_target.take() {
                    // the deferred branch lands after its delay slot
                    self.cpu.pc = target;
                    self.close_block();
                } else {
                    self.cpu.pc = pc.wrapping_add(dcode.len as u32);
                }
                StepState::Running
            }
            ExecOutcome::NotTaken => {
                self.cpu.pc = pc.wrapping_add(dcode.len as u32);
                self.close_block();
                StepState::Running
            }
            ExecOutcome::Taken(target) => {
                if dcode.has_delay_slot() {
                    self.cpu.delay_target = Some(target);
                    self.cpu.pc = pc.wrapping_add(dcode.len as u32);
                    StepState::Running
                } else {
                    self.cpu.pc = target;
                    self.close_block();
                    StepState::Running
                }
            }
            ExecOutcome::Halt => {
                self.cpu.pc = pc.wrapping_add(dcode.len as u32);
                self.close_block();
                StepState::Halted
            }
        }
    }

    /// Closes the current block, recording its bounds on first closure.
    fn close_block(&mut self) {
        self.at_boundary = true;
        if self.block_insts == 0 {
            return;
        }
        let (start, bytes, insts) = (self.block_start, self.block_bytes, self.block_insts);
        if let Some(entry) = self.profile.block_mut(start) {
            entry.set_bounds(bytes, insts);
        }
    }

    /// Converts a guest trap into simulation state. Guest traps never
    /// surface as API errors.
    fn handle_trap(&mut self, trap: Trap) -> StepState {
        match trap {
            Trap::UserTrap { pc, cause } if self.opts.emulate_traps => {
                if cause == 0 {
                    // emulated program exit
                    debug!("trap 0 at {pc:#010x}: guest exit");
                    self.cpu.halted = true;
                    return StepState::Halted;
                }
                // emulated system call: retires like an interpreted
                // instruction and ends the block
                debug!("emulating trap {cause} at {pc:#010x}");
                let len = self
                    .dcache
                    .get(pc, &mut self.mem, &self.opts.isa)
                    .map(|d| d.len as u32)
                    .unwrap_or(4);
                self.counters.interp.increment();
                self.cpu.icount += 1;
                self.cpu.pc = match self.cpu.delay_target.take() {
                    Some(target) => target,
                    None => pc.wrapping_add(len),
                };
                self.at_boundary = true;
                StepState::Running
            }
            trap => {
                info!("unhandled guest trap: {trap}");
                self.cpu.pending_trap = Some(trap);
                self.cpu.halted = true;
                StepState::Halted
            }
        }
    }
}
