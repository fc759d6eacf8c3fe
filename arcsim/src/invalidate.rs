//! The invalidation channel
//!
//! Everything that breaks a cached assumption funnels through here. The
//! decoded-instruction cache and the physical profile are owned by the
//! dispatcher thread, so cross-thread invalidation travels as [`Command`]s
//! in a queue the dispatcher drains at every block boundary; the shared
//! translation cache is acted on directly (it carries its own locking).

use crate::options::{IsaOptions, SimToggle};
use crate::translate::{TmArena, TmHandle, TranslationCache};
use log::debug;
use sim_types::GuestAddr;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A deferred mutation of dispatcher-owned state.
#[derive(Clone, Debug)]
pub enum Command {
    /// An instrumentation point was installed at `pc`: drop the decoded
    /// record and mark every block containing `pc` as instrumented.
    IptInstalled(GuestAddr),
    /// The last instrumentation point at `pc` was removed: blocks
    /// containing `pc` may be translated again.
    IptRemoved(GuestAddr),
    /// A publish bound native code for the block starting at `pc`. The
    /// binding only applies while the page's invalidation generation still
    /// matches the work unit the module was compiled from.
    BindNative {
        pc: GuestAddr,
        handle: TmHandle,
        generation: u64,
    },
    /// A block's native binding disappeared.
    RevertEntry { block: GuestAddr, instrumented: bool },
    /// Runtime option toggle.
    Toggle { toggle: SimToggle, on: bool },
    /// ISA option change; flushes everything derived from decode.
    SetIsa(IsaOptions),
}

/// Single-consumer command queue between API/worker threads and the
/// dispatcher.
#[derive(Default)]
pub struct CommandQueue {
    queue: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue::default()
    }

    pub fn push(&self, command: Command) {
        self.queue
            .lock()
            .expect("command queue poisoned")
            .push_back(command);
    }

    /// Takes every pending command, in push order.
    pub fn drain(&self) -> Vec<Command> {
        let mut queue = self.queue.lock().expect("command queue poisoned");
        queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("command queue poisoned").is_empty()
    }
}

/// Thread-safe front door for invalidation requests originating off the
/// dispatcher thread (instrumentation changes, option changes).
pub struct Invalidator {
    tc: Arc<TranslationCache>,
    arena: Arc<TmArena>,
    commands: Arc<CommandQueue>,
}

impl Invalidator {
    pub fn new(
        tc: Arc<TranslationCache>,
        arena: Arc<TmArena>,
        commands: Arc<CommandQueue>,
    ) -> Self {
        Invalidator { tc, arena, commands }
    }

    /// An instrumentation point appeared at `pc`. Any published block
    /// spanning `pc` is retired immediately; the dispatcher-side caches
    /// catch up at its next block boundary.
    pub fn ipt_installed(&self, pc: GuestAddr) {
        for block in self.tc.retire_spanning(pc, &self.arena) {
            self.commands.push(Command::RevertEntry {
                block,
                instrumented: true,
            });
        }
        self.commands.push(Command::IptInstalled(pc));
        debug!("instrumentation installed at {pc:#010x}");
    }

    /// The last instrumentation point at `pc` disappeared.
    pub fn ipt_removed(&self, pc: GuestAddr) {
        self.commands.push(Command::IptRemoved(pc));
    }

    /// A global (per-instruction or per-block) instrumentation subscriber
    /// changed: all native code must stop being entered.
    pub fn global_ipt_changed(&self) {
        for block in self.tc.retire_all(&self.arena) {
            self.commands.push(Command::RevertEntry {
                block,
                instrumented: false,
            });
        }
        debug!("global instrumentation changed, native code retired");
    }

    /// Runtime option toggle; applied at the next block boundary.
    pub fn toggle(&self, toggle: SimToggle, on: bool) {
        self.commands.push(Command::Toggle { toggle, on });
    }

    /// ISA option change; the dispatcher flushes every derived cache when
    /// it applies this.
    pub fn isa_changed(&self, isa: IsaOptions) {
        self.commands.push(Command::SetIsa(isa));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::module::{NativeExit, NativeStop, TmEntry};
    use crate::translate::TranslationModule;
    use sim_types::{page_frame, OptionFingerprint};

    fn published_cache() -> (Arc<TranslationCache>, Arc<TmArena>) {
        let tc = Arc::new(TranslationCache::new(64, OptionFingerprint::from_raw(1)));
        let arena = Arc::new(TmArena::new());
        let entry = TmEntry {
            start: 0x4000,
            len_bytes: 12,
            insts: 3,
            exec: Box::new(|_cpu, _mem| NativeExit {
                next_pc: 0x4000,
                retired: 0,
                stop: NativeStop::BranchUncompiled,
            }),
        };
        tc.publish(
            &arena,
            TranslationModule::new(
                page_frame(0x4000),
                OptionFingerprint::from_raw(1),
                vec![entry],
            ),
        );
        (tc, arena)
    }

    #[test]
    fn test_queue_preserves_order() {
        let queue = CommandQueue::new();
        queue.push(Command::IptInstalled(0x100));
        queue.push(Command::IptRemoved(0x100));
        let drained = queue.drain();
        assert!(matches!(drained[0], Command::IptInstalled(0x100)));
        assert!(matches!(drained[1], Command::IptRemoved(0x100)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ipt_install_retires_spanning_block() {
        let (tc, arena) = published_cache();
        let commands = Arc::new(CommandQueue::new());
        let invalidator = Invalidator::new(tc.clone(), arena.clone(), commands.clone());

        // 0x4008 lies inside the published block
        invalidator.ipt_installed(0x4008);
        assert!(tc.lookup(0x4000, &arena).is_none());

        let drained = commands.drain();
        assert!(matches!(
            drained[0],
            Command::RevertEntry { block: 0x4000, instrumented: true }
        ));
        assert!(matches!(drained[1], Command::IptInstalled(0x4008)));
    }

    #[test]
    fn test_ipt_install_outside_blocks_only_queues() {
        let (tc, arena) = published_cache();
        let commands = Arc::new(CommandQueue::new());
        let invalidator = Invalidator::new(tc.clone(), arena.clone(), commands.clone());

        invalidator.ipt_installed(0x7000);
        assert!(tc.lookup(0x4000, &arena).is_some());
        let drained = commands.drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], Command::IptInstalled(0x7000)));
    }

    #[test]
    fn test_global_change_retires_everything() {
        let (tc, arena) = published_cache();
        let commands = Arc::new(CommandQueue::new());
        let invalidator = Invalidator::new(tc.clone(), arena.clone(), commands.clone());

        invalidator.global_ipt_changed();
        assert_eq!(tc.entry_count(), 0);
        assert_eq!(arena.live_count(), 0);
        assert!(matches!(
            commands.drain()[0],
            Command::RevertEntry { block: 0x4000, instrumented: false }
        ));
    }
}
