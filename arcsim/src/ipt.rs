//! Instrumentation points
//!
//! Three subscriber families: AboutToExecuteInstruction (per-PC),
//! BeginInstructionExecution and BeginBasicBlock (global). Registration
//! mutates registries behind a mutex and republishes an immutable snapshot;
//! the dispatcher picks the snapshot up at block boundaries, so a callback
//! executing under the old snapshot can re-register or remove subscribers
//! (itself included) without corrupting the list it is being dispatched
//! from. Registration failures are expected outcomes and are not logged.
//!
//! Invariant: a PC has AboutToExecute subscribers iff it carries a
//! do-not-compile mark in the translation cache, and no published native
//! block spans it.

use crate::cpu::state::CpuState;
use crate::invalidate::Invalidator;
use crate::translate::TranslationCache;
use sim_types::GuestAddr;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

/// Registration failures. Expected outcomes, surfaced to the API caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IptError {
    #[error("subscriber already registered")]
    DuplicateSubscriber,
    #[error("subscriber not registered")]
    NotRegistered,
}

/// What an AboutToExecuteInstruction subscriber wants done with the
/// instruction it was shown.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IptAction {
    /// Execute normally.
    Continue,
    /// Skip the instruction (the PC still advances past it) and hand
    /// control back to the API caller.
    Consume,
}

/// Environment handed to every callback: the manager (for re-entrant
/// registration) and the guest state.
pub struct IptEnv<'a> {
    pub ipt: &'a IptManager,
    pub cpu: &'a mut CpuState,
}

pub type AboutToExecuteFn = fn(&mut IptEnv<'_>, usize, GuestAddr) -> IptAction;
pub type BeginInstructionFn = fn(&mut IptEnv<'_>, usize, GuestAddr, u32);
pub type BeginBasicBlockFn = fn(&mut IptEnv<'_>, usize, GuestAddr);

#[derive(Clone, Copy)]
pub struct AboutSubscriber {
    pub callback: AboutToExecuteFn,
    pub opaque: usize,
}

#[derive(Clone, Copy)]
pub struct InstSubscriber {
    pub callback: BeginInstructionFn,
    pub opaque: usize,
}

#[derive(Clone, Copy)]
pub struct BlockSubscriber {
    pub callback: BeginBasicBlockFn,
    pub opaque: usize,
}

#[derive(Default)]
struct Registries {
    about: BTreeMap<GuestAddr, Vec<AboutSubscriber>>,
    begin_inst: Vec<InstSubscriber>,
    begin_block: Vec<BlockSubscriber>,
}

/// Immutable view of the registries, swapped whole on every mutation.
#[derive(Default)]
pub struct IptSnapshot {
    about: HashMap<GuestAddr, Vec<AboutSubscriber>>,
    begin_inst: Vec<InstSubscriber>,
    begin_block: Vec<BlockSubscriber>,
}

impl IptSnapshot {
    pub fn about_at(&self, pc: GuestAddr) -> Option<&[AboutSubscriber]> {
        self.about.get(&pc).map(|subs| subs.as_slice())
    }

    pub fn begin_inst(&self) -> &[InstSubscriber] {
        &self.begin_inst
    }

    pub fn begin_block(&self) -> &[BlockSubscriber] {
        &self.begin_block
    }

    /// Whether global subscribers force the slow path.
    pub fn forces_slow_path(&self) -> bool {
        !self.begin_inst.is_empty() || !self.begin_block.is_empty()
    }
}

pub struct IptManager {
    registries: Mutex<Registries>,
    snapshot: RwLock<Arc<IptSnapshot>>,
    tc: Arc<TranslationCache>,
    invalidator: Arc<Invalidator>,
}

impl IptManager {
    pub fn new(tc: Arc<TranslationCache>, invalidator: Arc<Invalidator>) -> Self {
        IptManager {
            registries: Mutex::new(Registries::default()),
            snapshot: RwLock::new(Arc::new(IptSnapshot::default())),
            tc,
            invalidator,
        }
    }

    /// The dispatcher's view; refreshed at block boundaries.
    pub fn snapshot(&self) -> Arc<IptSnapshot> {
        self.snapshot.read().expect("ipt snapshot poisoned").clone()
    }

    fn republish(&self, registries: &Registries) {
        let snapshot = IptSnapshot {
            about: registries
                .about
                .iter()
                .map(|(pc, subs)| (*pc, subs.clone()))
                .collect(),
            begin_inst: registries.begin_inst.clone(),
            begin_block: registries.begin_block.clone(),
        };
        *self.snapshot.write().expect("ipt snapshot poisoned") = Arc::new(snapshot);
    }

    /// Registers an AboutToExecuteInstruction subscriber at `pc`.
    /// Identity is `(pc, callback)`; a second registration of the same
    /// pair fails even under a different opaque word.
    pub fn insert_about_to_execute(
        &self,
        pc: GuestAddr,
        callback: AboutToExecuteFn,
        opaque: usize,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        let subs = registries.about.entry(pc).or_default();
        if subs.iter().any(|s| s.callback as usize == callback as usize) {
            return Err(IptError::DuplicateSubscriber);
        }
        let first_at_pc = subs.is_empty();
        subs.push(AboutSubscriber { callback, opaque });
        if first_at_pc {
            self.tc.mark_no_compile(pc);
            self.invalidator.ipt_installed(pc);
        }
        self.republish(&registries);
        Ok(())
    }

    /// Removes one `(pc, callback)` subscriber.
    pub fn remove_about_to_execute_subscriber(
        &self,
        pc: GuestAddr,
        callback: AboutToExecuteFn,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        let subs = registries.about.get_mut(&pc).ok_or(IptError::NotRegistered)?;
        let index = subs
            .iter()
            .position(|s| s.callback as usize == callback as usize)
            .ok_or(IptError::NotRegistered)?;
        subs.remove(index);
        if subs.is_empty() {
            registries.about.remove(&pc);
            self.tc.clear_no_compile(pc);
            self.invalidator.ipt_removed(pc);
        }
        self.republish(&registries);
        Ok(())
    }

    /// Removes every subscriber at `pc`, regardless of callback or opaque.
    pub fn remove_about_to_execute(&self, pc: GuestAddr) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        if registries.about.remove(&pc).is_none() {
            return Err(IptError::NotRegistered);
        }
        self.tc.clear_no_compile(pc);
        self.invalidator.ipt_removed(pc);
        self.republish(&registries);
        Ok(())
    }

    /// Registers a global per-instruction subscriber. All native code is
    /// invalidated; dispatch goes through the slow path from the next
    /// block boundary on.
    pub fn insert_begin_instruction(
        &self,
        callback: BeginInstructionFn,
        opaque: usize,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        if registries
            .begin_inst
            .iter()
            .any(|s| s.callback as usize == callback as usize && s.opaque == opaque)
        {
            return Err(IptError::DuplicateSubscriber);
        }
        registries.begin_inst.push(InstSubscriber { callback, opaque });
        self.invalidator.global_ipt_changed();
        self.republish(&registries);
        Ok(())
    }

    pub fn remove_begin_instruction_subscriber(
        &self,
        callback: BeginInstructionFn,
        opaque: usize,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        let index = registries
            .begin_inst
            .iter()
            .position(|s| s.callback as usize == callback as usize && s.opaque == opaque)
            .ok_or(IptError::NotRegistered)?;
        registries.begin_inst.remove(index);
        self.invalidator.global_ipt_changed();
        self.republish(&registries);
        Ok(())
    }

    /// Registers a global per-block subscriber; same invalidation contract
    /// as per-instruction subscribers.
    pub fn insert_begin_basic_block(
        &self,
        callback: BeginBasicBlockFn,
        opaque: usize,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        if registries
            .begin_block
            .iter()
            .any(|s| s.callback as usize == callback as usize && s.opaque == opaque)
        {
            return Err(IptError::DuplicateSubscriber);
        }
        registries.begin_block.push(BlockSubscriber { callback, opaque });
        self.invalidator.global_ipt_changed();
        self.republish(&registries);
        Ok(())
    }

    pub fn remove_begin_basic_block_subscriber(
        &self,
        callback: BeginBasicBlockFn,
        opaque: usize,
    ) -> Result<(), IptError> {
        let mut registries = self.registries.lock().expect("ipt registries poisoned");
        let index = registries
            .begin_block
            .iter()
            .position(|s| s.callback as usize == callback as usize && s.opaque == opaque)
            .ok_or(IptError::NotRegistered)?;
        registries.begin_block.remove(index);
        self.invalidator.global_ipt_changed();
        self.republish(&registries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidate::CommandQueue;
    use crate::translate::TmArena;
    use sim_types::OptionFingerprint;

    fn manager() -> (IptManager, Arc<TranslationCache>) {
        let tc = Arc::new(TranslationCache::new(64, OptionFingerprint::from_raw(0)));
        let arena = Arc::new(TmArena::new());
        let commands = Arc::new(CommandQueue::new());
        let invalidator = Arc::new(Invalidator::new(tc.clone(), arena, commands));
        (IptManager::new(tc.clone(), invalidator), tc)
    }

    fn cb_continue(_env: &mut IptEnv<'_>, _opaque: usize, _pc: GuestAddr) -> IptAction {
        IptAction::Continue
    }

    fn cb_consume(_env: &mut IptEnv<'_>, _opaque: usize, _pc: GuestAddr) -> IptAction {
        IptAction::Consume
    }

    fn inst_cb(_env: &mut IptEnv<'_>, _opaque: usize, _pc: GuestAddr, _len: u32) {}

    fn block_cb(_env: &mut IptEnv<'_>, _opaque: usize, _pc: GuestAddr) {}

    #[test]
    fn test_duplicate_about_registration() {
        let (ipt, _tc) = manager();
        assert_eq!(ipt.insert_about_to_execute(0x39c, cb_continue, 0), Ok(()));
        // same (pc, cb) under a different opaque is still a duplicate
        assert_eq!(
            ipt.insert_about_to_execute(0x39c, cb_continue, 99),
            Err(IptError::DuplicateSubscriber)
        );
        // a different callback at the same pc is fine
        assert_eq!(ipt.insert_about_to_execute(0x39c, cb_consume, 0), Ok(()));
    }

    #[test]
    fn test_remove_sequences() {
        let (ipt, _tc) = manager();
        ipt.insert_about_to_execute(0x39c, cb_continue, 0).unwrap();
        assert_eq!(
            ipt.remove_about_to_execute_subscriber(0x39c, cb_continue),
            Ok(())
        );
        assert_eq!(
            ipt.remove_about_to_execute_subscriber(0x39c, cb_continue),
            Err(IptError::NotRegistered)
        );
        assert_eq!(
            ipt.remove_about_to_execute(0x39c),
            Err(IptError::NotRegistered)
        );
    }

    #[test]
    fn test_remove_all_ignores_opaque() {
        let (ipt, _tc) = manager();
        ipt.insert_about_to_execute(0x100, cb_continue, 1).unwrap();
        ipt.insert_about_to_execute(0x100, cb_consume, 2).unwrap();
        assert_eq!(ipt.remove_about_to_execute(0x100), Ok(()));
        assert!(ipt.snapshot().about_at(0x100).is_none());
    }

    #[test]
    fn test_no_compile_mark_tracks_subscribers() {
        let (ipt, tc) = manager();
        assert!(!tc.is_no_compile(0x200));

        ipt.insert_about_to_execute(0x200, cb_continue, 0).unwrap();
        assert!(tc.is_no_compile(0x200));

        ipt.insert_about_to_execute(0x200, cb_consume, 0).unwrap();
        ipt.remove_about_to_execute_subscriber(0x200, cb_continue)
            .unwrap();
        // one subscriber left: still marked
        assert!(tc.is_no_compile(0x200));

        ipt.remove_about_to_execute_subscriber(0x200, cb_consume)
            .unwrap();
        assert!(!tc.is_no_compile(0x200));
    }

    #[test]
    fn test_snapshot_isolation() {
        let (ipt, _tc) = manager();
        ipt.insert_about_to_execute(0x300, cb_continue, 0).unwrap();
        let old = ipt.snapshot();

        ipt.remove_about_to_execute(0x300).unwrap();
        // the old snapshot keeps serving its lists
        assert_eq!(old.about_at(0x300).unwrap().len(), 1);
        assert!(ipt.snapshot().about_at(0x300).is_none());
    }

    #[test]
    fn test_global_registration_errors() {
        let (ipt, _tc) = manager();
        assert_eq!(ipt.insert_begin_instruction(inst_cb, 0), Ok(()));
        assert_eq!(
            ipt.insert_begin_instruction(inst_cb, 0),
            Err(IptError::DuplicateSubscriber)
        );
        // same callback, different opaque: a distinct subscriber
        assert_eq!(ipt.insert_begin_instruction(inst_cb, 1), Ok(()));

        assert_eq!(ipt.remove_begin_instruction_subscriber(inst_cb, 0), Ok(()));
        assert_eq!(
            ipt.remove_begin_instruction_subscriber(inst_cb, 0),
            Err(IptError::NotRegistered)
        );

        assert_eq!(ipt.insert_begin_basic_block(block_cb, 0), Ok(()));
        assert_eq!(
            ipt.insert_begin_basic_block(block_cb, 0),
            Err(IptError::DuplicateSubscriber)
        );
        assert_eq!(ipt.remove_begin_basic_block_subscriber(block_cb, 0), Ok(()));
        assert_eq!(
            ipt.remove_begin_basic_block_subscriber(block_cb, 0),
            Err(IptError::NotRegistered)
        );
    }

    #[test]
    fn test_globals_force_slow_path() {
        let (ipt, _tc) = manager();
        assert!(!ipt.snapshot().forces_slow_path());
        ipt.insert_begin_basic_block(block_cb, 0).unwrap();
        assert!(ipt.snapshot().forces_slow_path());
        ipt.remove_begin_basic_block_subscriber(block_cb, 0).unwrap();
        assert!(!ipt.snapshot().forces_slow_path());
    }
}
