//! Translation cache
//!
//! Maps guest PCs to published native entries (through arena handles) and
//! carries the per-PC do-not-compile marks set by instrumentation. Readers
//! take the lock per block-entry lookup; workers take it only to publish.
//! Retired modules park on a list until every dispatcher's observed epoch
//! has moved past their retirement epoch.

use super::arena::{TmArena, TmHandle};
use super::module::TranslationModule;
use log::{debug, warn};
use sim_types::{GuestAddr, OptionFingerprint, PageFrame};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy)]
struct TcSlot {
    handle: TmHandle,
    entry_index: u32,
    start: GuestAddr,
    len_bytes: u32,
}

impl TcSlot {
    fn spans(&self, pc: GuestAddr) -> bool {
        let start = self.start as u64;
        let pc = pc as u64;
        pc >= start && pc < start + self.len_bytes as u64
    }

    fn intersects_page(&self, frame: PageFrame) -> bool {
        let start = self.start as u64;
        let end = start + self.len_bytes.max(1) as u64;
        start < frame.limit() && end > frame.base() as u64
    }
}

struct TcInner {
    entries: HashMap<GuestAddr, TcSlot>,
    no_compile: HashSet<GuestAddr>,
}

struct RetiredModule {
    retired_at: u64,
    module: Arc<TranslationModule>,
}

/// Effects of a publish, for the caller to forward to the dispatcher.
#[derive(Default)]
pub struct PublishOutcome {
    /// PCs bound to the new module.
    pub bound: Vec<(GuestAddr, TmHandle)>,
    /// PCs whose previous binding disappeared without replacement.
    pub reverted: Vec<GuestAddr>,
    /// The module ceiling was hit and everything was flushed.
    pub flushed: bool,
}

pub struct TranslationCache {
    inner: RwLock<TcInner>,
    retired: Mutex<Vec<RetiredModule>>,
    /// Publish/retire epoch; monotonic.
    epoch: AtomicU64,
    /// Observed epochs of all dispatchers.
    observers: Mutex<Vec<Arc<AtomicU64>>>,
    /// A ceiling flush happened within the recurrence window.
    flushed_recently: AtomicBool,
    /// Publishes since the last ceiling flush.
    publishes_since_flush: AtomicU32,
    fatal: AtomicBool,
    max_live_modules: usize,
    /// Fingerprint of the ISA option set modules must match to publish.
    expected_fingerprint: AtomicU64,
}

/// A second ceiling flush within this many publishes of the previous one
/// means flushing is not relieving pressure; the simulator goes fatal.
const FLUSH_RECURRENCE_WINDOW: u32 = 8;

impl TranslationCache {
    pub fn new(max_live_modules: usize, fingerprint: OptionFingerprint) -> Self {
        TranslationCache {
            inner: RwLock::new(TcInner {
                entries: HashMap::new(),
                no_compile: HashSet::new(),
            }),
            retired: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
            flushed_recently: AtomicBool::new(false),
            publishes_since_flush: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            max_live_modules,
            expected_fingerprint: AtomicU64::new(fingerprint.raw()),
        }
    }

    /// Updates the fingerprint modules must carry to be publishable.
    /// Set by the dispatcher when ISA options change; in-flight units
    /// compiled under the old options are discarded at publish.
    pub fn set_expected_fingerprint(&self, fingerprint: OptionFingerprint) {
        self.expected_fingerprint
            .store(fingerprint.raw(), Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Registers a dispatcher's observed-epoch cell for reclamation.
    pub fn register_observer(&self, observer: Arc<AtomicU64>) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(observer);
    }

    /// A repeated resource-exhaustion flush marked the cache unusable.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn mark_no_compile(&self, pc: GuestAddr) {
        self.inner
            .write()
            .expect("translation cache poisoned")
            .no_compile
            .insert(pc);
    }

    pub fn clear_no_compile(&self, pc: GuestAddr) {
        self.inner
            .write()
            .expect("translation cache poisoned")
            .no_compile
            .remove(&pc);
    }

    pub fn is_no_compile(&self, pc: GuestAddr) -> bool {
        self.inner
            .read()
            .expect("translation cache poisoned")
            .no_compile
            .contains(&pc)
    }

    /// Looks up a native entry, converting the handle into a short-lived
    /// ticket (module reference + entry index). The caller must drop the
    /// ticket at the block boundary.
    pub fn lookup(
        &self,
        pc: GuestAddr,
        arena: &TmArena,
    ) -> Option<(Arc<TranslationModule>, u32)> {
        let inner = self.inner.read().expect("translation cache poisoned");
        let slot = inner.entries.get(&pc)?;
        let module = arena.get(slot.handle)?;
        Some((module, slot.entry_index))
    }

    /// Installs a compiled module: every entry replaces or inserts, except
    /// at do-not-compile PCs, which are skipped. Displaced modules move to
    /// the retired list. Returns the binding changes for the dispatcher.
    pub fn publish(&self, arena: &TmArena, module: TranslationModule) -> PublishOutcome {
        if module.fingerprint().raw() != self.expected_fingerprint.load(Ordering::Acquire) {
            debug!(
                "discarding module for {}: stale option fingerprint",
                module.page()
            );
            return PublishOutcome::default();
        }
        let module = Arc::new(module);
        // the arena tag only has to agree between slot and handle; the
        // global epoch is bumped atomically after the entries land
        let handle = arena.insert(module.clone(), self.epoch() + 1);

        let mut outcome = PublishOutcome::default();
        let mut displaced: Vec<TmHandle> = Vec::new();
        {
            let mut inner = self.inner.write().expect("translation cache poisoned");
            for (index, entry) in module.entries().iter().enumerate() {
                if inner.no_compile.contains(&entry.start) {
                    debug!("publish skips instrumented pc {:#010x}", entry.start);
                    continue;
                }
                if let Some(old) = inner.entries.get(&entry.start) {
                    if !displaced.contains(&old.handle) {
                        displaced.push(old.handle);
                    }
                }
                inner.entries.insert(
                    entry.start,
                    TcSlot {
                        handle,
                        entry_index: index as u32,
                        start: entry.start,
                        len_bytes: entry.len_bytes,
                    },
                );
                outcome.bound.push((entry.start, handle));
            }
            // a displaced module is retired whole: any leftover entries it
            // still serves go with it
            for old in &displaced {
                let leftover: Vec<GuestAddr> = inner
                    .entries
                    .iter()
                    .filter(|(_, slot)| slot.handle == *old)
                    .map(|(pc, _)| *pc)
                    .collect();
                for pc in leftover {
                    inner.entries.remove(&pc);
                    outcome.reverted.push(pc);
                }
            }
        }

        let epoch = self.bump_epoch();
        self.retire_handles(arena, &displaced, epoch);

        if arena.live_count() > self.max_live_modules {
            warn!(
                "translation code ceiling exceeded ({} live modules), flushing",
                arena.live_count()
            );
            let since = self.publishes_since_flush.load(Ordering::Acquire);
            if self.flushed_recently.load(Ordering::Acquire) && since < FLUSH_RECURRENCE_WINDOW {
                warn!("translation code ceiling exceeded again, marking fatal");
                self.fatal.store(true, Ordering::Release);
            }
            outcome.reverted.extend(self.retire_all(arena));
            outcome.flushed = true;
            self.flushed_recently.store(true, Ordering::Release);
            self.publishes_since_flush.store(0, Ordering::Release);
        } else {
            let since = self.publishes_since_flush.fetch_add(1, Ordering::AcqRel) + 1;
            if since >= FLUSH_RECURRENCE_WINDOW {
                self.flushed_recently.store(false, Ordering::Release);
            }
        }
        outcome
    }

    fn retire_handles(&self, arena: &TmArena, handles: &[TmHandle], at_epoch: u64) {
        let mut retired = self.retired.lock().expect("retired list poisoned");
        for &handle in handles {
            if let Some(module) = arena.retire(handle) {
                retired.push(RetiredModule {
                    retired_at: at_epoch,
                    module,
                });
            }
        }
    }

    /// Removes every entry whose block spans `pc`, retiring modules left
    /// with no entries. Returns the PCs whose bindings were dropped.
    pub fn retire_spanning(&self, pc: GuestAddr, arena: &TmArena) -> Vec<GuestAddr> {
        self.retire_matching(arena, |slot| slot.spans(pc))
    }

    /// Removes every entry whose block intersects `frame`.
    pub fn retire_page(&self, frame: PageFrame, arena: &TmArena) -> Vec<GuestAddr> {
        self.retire_matching(arena, |slot| slot.intersects_page(frame))
    }

    /// Removes all entries and retires all live modules.
    pub fn retire_all(&self, arena: &TmArena) -> Vec<GuestAddr> {
        let removed = self.retire_matching(arena, |_| true);
        // modules with no published entries (fully skipped publishes) still
        // count against the ceiling; sweep them too
        let epoch = self.bump_epoch();
        let leftover = arena.live_handles();
        self.retire_handles(arena, &leftover, epoch);
        removed
    }

    fn retire_matching<F>(&self, arena: &TmArena, mut predicate: F) -> Vec<GuestAddr>
    where
        F: FnMut(&TcSlot) -> bool,
    {
        let mut reverted = Vec::new();
        let mut candidates: Vec<TmHandle> = Vec::new();
        {
            let mut inner = self.inner.write().expect("translation cache poisoned");
            let matching: Vec<GuestAddr> = inner
                .entries
                .iter()
                .filter(|(_, slot)| predicate(slot))
                .map(|(pc, _)| *pc)
                .collect();
            for pc in matching {
                if let Some(slot) = inner.entries.remove(&pc) {
                    reverted.push(pc);
                    if !candidates.contains(&slot.handle) {
                        candidates.push(slot.handle);
                    }
                }
            }
            // only retire modules that no longer serve any entry
            candidates.retain(|handle| {
                !inner.entries.values().any(|slot| slot.handle == *handle)
            });
        }
        if !reverted.is_empty() || !candidates.is_empty() {
            let epoch = self.bump_epoch();
            self.retire_handles(arena, &candidates, epoch);
        }
        reverted
    }

    /// Frees retired modules once every dispatcher has observed an epoch
    /// past their retirement.
    pub fn reclaim(&self) {
        let min_observed = {
            let observers = self.observers.lock().expect("observer list poisoned");
            observers
                .iter()
                .map(|cell| cell.load(Ordering::Acquire))
                .min()
                .unwrap_or(u64::MAX)
        };
        let mut retired = self.retired.lock().expect("retired list poisoned");
        retired.retain(|r| r.retired_at >= min_observed);
    }

    /// Retired modules awaiting reclamation (diagnostics).
    pub fn retired_len(&self) -> usize {
        self.retired.lock().expect("retired list poisoned").len()
    }

    /// Published entry count (diagnostics).
    pub fn entry_count(&self) -> usize {
        self.inner
            .read()
            .expect("translation cache poisoned")
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::module::{NativeExit, NativeStop, TmEntry, TranslationModule};
    use sim_types::{page_frame, OptionFingerprint};

    fn module(page: u32, starts: &[(GuestAddr, u32)]) -> TranslationModule {
        let entries = starts
            .iter()
            .map(|&(start, len_bytes)| TmEntry {
                start,
                len_bytes,
                insts: len_bytes / 4,
                exec: Box::new(move |_cpu, _mem| NativeExit {
                    next_pc: start,
                    retired: 0,
                    stop: NativeStop::BranchUncompiled,
                }),
            })
            .collect();
        TranslationModule::new(page_frame(page), OptionFingerprint::from_raw(1), entries)
    }

    fn setup() -> (TranslationCache, TmArena) {
        (
            TranslationCache::new(64, OptionFingerprint::from_raw(1)),
            TmArena::new(),
        )
    }

    #[test]
    fn test_publish_then_lookup() {
        let (tc, arena) = setup();
        let outcome = tc.publish(&arena, module(0x4000, &[(0x4000, 8), (0x4010, 4)]));
        assert_eq!(outcome.bound.len(), 2);
        assert!(outcome.reverted.is_empty());

        let (m, index) = tc.lookup(0x4010, &arena).unwrap();
        assert_eq!(m.entry(index).unwrap().start, 0x4010);
        assert!(tc.lookup(0x4020, &arena).is_none());
    }

    #[test]
    fn test_stale_fingerprint_discarded() {
        let (tc, arena) = setup();
        tc.set_expected_fingerprint(OptionFingerprint::from_raw(2));
        // the module still carries fingerprint 1
        let outcome = tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        assert!(outcome.bound.is_empty());
        assert_eq!(arena.live_count(), 0);
        assert!(tc.lookup(0x4000, &arena).is_none());
    }

    #[test]
    fn test_no_compile_pcs_skipped() {
        let (tc, arena) = setup();
        tc.mark_no_compile(0x4010);
        let outcome = tc.publish(&arena, module(0x4000, &[(0x4000, 8), (0x4010, 4)]));
        assert_eq!(outcome.bound.len(), 1);
        assert!(tc.lookup(0x4010, &arena).is_none());
        assert!(tc.lookup(0x4000, &arena).is_some());
    }

    #[test]
    fn test_republish_retires_previous_module() {
        let (tc, arena) = setup();
        tc.publish(&arena, module(0x4000, &[(0x4000, 8), (0x4010, 4)]));
        let epoch_before = tc.epoch();

        // replacement covers one pc; the displaced module goes entirely
        let outcome = tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        assert!(tc.epoch() > epoch_before);
        assert_eq!(outcome.bound, vec![(0x4000, outcome.bound[0].1)]);
        assert_eq!(outcome.reverted, vec![0x4010]);
        assert!(tc.lookup(0x4010, &arena).is_none());
        assert_eq!(arena.live_count(), 1);
        assert_eq!(tc.retired_len(), 1);
    }

    #[test]
    fn test_retire_spanning() {
        let (tc, arena) = setup();
        tc.publish(&arena, module(0x4000, &[(0x4000, 12), (0x4010, 4)]));

        // 0x4008 lies inside the first block only
        let reverted = tc.retire_spanning(0x4008, &arena);
        assert_eq!(reverted, vec![0x4000]);
        assert!(tc.lookup(0x4000, &arena).is_none());
        // second entry still served; module not retired
        assert!(tc.lookup(0x4010, &arena).is_some());
        assert_eq!(arena.live_count(), 1);

        let reverted = tc.retire_spanning(0x4010, &arena);
        assert_eq!(reverted, vec![0x4010]);
        assert_eq!(arena.live_count(), 0);
        assert_eq!(tc.retired_len(), 1);
    }

    #[test]
    fn test_retire_page() {
        let (tc, arena) = setup();
        tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        tc.publish(&arena, module(0x2000, &[(0x2000, 8)]));

        let mut reverted = tc.retire_page(page_frame(0x4000), &arena);
        reverted.sort();
        assert_eq!(reverted, vec![0x4000]);
        assert!(tc.lookup(0x4000, &arena).is_none());
        assert!(tc.lookup(0x2000, &arena).is_some());
    }

    #[test]
    fn test_reclaim_respects_observers() {
        let (tc, arena) = setup();
        let observer = Arc::new(AtomicU64::new(1));
        tc.register_observer(observer.clone());

        tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        tc.retire_all(&arena);
        assert_eq!(tc.retired_len(), 1);

        // observer still at an old epoch: nothing freed
        tc.reclaim();
        assert_eq!(tc.retired_len(), 1);

        observer.store(tc.epoch() + 1, Ordering::Release);
        tc.reclaim();
        assert_eq!(tc.retired_len(), 0);
    }

    #[test]
    fn test_ceiling_flush_then_fatal() {
        let tc = TranslationCache::new(1, OptionFingerprint::from_raw(1));
        let arena = TmArena::new();
        tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        assert!(!tc.is_fatal());

        let outcome = tc.publish(&arena, module(0x2000, &[(0x2000, 8)]));
        assert!(outcome.flushed);
        assert!(!tc.is_fatal());
        assert_eq!(arena.live_count(), 0);

        tc.publish(&arena, module(0x4000, &[(0x4000, 8)]));
        let outcome = tc.publish(&arena, module(0x2000, &[(0x2000, 8)]));
        assert!(outcome.flushed);
        assert!(tc.is_fatal());
    }
}
