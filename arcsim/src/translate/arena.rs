//! Epoch arena for translation modules
//!
//! Modules are owned by an append-only arena; everything else (block
//! entries, the translation cache) holds a typed [`TmHandle`] and can only
//! reach the module through [`TmArena::get`], which refuses stale handles.
//! This is what breaks the BlockEntry ↔ TranslationModule ↔
//! TranslationCache reference cycle.

use super::module::TranslationModule;
use std::sync::{Arc, RwLock};

/// Typed handle to an arena slot. A handle is valid only while the slot
/// still holds the module it was issued for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TmHandle {
    epoch: u64,
    index: u32,
}

impl TmHandle {
    pub fn new(epoch: u64, index: u32) -> Self {
        TmHandle { epoch, index }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

struct ArenaSlot {
    epoch: u64,
    module: Option<Arc<TranslationModule>>,
}

/// Append-only module arena.
#[derive(Default)]
pub struct TmArena {
    slots: RwLock<Vec<ArenaSlot>>,
}

impl TmArena {
    pub fn new() -> Self {
        TmArena::default()
    }

    /// Takes ownership of a module, tagging it with the epoch it was
    /// published under.
    pub fn insert(&self, module: Arc<TranslationModule>, epoch: u64) -> TmHandle {
        let mut slots = self.slots.write().expect("arena lock poisoned");
        slots.push(ArenaSlot {
            epoch,
            module: Some(module),
        });
        TmHandle {
            epoch,
            index: (slots.len() - 1) as u32,
        }
    }

    /// Dereferences a handle. Stale handles (retired slot, or an epoch
    /// mismatch from slot reuse) yield `None`.
    pub fn get(&self, handle: TmHandle) -> Option<Arc<TranslationModule>> {
        let slots = self.slots.read().expect("arena lock poisoned");
        let slot = slots.get(handle.index as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.module.clone()
    }

    /// Removes the module behind a handle, returning it for the retired
    /// list. Subsequent `get` calls on the handle fail.
    pub fn retire(&self, handle: TmHandle) -> Option<Arc<TranslationModule>> {
        let mut slots = self.slots.write().expect("arena lock poisoned");
        let slot = slots.get_mut(handle.index as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.module.take()
    }

    /// Number of live (unretired) modules.
    pub fn live_count(&self) -> usize {
        let slots = self.slots.read().expect("arena lock poisoned");
        slots.iter().filter(|slot| slot.module.is_some()).count()
    }

    /// Handles of all live modules.
    pub fn live_handles(&self) -> Vec<TmHandle> {
        let slots = self.slots.read().expect("arena lock poisoned");
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.module.is_some())
            .map(|(index, slot)| TmHandle {
                epoch: slot.epoch,
                index: index as u32,
            })
            .collect()
    }
}
