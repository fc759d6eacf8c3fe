//! Translation work units

use crate::isa::dcode::Dcode;
use sim_types::{GuestAddr, OptionFingerprint, PageFrame};

/// One block inside a work unit: its start PC and the cloned Dcode
/// sequence, in program order.
pub struct WorkUnitBlock {
    pub start: GuestAddr,
    pub dcodes: Vec<Dcode>,
}

impl WorkUnitBlock {
    pub fn len_bytes(&self) -> u32 {
        self.dcodes.iter().map(|d| d.len as u32).sum()
    }
}

/// An immutable snapshot of the hot blocks of one page, handed to the
/// worker pool behind an `Arc`. The Dcode sequences are clones; a work
/// unit never points into live caches, so the dispatcher is free to
/// invalidate behind it.
pub struct TranslationWorkUnit {
    pub page: PageFrame,
    pub fingerprint: OptionFingerprint,
    /// The page's invalidation generation at snapshot time. A publish
    /// whose generation is stale must not be bound: the page was
    /// overwritten while the unit was in flight.
    pub generation: u64,
    /// Blocks sorted by start PC.
    pub blocks: Vec<WorkUnitBlock>,
}

impl TranslationWorkUnit {
    pub fn new(
        page: PageFrame,
        fingerprint: OptionFingerprint,
        generation: u64,
        mut blocks: Vec<WorkUnitBlock>,
    ) -> Self {
        blocks.sort_by_key(|block| block.start);
        TranslationWorkUnit {
            page,
            fingerprint,
            generation,
            blocks,
        }
    }

    /// Deduplication key for the in-flight set.
    pub fn key(&self) -> (PageFrame, u64) {
        (self.page, self.fingerprint.raw())
    }
}
