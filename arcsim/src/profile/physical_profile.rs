//! Page-frame → page-profile map

use super::block_entry::BlockEntry;
use super::page_profile::PageProfile;
use sim_types::{page_frame, GuestAddr, PageFrame};
use std::collections::HashMap;

/// The whole-machine profile: every page that ever began a block has a
/// `PageProfile` here, so any profiled PC resolves in two lookups.
#[derive(Default)]
pub struct PhysicalProfile {
    pages: HashMap<PageFrame, PageProfile>,
}

impl PhysicalProfile {
    pub fn new() -> Self {
        PhysicalProfile::default()
    }

    pub fn get_or_create_block(&mut self, pc: GuestAddr) -> &mut BlockEntry {
        let frame = page_frame(pc);
        self.pages
            .entry(frame)
            .or_insert_with(|| PageProfile::new(frame))
            .get_or_create(pc)
    }

    /// Increments the block's execution count, creating the block if this
    /// is its first observation. Returns the new count.
    pub fn observe(&mut self, pc: GuestAddr) -> u64 {
        self.get_or_create_block(pc).observe()
    }

    /// Reads a block entry without touching its count.
    pub fn touch(&self, pc: GuestAddr) -> Option<&BlockEntry> {
        self.pages.get(&page_frame(pc))?.get(pc)
    }

    pub fn block_mut(&mut self, pc: GuestAddr) -> Option<&mut BlockEntry> {
        self.pages.get_mut(&page_frame(pc))?.get_mut(pc)
    }

    pub fn page(&self, frame: PageFrame) -> Option<&PageProfile> {
        self.pages.get(&frame)
    }

    pub fn page_mut(&mut self, frame: PageFrame) -> Option<&mut PageProfile> {
        self.pages.get_mut(&frame)
    }

    /// Discards every block record for a page. Used when guest code in the
    /// page has been overwritten.
    pub fn drop_page(&mut self, frame: PageFrame) {
        self.pages.remove(&frame);
    }

    /// Applies `f` to every block whose extent contains `pc`. Blocks may
    /// span a page boundary, so the preceding page is scanned too;
    /// unbounded blocks cover at least their start address.
    pub fn for_blocks_spanning<F: FnMut(&mut BlockEntry)>(&mut self, pc: GuestAddr, mut f: F) {
        let frame = page_frame(pc);
        let frames = [frame, PageFrame::from_raw(frame.raw().wrapping_sub(1))];
        for frame in frames {
            let Some(page) = self.pages.get_mut(&frame) else {
                continue;
            };
            for block in page.blocks_mut() {
                let start = block.start as u64;
                let end = start + block.len_bytes.max(2) as u64;
                if (pc as u64) >= start && (pc as u64) < end {
                    f(block);
                }
            }
        }
    }

    /// Drops all entry-function bindings while preserving counts; the
    /// response to an ISA option change.
    pub fn clear_bindings(&mut self) {
        for page in self.pages.values_mut() {
            page.hot_pending = 0;
            for block in page.blocks_mut() {
                block.revert(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::EntryKind;
    use crate::translate::arena::TmHandle;

    #[test]
    fn test_two_level_lookup() {
        let mut profile = PhysicalProfile::new();
        assert_eq!(profile.observe(0x0000_4000), 1);
        assert_eq!(profile.observe(0x0000_4000), 2);
        assert_eq!(profile.observe(0x0001_4000), 1);

        assert_eq!(profile.touch(0x0000_4000).unwrap().count(), 2);
        assert!(profile.touch(0x0002_0000).is_none());
    }

    #[test]
    fn test_drop_page_removes_blocks() {
        let mut profile = PhysicalProfile::new();
        profile.observe(0x4000);
        profile.observe(0x6000);
        profile.drop_page(page_frame(0x4000));
        assert!(profile.touch(0x4000).is_none());
        assert_eq!(profile.touch(0x6000).unwrap().count(), 1);
    }

    #[test]
    fn test_clear_bindings_preserves_counts() {
        let mut profile = PhysicalProfile::new();
        profile.observe(0x4000);
        profile.observe(0x4000);
        profile
            .block_mut(0x4000)
            .unwrap()
            .bind_native(TmHandle::new(1, 0));

        profile.clear_bindings();
        let block = profile.touch(0x4000).unwrap();
        assert_eq!(block.kind(), EntryKind::Interpret);
        assert_eq!(block.count(), 2);
    }
}
