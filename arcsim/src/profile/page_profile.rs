//! Per-page block records

use super::block_entry::BlockEntry;
use sim_types::{page_offset, GuestAddr, PageFrame};
use std::collections::BTreeMap;

/// All block entries for one guest page, keyed by page offset. Owns its
/// entries; every entry's PC lies within the page.
pub struct PageProfile {
    frame: PageFrame,
    blocks: BTreeMap<u32, BlockEntry>,
    /// Hot blocks accumulated since the last work unit was formed.
    pub hot_pending: u32,
}

impl PageProfile {
    pub fn new(frame: PageFrame) -> Self {
        PageProfile {
            frame,
            blocks: BTreeMap::new(),
            hot_pending: 0,
        }
    }

    pub fn frame(&self) -> PageFrame {
        self.frame
    }

    pub fn get_or_create(&mut self, pc: GuestAddr) -> &mut BlockEntry {
        debug_assert!(self.frame.contains(pc));
        self.blocks
            .entry(page_offset(pc))
            .or_insert_with(|| BlockEntry::new(pc))
    }

    pub fn get(&self, pc: GuestAddr) -> Option<&BlockEntry> {
        self.blocks.get(&page_offset(pc))
    }

    pub fn get_mut(&mut self, pc: GuestAddr) -> Option<&mut BlockEntry> {
        self.blocks.get_mut(&page_offset(pc))
    }

    /// Blocks in ascending PC order.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockEntry> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BlockEntry> {
        self.blocks.values_mut()
    }

    /// Hot blocks with known bounds, ascending PC order. These are the
    /// candidates a work unit snapshots.
    pub fn hot_blocks(&self) -> impl Iterator<Item = &BlockEntry> {
        self.blocks.values().filter(|b| b.hot && b.bounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::page_frame;

    #[test]
    fn test_entries_keyed_by_offset() {
        let mut page = PageProfile::new(page_frame(0x2000));
        page.get_or_create(0x2010).observe();
        page.get_or_create(0x2010).observe();
        page.get_or_create(0x2020).observe();

        assert_eq!(page.get(0x2010).unwrap().count(), 2);
        assert_eq!(page.get(0x2020).unwrap().count(), 1);
        assert!(page.get(0x2030).is_none());
        assert_eq!(page.blocks().count(), 2);
    }

    #[test]
    fn test_hot_blocks_sorted_and_bounded() {
        let mut page = PageProfile::new(page_frame(0x2000));
        for pc in [0x2040u32, 0x2000, 0x2020] {
            let entry = page.get_or_create(pc);
            entry.hot = true;
            entry.set_bounds(8, 2);
        }
        // hot but unbounded: excluded
        page.get_or_create(0x2060).hot = true;

        let starts: Vec<GuestAddr> = page.hot_blocks().map(|b| b.start).collect();
        assert_eq!(starts, vec![0x2000, 0x2020, 0x2040]);
    }
}
