//! Intrusive free-range list within a page table
//!
//! Not-yet-reserved ranges inside a PT form a doubly-linked list of blocks
//! threaded through the PT's own entries: the first PTE of each free block
//! holds `{size, prev, next}`. The parent PDE caches the head offset and a
//! compressed bound of the largest block so the range-search paths can skip
//! whole PTs. The list is kept in ascending address order, which makes the
//! neighbors of a freed range its adjacent list nodes.

use crate::bugcheck::Reason;

use super::pte::{FreeBlock, PageTable, Pde, Pte};
use super::ENTRY_COUNT;

/// A borrowed (PT, PDE) pair with free-list editing operations. The caller
/// owns the space lock and writes the PDE back once the edit completes.
pub struct FreeList<'a> {
    pt: &'a mut PageTable,
    pde: &'a mut Pde,
}

impl<'a> FreeList<'a> {
    pub fn attach(pt: &'a mut PageTable, pde: &'a mut Pde) -> Self {
        Self { pt, pde }
    }

    /// Set up a freshly zeroed PT as one maximal block.
    pub fn init_full(&mut self) {
        self.write_block(
            0,
            FreeBlock {
                size: ENTRY_COUNT as u16,
                prev: None,
                next: None,
            },
        );
        self.pde.set_head(0);
        self.pde.set_max_free(ENTRY_COUNT as u16);
    }

    fn head(&self) -> Option<u16> {
        (self.pde.max_free() > 0).then(|| self.pde.head())
    }

    fn read_block(&self, off: u16) -> FreeBlock {
        match self.pt.pte(off as usize).free_head() {
            Some(block) => block,
            None => bugcheck!(Reason::Corrupted, "free list head missing at offset {off}"),
        }
    }

    fn write_block(&mut self, off: u16, block: FreeBlock) {
        self.pt.set_pte(off as usize, Pte::from_free_block(block));
    }

    fn clear(&mut self, off: u16) {
        self.pt.set_pte(off as usize, Pte::zero());
    }

    fn set_prev(&mut self, off: u16, prev: Option<u16>) {
        let mut block = self.read_block(off);
        block.prev = prev;
        self.write_block(off, block);
    }

    fn set_next(&mut self, off: u16, next: Option<u16>) {
        let mut block = self.read_block(off);
        block.next = next;
        self.write_block(off, block);
    }

    /// Unlink `off` from the list.
    fn unlink(&mut self, off: u16, block: FreeBlock) {
        if let Some(prev) = block.prev {
            self.set_next(prev, block.next);
        } else {
            match block.next {
                Some(next) => self.pde.set_head(next),
                // Last block gone: kill the hint right away so the stale
                // head offset is never followed.
                None => self.pde.set_max_free(0),
            }
        }
        if let Some(next) = block.next {
            self.set_prev(next, block.prev);
        }
        self.clear(off);
    }

    /// Shrink `off` by carving `count` pages off its front; the remainder
    /// (if any) becomes the block at `off + count`.
    fn carve_front(&mut self, off: u16, block: FreeBlock, count: u16) {
        if block.size == count {
            self.unlink(off, block);
            return;
        }
        let moved = off + count;
        self.write_block(
            moved,
            FreeBlock {
                size: block.size - count,
                ..block
            },
        );
        if let Some(prev) = block.prev {
            self.set_next(prev, Some(moved));
        } else {
            self.pde.set_head(moved);
        }
        if let Some(next) = block.next {
            self.set_prev(next, Some(moved));
        }
        self.clear(off);
    }

    /// First-fit allocation of `count` pages. Returns the offset of the
    /// carved range; its PTEs are left zero for the caller to fill.
    pub fn carve_any(&mut self, count: u16) -> Option<u16> {
        debug_assert!(count >= 1 && (count as usize) <= ENTRY_COUNT);
        let mut cursor = self.head();
        while let Some(off) = cursor {
            let block = self.read_block(off);
            if block.size >= count {
                self.carve_front(off, block, count);
                self.refresh_hint();
                return Some(off);
            }
            cursor = block.next;
        }
        None
    }

    /// Carve exactly `[off, off + count)`. Fails (without side effects) if
    /// the span is not wholly inside one free block.
    pub fn carve_exact(&mut self, off: u16, count: u16) -> bool {
        debug_assert!(count >= 1 && (off + count) as usize <= ENTRY_COUNT);
        let mut cursor = self.head();
        while let Some(b_off) = cursor {
            let block = self.read_block(b_off);
            if b_off > off {
                return false;
            }
            let b_end = b_off + block.size;
            if off < b_end {
                if off + count > b_end {
                    return false;
                }
                self.split_out(b_off, block, off, count);
                self.refresh_hint();
                return true;
            }
            cursor = block.next;
        }
        false
    }

    /// Remove `[off, off + count)` from the middle of `b_off`.
    fn split_out(&mut self, b_off: u16, block: FreeBlock, off: u16, count: u16) {
        let lead = off - b_off;
        let tail = (b_off + block.size) - (off + count);
        match (lead, tail) {
            (0, 0) => self.unlink(b_off, block),
            (0, _) => self.carve_front(b_off, block, count),
            (_, 0) => self.write_block(
                b_off,
                FreeBlock {
                    size: lead,
                    ..block
                },
            ),
            (_, _) => {
                let right = off + count;
                self.write_block(
                    b_off,
                    FreeBlock {
                        size: lead,
                        prev: block.prev,
                        next: Some(right),
                    },
                );
                self.write_block(
                    right,
                    FreeBlock {
                        size: tail,
                        prev: Some(b_off),
                        next: block.next,
                    },
                );
                if let Some(next) = block.next {
                    self.set_prev(next, Some(right));
                }
            }
        }
    }

    /// Return `[off, off + count)` to the list, coalescing with both
    /// neighbors. The range's PTEs must already be zero.
    pub fn free(&mut self, off: u16, count: u16) {
        debug_assert!(count >= 1 && (off + count) as usize <= ENTRY_COUNT);
        // Locate the blocks straddling the insertion point.
        let mut before: Option<(u16, FreeBlock)> = None;
        let mut after: Option<(u16, FreeBlock)> = None;
        let mut cursor = self.head();
        while let Some(b_off) = cursor {
            let block = self.read_block(b_off);
            if b_off < off {
                if b_off + block.size > off {
                    bugcheck!(Reason::Corrupted, "free of live range at offset {off}");
                }
                before = Some((b_off, block));
                cursor = block.next;
            } else {
                if off + count > b_off {
                    bugcheck!(Reason::Corrupted, "free of live range at offset {off}");
                }
                after = Some((b_off, block));
                break;
            }
        }

        let merge_left = matches!(before, Some((b_off, b)) if b_off + b.size == off);
        let merge_right = matches!(after, Some((a_off, _)) if off + count == a_off);

        match (merge_left, merge_right) {
            (true, true) => {
                let (left_off, mut left) = before.unwrap();
                let (right_off, right) = after.unwrap();
                left.size += count + right.size;
                left.next = right.next;
                self.write_block(left_off, left);
                if let Some(next) = right.next {
                    self.set_prev(next, Some(left_off));
                }
                self.clear(right_off);
            }
            (true, false) => {
                let (left_off, mut left) = before.unwrap();
                left.size += count;
                self.write_block(left_off, left);
            }
            (false, true) => {
                let (right_off, right) = after.unwrap();
                self.write_block(
                    right_off - count,
                    FreeBlock {
                        size: right.size + count,
                        ..right
                    },
                );
                if let Some(prev) = right.prev {
                    self.set_next(prev, Some(off));
                } else {
                    self.pde.set_head(off);
                }
                if let Some(next) = right.next {
                    self.set_prev(next, Some(off));
                }
                self.clear(right_off);
            }
            (false, false) => {
                let prev = before.map(|(b_off, _)| b_off);
                let next = after.map(|(a_off, _)| a_off);
                self.write_block(off, FreeBlock { size: count, prev, next });
                if let Some(prev) = prev {
                    self.set_next(prev, Some(off));
                } else {
                    self.pde.set_head(off);
                }
                if let Some(next) = next {
                    self.set_prev(next, Some(off));
                }
            }
        }
        self.refresh_hint();
    }

    /// Size of the largest block, walked from the list itself.
    pub fn max_block(&self) -> u16 {
        let mut max = 0;
        let mut cursor = self.head();
        while let Some(off) = cursor {
            let block = self.read_block(off);
            max = max.max(block.size);
            cursor = block.next;
        }
        max
    }

    fn refresh_hint(&mut self) {
        let max = self.max_block();
        self.pde.set_max_free(max);
    }

    /// Structural validation used by the test suite: ascending offsets,
    /// mutually-inverse links, no overlap, hint consistent with the walk.
    #[cfg(test)]
    pub fn check_consistency(&self) -> Result<u16, &'static str> {
        let mut total = 0u16;
        let mut max = 0u16;
        let mut prev: Option<u16> = None;
        let mut cursor = self.head();
        while let Some(off) = cursor {
            let block = self
                .pt
                .pte(off as usize)
                .free_head()
                .ok_or("head PTE does not decode")?;
            if block.prev != prev {
                return Err("prev link mismatch");
            }
            if let Some(p) = prev {
                let p_block = self.read_block(p);
                if p + p_block.size > off {
                    return Err("blocks overlap");
                }
                if p + p_block.size == off {
                    return Err("adjacent blocks left uncoalesced");
                }
            }
            total += block.size;
            max = max.max(block.size);
            prev = Some(off);
            cursor = block.next;
        }
        let hint = self.pde.max_free();
        let floored = if max == 0 {
            0
        } else {
            1 << (15 - max.leading_zeros())
        };
        if hint != floored {
            return Err("max-free hint out of date");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysicalAddress;

    fn fresh() -> (PageTable, Pde) {
        let mut pt = PageTable {
            entries: [0; ENTRY_COUNT],
        };
        let mut pde = Pde::table(PhysicalAddress::new(0x1000), false);
        FreeList::attach(&mut pt, &mut pde).init_full();
        (pt, pde)
    }

    #[test]
    fn init_covers_whole_table() {
        let (mut pt, mut pde) = fresh();
        let list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.check_consistency().unwrap(), 512);
        assert_eq!(pde.max_free(), 512);
        assert_eq!(pde.head(), 0);
    }

    #[test]
    fn carve_any_is_first_fit_low() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.carve_any(3), Some(0));
        assert_eq!(list.carve_any(5), Some(3));
        assert_eq!(list.check_consistency().unwrap(), 512 - 8);
        assert_eq!(pde.head(), 8);
    }

    #[test]
    fn carve_whole_table_empties_list() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.carve_any(512), Some(0));
        assert_eq!(list.check_consistency().unwrap(), 0);
        assert_eq!(pde.max_free(), 0);
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.carve_any(1), None);
    }

    #[test]
    fn carve_exact_splits_middle() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert!(list.carve_exact(100, 10));
        assert_eq!(list.check_consistency().unwrap(), 502);
        // Two blocks now: [0,100) and [110,512).
        assert_eq!(pde.head(), 0);
        let list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.read_block(0).size, 100);
        assert_eq!(list.read_block(110).size, 402);
        assert_eq!(list.read_block(0).next, Some(110));
        assert_eq!(list.read_block(110).prev, Some(0));
    }

    #[test]
    fn carve_exact_rejects_overlap() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert!(list.carve_exact(50, 10));
        assert!(!list.carve_exact(55, 10));
        assert!(!list.carve_exact(45, 10));
        assert!(!list.carve_exact(50, 10));
        assert_eq!(list.check_consistency().unwrap(), 502);
    }

    #[test]
    fn free_coalesces_both_sides() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert!(list.carve_exact(10, 30));
        // Free the middle third, then the flanks.
        list.free(20, 10);
        assert_eq!(list.check_consistency().unwrap(), 492);
        list.free(10, 10);
        assert_eq!(list.check_consistency().unwrap(), 502);
        list.free(30, 10);
        // Fully merged back into one maximal block.
        assert_eq!(list.check_consistency().unwrap(), 512);
        assert_eq!(list.read_block(0).size, 512);
        assert_eq!(pde.max_free(), 512);
    }

    #[test]
    fn free_merges_right_and_updates_head() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        // Consume [0, 8); the head moves to 8.
        assert_eq!(list.carve_any(8), Some(0));
        assert_eq!(pde.head(), 8);
        // Freeing [4, 8) merges with the block at 8 and moves the head down.
        let mut list = FreeList::attach(&mut pt, &mut pde);
        list.free(4, 4);
        assert_eq!(pde.head(), 4);
        let list = FreeList::attach(&mut pt, &mut pde);
        assert_eq!(list.read_block(4).size, 508);
        assert_eq!(list.check_consistency().unwrap(), 508);
    }

    #[test]
    fn reserve_release_restores_prior_state() {
        let (mut pt, mut pde) = fresh();
        let before = pt.entries;
        let off = {
            let mut list = FreeList::attach(&mut pt, &mut pde);
            list.carve_any(17).unwrap()
        };
        let mut list = FreeList::attach(&mut pt, &mut pde);
        list.free(off, 17);
        assert_eq!(pt.entries[..], before[..]);
    }

    #[test]
    #[should_panic(expected = "bugcheck[corrupted]")]
    fn double_free_bugchecks() {
        let (mut pt, mut pde) = fresh();
        let mut list = FreeList::attach(&mut pt, &mut pde);
        assert!(list.carve_exact(50, 10));
        list.free(50, 10);
        list.free(50, 10);
    }
}
