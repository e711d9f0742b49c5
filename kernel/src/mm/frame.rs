//! Physical frame pool
//!
//! A bitmap allocator over a contiguous physical region. The virtual-space
//! manager consumes exactly this contract: `allocate` (with a must-succeed
//! flag), `release`, `reserve`+`TAKE` for all-or-nothing commits, and
//! `available` as a lower-bound estimate.

use alloc::vec;
use alloc::vec::Vec;

use crate::bugcheck::Reason;
use crate::sync::IrqMutex;

use super::{PhysicalAddress, PAGE_SIZE};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Failure is a bugcheck instead of `None`.
        const MUST_SUCCEED = 1 << 0;
        /// Consume one frame from a prior `reserve` batch.
        const TAKE = 1 << 1;
    }
}

struct PoolInner {
    bitmap: Vec<u64>,
    free: usize,
    reserved: usize,
    hint: usize,
}

/// Bitmap frame pool over `[base, base + frames * PAGE_SIZE)`.
pub struct FramePool {
    base: u64,
    frames: usize,
    inner: IrqMutex<PoolInner>,
}

impl FramePool {
    /// Build a pool over a physical region with every frame initially free.
    /// Boot code masks out firmware- and kernel-owned frames afterwards via
    /// [`FramePool::mark_used`].
    pub fn from_region(base: PhysicalAddress, frames: usize) -> Self {
        debug_assert!(base.is_page_aligned());
        let words = frames.div_ceil(64);
        let mut bitmap = vec![0u64; words];
        // Tail bits beyond `frames` are permanently used.
        for idx in frames..words * 64 {
            bitmap[idx / 64] |= 1 << (idx % 64);
        }
        Self {
            base: base.as_u64(),
            frames,
            inner: IrqMutex::new(PoolInner {
                bitmap,
                free: frames,
                reserved: 0,
                hint: 0,
            }),
        }
    }

    /// Leak a heap-backed arena and manage it as physical memory. Host
    /// builds only: frame addresses are real pointers, so page tables built
    /// from this pool can be walked directly.
    #[cfg(not(target_os = "none"))]
    pub fn host_arena(frames: usize) -> &'static FramePool {
        let layout =
            core::alloc::Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size; the block is leaked and never
        // freed, giving the pool a 'static region.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        let pool = FramePool::from_region(PhysicalAddress::new(base as u64), frames);
        alloc::boxed::Box::leak(alloc::boxed::Box::new(pool))
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        let addr = pa.as_u64();
        if addr < self.base || !pa.is_page_aligned() {
            return None;
        }
        let idx = ((addr - self.base) as usize) / PAGE_SIZE;
        (idx < self.frames).then_some(idx)
    }

    /// Permanently remove `count` frames starting at `pa` from the pool.
    pub fn mark_used(&self, pa: PhysicalAddress, count: usize) {
        let Some(first) = self.index_of(pa) else {
            bugcheck!(Reason::OutOfRange, "mark_used {:#x}", pa.as_u64());
        };
        let mut inner = self.inner.lock();
        for idx in first..first + count {
            if idx >= self.frames {
                bugcheck!(Reason::OutOfRange, "mark_used run past pool end");
            }
            if inner.bitmap[idx / 64] & (1 << (idx % 64)) == 0 {
                inner.bitmap[idx / 64] |= 1 << (idx % 64);
                inner.free -= 1;
            }
        }
    }

    /// Allocate one 4 KiB frame. Returns `None` on exhaustion unless
    /// `MUST_SUCCEED` turns that into a bugcheck.
    pub fn allocate(&self, flags: AllocFlags) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        if flags.contains(AllocFlags::TAKE) {
            if inner.reserved == 0 {
                bugcheck!(Reason::Corrupted, "TAKE without reservation");
            }
            inner.reserved -= 1;
        } else if inner.free <= inner.reserved {
            drop(inner);
            if flags.contains(AllocFlags::MUST_SUCCEED) {
                bugcheck!(Reason::BadAlloc, "frame pool exhausted");
            }
            return None;
        }

        let words = inner.bitmap.len();
        let start_word = inner.hint / 64;
        for step in 0..words {
            let w = (start_word + step) % words;
            let word = inner.bitmap[w];
            if word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let idx = w * 64 + bit;
                inner.bitmap[w] |= 1 << bit;
                inner.free -= 1;
                inner.hint = idx;
                return Some(PhysicalAddress::new(self.base + (idx * PAGE_SIZE) as u64));
            }
        }
        // The counters said a frame existed.
        bugcheck!(Reason::Corrupted, "frame bitmap out of sync");
    }

    /// Return a frame to the pool.
    pub fn release(&self, pa: PhysicalAddress) {
        let Some(idx) = self.index_of(pa) else {
            bugcheck!(Reason::OutOfRange, "release of foreign frame {:#x}", pa.as_u64());
        };
        let mut inner = self.inner.lock();
        if inner.bitmap[idx / 64] & (1 << (idx % 64)) == 0 {
            bugcheck!(Reason::Corrupted, "double release of frame {:#x}", pa.as_u64());
        }
        inner.bitmap[idx / 64] &= !(1 << (idx % 64));
        inner.free += 1;
        inner.hint = inner.hint.min(idx);
    }

    /// Atomically set aside `count` frames for the caller to consume with
    /// `allocate(TAKE)`. Used by commit for all-or-nothing semantics.
    pub fn reserve(&self, count: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.free - inner.reserved >= count {
            inner.reserved += count;
            true
        } else {
            false
        }
    }

    /// Lower-bound estimate of allocatable frames.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner.free - inner.reserved
    }

    pub fn total(&self) -> usize {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_release_roundtrip() {
        let pool = FramePool::from_region(PhysicalAddress::new(0x10_0000), 8);
        assert_eq!(pool.available(), 8);
        let a = pool.allocate(AllocFlags::empty()).unwrap();
        let b = pool.allocate(AllocFlags::empty()).unwrap();
        assert_ne!(a, b);
        assert!(a.is_page_aligned() && b.is_page_aligned());
        assert_eq!(pool.available(), 6);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = FramePool::from_region(PhysicalAddress::new(0), 2);
        assert!(pool.allocate(AllocFlags::empty()).is_some());
        assert!(pool.allocate(AllocFlags::empty()).is_some());
        assert!(pool.allocate(AllocFlags::empty()).is_none());
    }

    #[test]
    fn reservation_guards_frames() {
        let pool = FramePool::from_region(PhysicalAddress::new(0), 4);
        assert!(pool.reserve(3));
        assert_eq!(pool.available(), 1);
        // Plain allocation cannot dip into the reserved batch.
        assert!(pool.allocate(AllocFlags::empty()).is_some());
        assert!(pool.allocate(AllocFlags::empty()).is_none());
        // The reservation holder can.
        for _ in 0..3 {
            assert!(pool.allocate(AllocFlags::TAKE).is_some());
        }
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn over_reservation_rejected() {
        let pool = FramePool::from_region(PhysicalAddress::new(0), 4);
        assert!(!pool.reserve(5));
        assert!(pool.reserve(4));
        assert!(!pool.reserve(1));
    }

    #[test]
    fn mark_used_removes_frames() {
        let pool = FramePool::from_region(PhysicalAddress::new(0x4000), 4);
        pool.mark_used(PhysicalAddress::new(0x5000), 2);
        assert_eq!(pool.available(), 2);
        let a = pool.allocate(AllocFlags::empty()).unwrap();
        let b = pool.allocate(AllocFlags::empty()).unwrap();
        assert!(a.as_u64() == 0x4000 || a.as_u64() == 0x7000);
        assert!(b.as_u64() == 0x4000 || b.as_u64() == 0x7000);
    }

    #[test]
    #[should_panic(expected = "bugcheck[corrupted]")]
    fn double_release_bugchecks() {
        let pool = FramePool::from_region(PhysicalAddress::new(0), 2);
        let a = pool.allocate(AllocFlags::empty()).unwrap();
        pool.release(a);
        pool.release(a);
    }

    #[test]
    #[should_panic(expected = "bugcheck[bad_alloc]")]
    fn must_succeed_bugchecks_on_exhaustion() {
        let pool = FramePool::from_region(PhysicalAddress::new(0), 1);
        let _ = pool.allocate(AllocFlags::empty()).unwrap();
        let _ = pool.allocate(AllocFlags::MUST_SUCCEED);
    }
}
