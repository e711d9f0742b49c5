//! Handle table
//!
//! A process-local, sparse map from small integers to counted object
//! references. Storage grows in whole pages of slots committed from the
//! kernel space; `top` tracks one past the highest ever-occupied slot and
//! walks back over trailing holes on close. Handles 0..4 are reserved for
//! assignment (image file and std streams) and never handed out by `put`.

use alloc::vec::Vec;

use core::ptr::NonNull;

use crate::bugcheck::Reason;
use crate::mm::vspace::kernel_space;
use crate::mm::PAGE_SIZE;
use crate::object::waitable::{KernelObject, ObjPtr};
use crate::sync::IrqRwLock;

/// Handles below this index are assign-only (0 = image, 1..4 = streams).
pub const RESERVED_HANDLES: u32 = 4;

type Slot = Option<ObjPtr>;

/// Object references per page of slots.
const SLOTS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<Slot>();
/// Pages the page-pointer array is provisioned for.
const TABLE_PAGES: usize = 8;
/// Largest handle value + 1.
const HANDLE_LIMIT: u32 = (TABLE_PAGES * SLOTS_PER_PAGE) as u32;

struct TableInner {
    pages: [Option<NonNull<Slot>>; TABLE_PAGES],
    /// One past the highest slot that ever held an object.
    top: u32,
    /// Occupied slots.
    count: u32,
}

// Slot pages and object pointers are only touched under the table lock.
unsafe impl Send for TableInner {}
unsafe impl Sync for TableInner {}

impl TableInner {
    /// Slot pointer, growing the backing store when `create` is set.
    fn slot(&mut self, index: u32, create: bool) -> Option<*mut Slot> {
        let page_idx = index as usize / SLOTS_PER_PAGE;
        if self.pages[page_idx].is_none() {
            if !create {
                return None;
            }
            let vm = kernel_space();
            let va = vm.reserve(0, 1);
            if va == 0 || !vm.commit(va, 1) {
                if va != 0 {
                    vm.release(va, 1);
                }
                return None;
            }
            let base = va as *mut Slot;
            for slot in 0..SLOTS_PER_PAGE {
                // SAFETY: freshly committed page, exclusively ours.
                unsafe { base.add(slot).write(None) };
            }
            self.pages[page_idx] = NonNull::new(base);
        }
        let base = self.pages[page_idx]?.as_ptr();
        // SAFETY: in-bounds slot of a live page.
        Some(unsafe { base.add(index as usize % SLOTS_PER_PAGE) })
    }

    fn read(&self, index: u32) -> Option<&Slot> {
        let page = self.pages[index as usize / SLOTS_PER_PAGE]?;
        // SAFETY: in-bounds slot of a live page; shared access under the
        // table lock.
        Some(unsafe { &*page.as_ptr().add(index as usize % SLOTS_PER_PAGE) })
    }
}

pub struct HandleTable {
    inner: IrqRwLock<TableInner>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: IrqRwLock::new(TableInner {
                pages: [None; TABLE_PAGES],
                top: 0,
                count: 0,
            }),
        }
    }

    /// Store an (already counted) reference in the first free slot at or
    /// beyond the reserved range. Returns the handle, 0 on exhaustion.
    pub fn put(&self, obj: ObjPtr) -> u32 {
        let mut inner = self.inner.write();
        let mut index = RESERVED_HANDLES;
        // Dense table: start at the top instead of rescanning the holes.
        if inner.count * 4 > inner.top * 3 {
            index = index.max(inner.top);
        }
        while index < HANDLE_LIMIT {
            let Some(slot) = inner.slot(index, true) else {
                break;
            };
            // SAFETY: slot pointer valid under the write lock.
            unsafe {
                if (*slot).is_some() {
                    index += 1;
                    continue;
                }
                *slot = Some(obj);
            }
            inner.count += 1;
            inner.top = inner.top.max(index + 1);
            return index;
        }
        0
    }

    /// Write a reserved slot (handles 0..4). Any previous occupant's
    /// reference is dropped.
    pub fn assign(&self, index: u32, obj: ObjPtr) -> bool {
        if index >= RESERVED_HANDLES {
            return false;
        }
        let displaced = {
            let mut inner = self.inner.write();
            let Some(slot) = inner.slot(index, true) else {
                return false;
            };
            // SAFETY: slot pointer valid under the write lock.
            let displaced = unsafe { core::mem::replace(&mut *slot, Some(obj)) };
            if displaced.is_none() {
                inner.count += 1;
                inner.top = inner.top.max(index + 1);
            }
            displaced
        };
        if let Some(old) = displaced {
            // SAFETY: the reference the slot held.
            unsafe { old.as_ref().relax() };
        }
        true
    }

    /// Null a slot and drop its reference; `top` walks back over trailing
    /// empties.
    pub fn close(&self, index: u32) -> bool {
        if index >= HANDLE_LIMIT {
            return false;
        }
        let removed = {
            let mut inner = self.inner.write();
            let Some(slot) = inner.slot(index, false) else {
                return false;
            };
            // SAFETY: slot pointer valid under the write lock.
            let removed = unsafe { (*slot).take() };
            if removed.is_none() {
                return false;
            }
            debug_assert!(inner.count > 0);
            inner.count -= 1;
            if index + 1 >= inner.top {
                let mut top = index;
                while top > 0 {
                    match inner.read(top - 1) {
                        Some(Some(_)) => break,
                        _ => top -= 1,
                    }
                }
                inner.top = top;
            }
            removed
        };
        if let Some(obj) = removed {
            // SAFETY: the reference the slot held.
            unsafe { obj.as_ref().relax() };
        }
        true
    }

    /// Resolve a handle to an acquired reference.
    pub fn get(&self, index: u32) -> Option<ObjPtr> {
        if index >= HANDLE_LIMIT {
            return None;
        }
        let inner = self.inner.read();
        let obj = (*inner.read(index)?)?;
        // SAFETY: the slot's reference keeps the object live under the
        // read lock.
        unsafe { obj.as_ref().acquire() }.then_some(obj)
    }

    /// Drop every held reference (process teardown).
    pub fn clear(&self) {
        let drained: Vec<ObjPtr> = {
            let mut inner = self.inner.write();
            let mut drained = Vec::new();
            for index in 0..inner.top {
                if let Some(slot) = inner.slot(index, false) {
                    // SAFETY: slot pointer valid under the write lock.
                    if let Some(obj) = unsafe { (*slot).take() } {
                        drained.push(obj);
                    }
                }
            }
            inner.count = 0;
            inner.top = 0;
            drained
        };
        for obj in drained {
            // SAFETY: the references the slots held.
            unsafe { obj.as_ref().relax() };
        }
    }

    pub fn count(&self) -> u32 {
        self.inner.read().count
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        let inner = self.inner.write();
        if inner.count != 0 {
            bugcheck!(Reason::Corrupted, "dropping handle table with {} live handles", inner.count);
        }
        let vm = kernel_space();
        for page in inner.pages.iter().flatten() {
            if !vm.release(page.as_ptr() as u64, 1) {
                bugcheck!(Reason::Corrupted, "handle page release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::object::waitable::KernelObject;
    use crate::object::Event;

    fn counted_event() -> (&'static Event, ObjPtr) {
        let event = Event::create(false);
        let obj: &dyn KernelObject = event;
        (event, ObjPtr::from(obj))
    }

    #[test]
    fn put_skips_the_reserved_range() {
        testing::init();
        let table = HandleTable::new();
        let (_, obj) = counted_event();
        let handle = table.put(obj);
        assert_eq!(handle, RESERVED_HANDLES);
        assert_eq!(table.count(), 1);

        let resolved = table.get(handle).unwrap();
        // SAFETY: get() acquired the reference.
        unsafe { resolved.as_ref().relax() };

        assert!(table.close(handle));
        assert!(!table.close(handle));
        assert_eq!(table.count(), 0);
        assert!(table.get(handle).is_none());
    }

    #[test]
    fn assign_is_reserved_only_and_replaces() {
        testing::init();
        let table = HandleTable::new();
        let (first, obj_first) = counted_event();
        assert!(first.acquire()); // keep it observable past the replace
        assert!(table.assign(0, obj_first));
        let (_, obj_second) = counted_event();
        assert!(!table.assign(RESERVED_HANDLES, obj_second));
        // Replacing slot 0 drops the old occupant's table reference.
        assert!(table.assign(0, obj_second));
        assert_eq!(first.waitable().ref_count(), 1);
        assert!(!first.relax());
        assert_eq!(table.count(), 1);
        table.clear();
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn top_walks_back_over_trailing_holes() {
        testing::init();
        let table = HandleTable::new();
        let handles: [u32; 3] = core::array::from_fn(|_| {
            let (_, obj) = counted_event();
            table.put(obj)
        });
        assert_eq!(handles, [4, 5, 6]);
        // Closing the middle leaves top alone; closing the tail walks it
        // back over the hole.
        assert!(table.close(handles[1]));
        assert!(table.close(handles[2]));
        let (_, obj) = counted_event();
        // Dense-table heuristic aside, the hole at 5 is the first free.
        let reused = table.put(obj);
        assert_eq!(reused, 5);
        table.clear();
    }

    #[test]
    fn clear_drops_every_reference() {
        testing::init();
        let table = HandleTable::new();
        let (event, obj) = counted_event();
        assert!(event.acquire());
        assert_eq!(table.put(obj), RESERVED_HANDLES);
        table.clear();
        assert_eq!(table.count(), 0);
        assert_eq!(event.waitable().ref_count(), 1);
        assert!(!event.relax());
    }
}
