//! End-to-end virtual-memory scenarios against the public surface: user
//! spaces over private frame pools, with real stores through committed
//! addresses (host arenas back the mapped ranges).

use lumen_kernel::boot::testing;
use lumen_kernel::mm::frame::FramePool;
use lumen_kernel::mm::vspace::UserSpace;
use lumen_kernel::mm::{PageAttr, PAGE_SIZE};

const PT_SPAN: u64 = 512 * PAGE_SIZE as u64;

fn fresh_user(frames: usize) -> (&'static FramePool, UserSpace) {
    let harness = testing::init();
    let pool = FramePool::host_arena(frames);
    let space = UserSpace::new(pool, harness.user_base, None).expect("user space");
    (pool, space)
}

#[test]
fn small_reserve_commit_write_release() {
    let (pool, space) = fresh_user(64);

    let va = space.reserve(0, 1);
    assert_ne!(va, 0);
    assert_eq!(va % PAGE_SIZE as u64, 0);
    // The page table faulted in by the reservation stays with the space;
    // commit/release must balance from here.
    let baseline = pool.available();
    assert!(space.commit(va, 1));

    // The committed page is real memory: store and load through it.
    unsafe {
        core::ptr::write_volatile(va as *mut u64, 0xA5A5_5A5A_0123_4567);
        assert_eq!(core::ptr::read_volatile(va as *const u64), 0xA5A5_5A5A_0123_4567);
    }

    assert!(space.release(va, 1));
    assert_eq!(pool.available(), baseline);
}

#[test]
fn large_reservation_lands_on_a_2m_boundary() {
    let (_pool, space) = fresh_user(64);
    let va = space.reserve(0, 1024);
    assert_ne!(va, 0);
    assert_eq!((va - space.base().as_u64()) % PT_SPAN, 0);
    // Both PTs are wholly reserved.
    for page in [0u64, 1, 511, 512, 1023] {
        let pte = space.peek(va + page * PAGE_SIZE as u64);
        assert!(pte.preserve() && !pte.present());
    }
    assert!(space.release(va, 1024));
}

#[test]
fn overlapping_fixed_reserve_is_rejected_without_damage() {
    let (_pool, space) = fresh_user(64);
    let va = space.reserve(0, 1);
    assert_ne!(va, 0);
    assert_eq!(space.reserve(va, 1), 0);
    assert!(space.release(va, 1));
    assert_eq!(space.peek(va).0, 0);
}

#[test]
fn commit_then_release_returns_every_frame() {
    let (pool, space) = fresh_user(128);
    let va = space.reserve(0, 24);
    let baseline = pool.available();
    assert!(space.commit(va, 24));
    assert!(pool.available() < baseline);
    assert!(space.release(va, 24));
    assert_eq!(pool.available(), baseline);
}

#[test]
fn reserve_release_is_idempotent_on_the_tables() {
    let (_pool, space) = fresh_user(64);
    let first = space.reserve(0, 5);
    assert_ne!(first, 0);
    assert!(space.release(first, 5));
    // The space returns to its prior shape: the same request lands on the
    // same base again.
    let second = space.reserve(0, 5);
    assert_eq!(first, second);
    assert!(space.release(second, 5));
}

#[test]
fn protect_narrows_and_peek_reflects_it() {
    let (_pool, space) = fresh_user(64);
    let va = space.reserve(0, 2);
    assert!(space.commit(va, 2));
    let before = space.peek(va);
    assert!(before.write() && before.xd());

    assert!(space.protect(va, 2, PageAttr::XD));
    let read_only = space.peek(va);
    assert!(!read_only.write() && read_only.xd());

    // Unknown attribute bits never reach the tables.
    assert!(PageAttr::from_bits(1 << 7).is_none());
    assert!(space.release(va, 2));
}

#[test]
fn teardown_returns_paging_structures() {
    testing::init();
    let pool = FramePool::host_arena(128);
    let baseline = pool.available();
    {
        let space =
            UserSpace::new(pool, testing::init().user_base, None).expect("user space");
        let a = space.reserve(0, 8);
        assert!(space.commit(a, 8));
        let b = space.reserve(0, 600);
        assert_ne!(b, 0);
        // Dropped with ranges still live: teardown walks the tree.
    }
    assert_eq!(pool.available(), baseline);
}

#[test]
fn buffer_validation_tracks_protection() {
    let (_pool, space) = fresh_user(64);
    let va = space.reserve(0, 2);
    assert!(space.commit(va, 2));
    assert!(space.validate(va, 2 * PAGE_SIZE, true).is_some());
    assert!(space.protect(va, 2, PageAttr::XD));
    assert!(space.validate(va, 2 * PAGE_SIZE, true).is_none());
    assert!(space.validate(va, 2 * PAGE_SIZE, false).is_some());
    // Out-of-space and uncommitted ranges refuse.
    assert!(space.validate(0x10, 8, false).is_none());
    assert!(space
        .validate(va + 2 * PAGE_SIZE as u64, 8, false)
        .is_none());
    assert!(space.release(va, 2));
}

#[test]
fn pool_accounting_respects_reservations() {
    let pool = FramePool::host_arena(16);
    assert_eq!(pool.available(), 16);
    assert!(pool.reserve(10));
    assert_eq!(pool.available(), 6);
    assert!(!pool.reserve(7));
}
