//! Growth and reclaim of heaps backed by a virtual backing provider

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use buddy_kmalloc::{AllocError, Heap, HeapConfig, HeapRegistry, VirtualBackingProvider};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const PAGE_SIZE: usize = 0x1000;
const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Mock backing provider
/// In a kernel this would allocate frames and map them. Here it only checks
/// that mappings stay contiguous and counts the pages and the calls.
struct MockBacking {
    mapped_end: AtomicUsize,
    mapped_pages: AtomicUsize,
    map_calls: AtomicUsize,
    /// Largest request served in one call, 0 for no limit.
    max_pages_per_call: AtomicUsize,
    exhausted: AtomicBool,
}

impl MockBacking {
    const fn new() -> Self {
        Self {
            mapped_end: AtomicUsize::new(0),
            mapped_pages: AtomicUsize::new(0),
            map_calls: AtomicUsize::new(0),
            max_pages_per_call: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    fn pages(&self) -> usize {
        self.mapped_pages.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }
}

impl VirtualBackingProvider for MockBacking {
    fn map_pages(&self, vaddr: usize, page_count: usize) -> bool {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        let limit = self.max_pages_per_call.load(Ordering::SeqCst);
        if self.exhausted.load(Ordering::SeqCst) || (limit != 0 && page_count > limit) {
            return false;
        }
        let end = self.mapped_end.load(Ordering::SeqCst);
        assert!(end == 0 || end == vaddr, "non-contiguous mapping at {:#x}", vaddr);
        self.mapped_end
            .store(vaddr + page_count * PAGE_SIZE, Ordering::SeqCst);
        self.mapped_pages.fetch_add(page_count, Ordering::SeqCst);
        true
    }

    fn unmap_pages(&self, vaddr: usize, page_count: usize) {
        assert_eq!(
            vaddr + page_count * PAGE_SIZE,
            self.mapped_end.load(Ordering::SeqCst)
        );
        self.mapped_end.store(vaddr, Ordering::SeqCst);
        self.mapped_pages.fetch_sub(page_count, Ordering::SeqCst);
    }
}

static GROW_BACKING: MockBacking = MockBacking::new();
static REFUSE_BACKING: MockBacking = MockBacking::new();
static REGISTRY_BACKING: MockBacking = MockBacking::new();
static SINGLE_MAP_BACKING: MockBacking = MockBacking::new();
static LIMITED_BACKING: MockBacking = MockBacking::new();

/// Node tree storage for a heap built from `config`.
fn metadata(config: &HeapConfig) -> &'static mut [u8] {
    Box::leak(vec![0u8; config.metadata_size()].into_boxed_slice())
}

fn growable_heap(
    base: usize,
    size: usize,
    max_size: usize,
    backing: &'static MockBacking,
) -> Heap<PAGE_SIZE> {
    let config = HeapConfig::new(base, size).growable(max_size);
    Heap::with_backing(config, metadata(&config), backing).unwrap()
}

#[test]
fn test_heap_grows_on_demand_and_shrinks_back() {
    let base = 0x10_0000_0000;
    let mut h = growable_heap(base, 64 * KB, 4 * MB, &GROW_BACKING);
    assert_eq!(GROW_BACKING.pages(), 16);

    let mut live = Vec::new();
    for _ in 0..64 {
        live.push(h.try_allocate(16 * KB).unwrap());
    }
    // 64 blocks of 16K need 1M, reached by doubling from 64K.
    assert_eq!(h.size(), MB);
    assert_eq!(GROW_BACKING.pages(), MB / PAGE_SIZE);
    assert_eq!(h.alloced_bytes(), MB);
    assert!(h.check().is_ok());

    // Freeing the upper half is not enough while the low half is in use.
    for addr in live.drain(32..) {
        h.free(addr, 16 * KB).unwrap();
    }
    assert_eq!(h.shrink(), 512 * KB);
    assert_eq!(h.size(), 512 * KB);
    assert_eq!(GROW_BACKING.pages(), 128);
    assert!(h.check().is_ok());

    for addr in live {
        h.free(addr, 16 * KB).unwrap();
    }
    assert_eq!(h.shrink(), 512 * KB - 64 * KB);
    assert_eq!(h.size(), 64 * KB);
    assert_eq!(GROW_BACKING.pages(), 16);
    assert!(h.snapshot().is_pristine());
}

#[test]
fn test_refused_growth_leaves_heap_consistent() {
    let base = 0x20_0000_0000;
    let mut h = growable_heap(base, 64 * KB, MB, &REFUSE_BACKING);
    let a = h.try_allocate(32 * KB).unwrap();
    let b = h.try_allocate(32 * KB).unwrap();

    REFUSE_BACKING.exhausted.store(true, Ordering::SeqCst);
    let before = h.snapshot();
    assert_eq!(h.try_allocate(32 * KB), Err(AllocError::GrowthFailed));
    assert_eq!(h.snapshot(), before);
    assert_eq!(h.size(), 64 * KB);
    assert_eq!(REFUSE_BACKING.pages(), 16);

    h.free(a, 32 * KB).unwrap();
    assert_eq!(h.try_allocate(32 * KB), Ok(a));
    h.free(a, 32 * KB).unwrap();
    h.free(b, 32 * KB).unwrap();
    assert!(h.snapshot().is_pristine());
}

#[test]
fn test_registry_growth_and_reclaim() {
    let config = HeapConfig::new(0x30_0000_0000, 128 * KB);
    let fixed = Heap::<PAGE_SIZE>::new(config, metadata(&config)).unwrap();
    let grower = growable_heap(0x40_0000_0000, 64 * KB, 2 * MB, &REGISTRY_BACKING);
    let registry = HeapRegistry::from_heaps([fixed, grower]).unwrap();

    // Priority is by capacity: the fixed 128K heap first.
    let a = registry.allocate(128 * KB).unwrap();
    assert_eq!(registry.find_heap_for_addr(a), Some(0));

    // The growable heap has to double twice for 256K.
    let b = registry.allocate(256 * KB).unwrap();
    assert_eq!(registry.find_heap_for_addr(b), Some(1));
    assert_eq!(registry.stats()[1].size, 256 * KB);

    // Past the reserved range the growable heap cannot help.
    assert_eq!(registry.allocate(4 * MB), Err(AllocError::TooLarge));

    // A refused growth is reported as out of memory.
    REGISTRY_BACKING.exhausted.store(true, Ordering::SeqCst);
    assert_eq!(registry.allocate(128 * KB), Err(AllocError::OutOfMemory));
    REGISTRY_BACKING.exhausted.store(false, Ordering::SeqCst);

    registry.free(b, 256 * KB).unwrap();
    registry.free(a, 128 * KB).unwrap();
    assert_eq!(registry.reclaim(), 256 * KB - 64 * KB);
    assert_eq!(REGISTRY_BACKING.pages(), 16);
    assert_eq!(registry.reclaim(), 0);
    assert!(registry.dump().iter().all(|s| s.is_pristine()));
    assert!(registry.check().is_ok());
}

#[test]
fn test_multi_step_growth_maps_once() {
    let base = 0x50_0000_0000;
    let mut h = growable_heap(base, 64 * KB, MB, &SINGLE_MAP_BACKING);
    let a = h.try_allocate(64 * KB).unwrap();
    assert_eq!(SINGLE_MAP_BACKING.calls(), 1);

    // Busy root: a 128K block needs two doublings, mapped in one call.
    let b = h.try_allocate(128 * KB).unwrap();
    assert_eq!(b, base + 128 * KB);
    assert_eq!(h.size(), 256 * KB);
    assert_eq!(SINGLE_MAP_BACKING.calls(), 2);
    assert_eq!(SINGLE_MAP_BACKING.pages(), 256 * KB / PAGE_SIZE);
    assert!(h.check().is_ok());

    h.free(a, 64 * KB).unwrap();
    h.free(b, 128 * KB).unwrap();
    assert_eq!(h.shrink(), 256 * KB - 64 * KB);
    assert_eq!(SINGLE_MAP_BACKING.pages(), 16);
}

#[test]
fn test_partially_refused_growth_keeps_nothing() {
    let base = 0x60_0000_0000;
    let mut h = growable_heap(base, 64 * KB, MB, &LIMITED_BACKING);
    h.try_allocate(64 * KB).unwrap();
    let before = h.snapshot();

    // One doubling would fit under the limit, but two are needed.
    LIMITED_BACKING.max_pages_per_call.store(16, Ordering::SeqCst);
    assert_eq!(h.try_allocate(128 * KB), Err(AllocError::GrowthFailed));
    assert_eq!(h.size(), 64 * KB);
    assert_eq!(LIMITED_BACKING.pages(), 16);
    assert_eq!(h.snapshot(), before);
    assert!(h.check().is_ok());

    // A single doubling still goes through.
    assert_eq!(h.try_allocate(64 * KB), Ok(base + 64 * KB));
    assert_eq!(h.size(), 128 * KB);
    assert_eq!(LIMITED_BACKING.pages(), 32);
}
