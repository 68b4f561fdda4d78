//! Shared-segment bookkeeping: the best-fit heap that carves a rank's
//! segment into allocations, and the per-job segment map used for
//! address translation between local-team peers.

use std::collections::BTreeMap;

use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{AllocResult, BadSharedAlloc};

/// Best-fit allocator over a contiguous region, indexed both by free
/// size and by free address so adjacent free blocks coalesce on free.
#[derive(Debug)]
pub(crate) struct HeapAlloc {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<addrs>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
    // aligned addr -> (block addr, block size)
    allocated: BTreeMap<usize, (usize, usize)>,
    start_addr: usize,
    max_size: usize,
}

impl HeapAlloc {
    pub(crate) fn new(start_addr: usize, size: usize) -> HeapAlloc {
        let mut sizes = BTreeMap::new();
        let mut temp = IndexSet::new();
        temp.insert(start_addr);
        sizes.insert(size, temp);
        let mut addrs = BTreeMap::new();
        addrs.insert(start_addr, size);
        HeapAlloc {
            sizes,
            addrs,
            allocated: BTreeMap::new(),
            start_addr,
            max_size: size,
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.allocated.values().map(|(_, size)| size).sum()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_size
    }

    /// Reserve `size` bytes whose start honors `align`. Returns the
    /// aligned address, or `None` when no free block fits.
    pub(crate) fn try_malloc(&mut self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let size = size.max(1);
        let mut found: Option<(usize, usize, usize)> = None; //(addr, fsize, aligned)
        'sizes: for (fsize, addrs) in self.sizes.range(size..) {
            for addr in addrs {
                let aligned = (addr + align - 1) & !(align - 1);
                if aligned + size <= addr + fsize {
                    found = Some((*addr, *fsize, aligned));
                    break 'sizes;
                }
            }
        }
        let (addr, fsize, aligned) = found?;
        self.remove_free(addr, fsize);
        // return any leading pad and trailing remainder to the free maps
        let lead = aligned - addr;
        if lead > 0 {
            self.insert_free(addr, lead);
        }
        let tail_addr = aligned + size;
        let tail = (addr + fsize) - tail_addr;
        if tail > 0 {
            self.insert_free(tail_addr, tail);
        }
        self.allocated.insert(aligned, (aligned, size));
        Some(aligned)
    }

    pub(crate) fn free(&mut self, addr: usize) {
        let (mut faddr, mut fsize) = match self.allocated.remove(&addr) {
            Some(entry) => entry,
            None => panic!("illegal free, addr not currently allocated: {:#x}", addr),
        };
        debug_assert!(faddr >= self.start_addr && faddr + fsize <= self.start_addr + self.max_size);
        // coalesce with the free neighbor below
        if let Some((&prev_addr, &prev_size)) = self.addrs.range(..faddr).next_back() {
            if prev_addr + prev_size == faddr {
                self.remove_free(prev_addr, prev_size);
                faddr = prev_addr;
                fsize += prev_size;
            }
        }
        // and above
        if let Some((&next_addr, &next_size)) = self.addrs.range(faddr..).next() {
            if faddr + fsize == next_addr {
                self.remove_free(next_addr, next_size);
                fsize += next_size;
            }
        }
        self.insert_free(faddr, fsize);
    }

    pub(crate) fn is_allocated(&self, addr: usize) -> bool {
        self.allocated.contains_key(&addr)
    }

    fn insert_free(&mut self, addr: usize, size: usize) {
        self.addrs.insert(addr, size);
        self.sizes.entry(size).or_insert_with(IndexSet::new).insert(addr);
    }

    fn remove_free(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut empty = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.shift_remove(&addr);
            empty = addrs.is_empty();
        }
        if empty {
            self.sizes.remove(&size);
        }
    }
}

/// The host shared heap of one rank: a [`HeapAlloc`] over the segment
/// the fabric registered, plus usage accounting.
#[derive(Debug)]
pub(crate) struct SharedHeap {
    alloc: Mutex<HeapAlloc>,
    base: usize,
    size: usize,
    used: AtomicUsize,
}

impl SharedHeap {
    pub(crate) fn new(base: usize, size: usize) -> SharedHeap {
        SharedHeap {
            alloc: Mutex::new(HeapAlloc::new(base, size)),
            base,
            size,
            used: AtomicUsize::new(0),
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate(&self, size: usize, align: usize) -> AllocResult<usize> {
        let mut alloc = self.alloc.lock();
        match alloc.try_malloc(size, align) {
            Some(addr) => {
                self.used.fetch_add(size.max(1), Ordering::SeqCst);
                Ok(addr)
            }
            None => Err(BadSharedAlloc {
                requested: size,
                used: alloc.used(),
                capacity: alloc.capacity(),
            }),
        }
    }

    pub(crate) fn deallocate(&self, addr: usize) {
        let mut alloc = self.alloc.lock();
        if !alloc.is_allocated(addr) {
            crate::misuse!("deallocate of address {:#x} that is not an allocation start", addr);
        }
        let (_, size) = *alloc
            .allocated
            .get(&addr)
            .expect("checked above");
        alloc.free(addr);
        self.used.fetch_sub(size.max(1), Ordering::SeqCst);
    }
}

/// Per-local-team translation data: for member `r` at local index
/// `i = r - local_lb`, `local = raw + translation[i]`, valid while
/// `local - base[i] < size[i]` (unsigned interval test).
#[derive(Debug)]
pub(crate) struct SegmentMap {
    local_lb: usize,
    bases: Vec<usize>,
    sizes: Vec<usize>,
    translation: Vec<isize>, // local minus remote
}

impl SegmentMap {
    pub(crate) fn new(
        local_lb: usize,
        bases: Vec<usize>,
        sizes: Vec<usize>,
        translation: Vec<isize>,
    ) -> SegmentMap {
        debug_assert_eq!(bases.len(), sizes.len());
        debug_assert_eq!(bases.len(), translation.len());
        SegmentMap {
            local_lb,
            bases,
            sizes,
            translation,
        }
    }

    pub(crate) fn contains_rank(&self, rank: usize) -> bool {
        rank >= self.local_lb && rank - self.local_lb < self.bases.len()
    }

    /// Translate a peer's raw address to a locally dereferenceable one.
    /// Null maps to null; out-of-segment addresses map to `None`.
    pub(crate) fn localize(&self, rank: usize, raw: usize) -> Option<usize> {
        if raw == 0 {
            return Some(0);
        }
        if !self.contains_rank(rank) {
            return None;
        }
        let i = rank - self.local_lb;
        let local = (raw as isize + self.translation[i]) as usize;
        if local.wrapping_sub(self.bases[i]) < self.sizes[i] {
            Some(local)
        } else {
            None
        }
    }

    pub(crate) fn segment_bounds(&self, rank: usize) -> Option<(usize, usize)> {
        if !self.contains_rank(rank) {
            return None;
        }
        let i = rank - self.local_lb;
        Some((self.bases[i], self.sizes[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_malloc_free_coalesce() {
        let mut alloc = HeapAlloc::new(0x1000, 1000);
        let a = alloc.try_malloc(50, 1).unwrap();
        let b = alloc.try_malloc(10, 1).unwrap();
        let c = alloc.try_malloc(600, 1).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1000 + 50);
        assert_eq!(c, 0x1000 + 60);
        alloc.free(a);
        // freed head block is reusable
        assert_eq!(alloc.try_malloc(30, 1), Some(0x1000));
        alloc.free(b);
        alloc.free(c);
        alloc.free(0x1000);
        // full coalescing: the original extent is whole again
        assert_eq!(alloc.try_malloc(1000, 1), Some(0x1000));
    }

    #[test]
    fn heap_alignment() {
        let mut alloc = HeapAlloc::new(0x1003, 4096);
        let a = alloc.try_malloc(16, 64).unwrap();
        assert_eq!(a % 64, 0);
        let b = alloc.try_malloc(16, 256).unwrap();
        assert_eq!(b % 256, 0);
        alloc.free(a);
        alloc.free(b);
    }

    #[test]
    fn heap_exhaustion() {
        let mut alloc = HeapAlloc::new(0, 128);
        assert!(alloc.try_malloc(128, 1).is_some());
        assert!(alloc.try_malloc(1, 1).is_none());
    }

    #[test]
    fn shared_heap_accounting_roundtrip() {
        let heap = SharedHeap::new(0x10000, 4096);
        let start = heap.used();
        for _ in 0..10 {
            let a = heap.allocate(100, 8).unwrap();
            let b = heap.allocate(200, 8).unwrap();
            heap.deallocate(a);
            heap.deallocate(b);
        }
        assert_eq!(heap.used(), start);
    }

    #[test]
    fn segment_map_translation() {
        // peer 1's segment lives at 0x4000 remotely but is mapped here at 0x9000
        let map = SegmentMap::new(0, vec![0x2000, 0x9000], vec![0x100, 0x100], vec![0, 0x5000]);
        assert_eq!(map.localize(1, 0x4010), Some(0x9010));
        assert_eq!(map.localize(1, 0x4200), None); // past the segment
        assert_eq!(map.localize(0, 0x2000), Some(0x2000));
        assert_eq!(map.localize(0, 0), Some(0));
        assert!(!map.contains_rank(2));
    }
}
