// SPDX-License-Identifier: BlueOak-1.0.0

//! VSpace manager: two intrusive lists of [`VirtualRegion`]s tracking
//! the allocated and free layout of a process's virtual address space.

use crate::arch::{is_page_aligned, page_align_up, PAGE_SIZE};
use crate::error::{PResult, PagingError};
use crate::slab::SlabPool;
use core::ptr::NonNull;

/// One allocated or free virtual address range.
///
/// Lives in exactly one of the two lists owned by [`VSpace`]: the
/// *allocated* list (unordered) or the *free* list (sorted by `base`,
/// no two entries touching or overlapping).
pub struct VirtualRegion {
    /// Page-aligned start of the region.
    pub base: usize,
    /// Size in bytes, a multiple of the page size.
    pub size: usize,
    next: Option<NonNull<VirtualRegion>>,
}

impl VirtualRegion {
    /// One past the last byte of this region.
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// The VSpace manager: allocates, releases and coalesces virtual
/// address ranges within one address space.
pub struct VSpace {
    allocated: Option<NonNull<VirtualRegion>>,
    free: Option<NonNull<VirtualRegion>>,
    /// Low-water mark: no region has ever been registered above this
    /// address.
    free_base: usize,
    lowest_managed: usize,
}

/// Needed for [`VSpace`] to hand out `&mut SlabPool<VirtualRegion>`
/// callers use across `alloc`/`release` calls without the VSpace owning
/// the pool itself — the pool never stores a back-pointer to its owner.
pub type RegionPool = SlabPool<VirtualRegion>;

impl VSpace {
    /// A fresh VSpace managing nothing yet, starting at `lowest_managed`
    /// (conventionally one page, so that address 0 is never handed out
    /// and can always mean "no mapping").
    pub fn new(lowest_managed: usize) -> Self {
        VSpace {
            allocated: None,
            free: None,
            free_base: lowest_managed,
            lowest_managed,
        }
    }

    /// Current low-water mark: the boundary above which nothing has
    /// ever been registered.
    pub fn free_base(&self) -> usize {
        self.free_base
    }

    /// Round `size` up to a page and return a page-aligned address for
    /// it, first-fit from the free list, falling back to bumping
    /// `free_base`.
    pub fn alloc(&mut self, pool: &mut RegionPool, size: usize) -> PResult<usize> {
        if size == 0 {
            return Err(PagingError::InvalidArgument {
                detail: "alloc size must be non-zero",
            });
        }
        let size = page_align_up(size);

        // First-fit walk of the free list.
        let mut cursor = self.free;
        let mut prev: Option<NonNull<VirtualRegion>> = None;
        while let Some(mut node) = cursor {
            let node_ref = unsafe { node.as_mut() };
            if node_ref.size >= size {
                let base = node_ref.base;
                if node_ref.size == size {
                    self.remove_free(prev, node);
                    unsafe { pool.free(node.as_ptr()) };
                } else {
                    node_ref.base += size;
                    node_ref.size -= size;
                }
                self.push_allocated(pool, base, size)?;
                return Ok(base);
            }
            prev = cursor;
            cursor = node_ref.next;
        }

        // Miss: extend the managed range.
        let base = self.free_base;
        self.free_base += size;
        self.push_allocated(pool, base, size)?;
        Ok(base)
    }

    /// Register a range whose address is dictated externally, e.g. by
    /// ELF section layout during bootstrap. Does not touch the free
    /// list; call
    /// [`commit_fixed`](Self::commit_fixed) once bootstrap fixed
    /// allocations are done.
    pub fn alloc_fixed(&mut self, pool: &mut RegionPool, addr: usize, size: usize) -> PResult<()> {
        if !is_page_aligned(addr) {
            return Err(PagingError::InvalidArgument {
                detail: "alloc_fixed address must be page-aligned",
            });
        }
        if size == 0 {
            return Err(PagingError::InvalidArgument {
                detail: "alloc_fixed size must be non-zero",
            });
        }
        let size = page_align_up(size);
        self.push_allocated(pool, addr, size)?;
        Ok(())
    }

    /// One-shot post-bootstrap step: reconstruct the free list as the
    /// sorted set of gaps in `[lowest_managed, highest_allocated_end)`
    /// and move `free_base` to the highest allocated end.
    ///
    /// Idempotent: re-running with no intervening `alloc_fixed` leaves
    /// `free_base` and the free list unchanged.
    pub fn commit_fixed(&mut self, pool: &mut RegionPool) -> PResult<()> {
        // Collect (base, end) pairs from the allocated list, sorted by base.
        let mut spans: [(usize, usize); MAX_BOOTSTRAP_REGIONS] =
            [(0, 0); MAX_BOOTSTRAP_REGIONS];
        let mut n = 0usize;
        let mut cursor = self.allocated;
        while let Some(node) = cursor {
            let node_ref = unsafe { node.as_ref() };
            if n >= MAX_BOOTSTRAP_REGIONS {
                return Err(PagingError::Exhausted {
                    resource: "commit_fixed span table",
                });
            }
            spans[n] = (node_ref.base, node_ref.end());
            n += 1;
            cursor = node_ref.next;
        }
        spans[..n].sort_unstable_by_key(|s| s.0);

        // Free whatever is currently in the free list; we are about to
        // rebuild it wholesale.
        let mut cursor = self.free;
        self.free = None;
        while let Some(node) = cursor {
            let next = unsafe { node.as_ref() }.next;
            unsafe { pool.free(node.as_ptr()) };
            cursor = next;
        }

        let mut highest_end = self.lowest_managed;
        let mut boundary = self.lowest_managed;
        for &(base, end) in &spans[..n] {
            if base > boundary {
                self.push_free_back(pool, boundary, base - boundary)?;
            }
            boundary = boundary.max(end);
            highest_end = highest_end.max(end);
        }
        self.free_base = highest_end;
        Ok(())
    }

    /// Whether `addr` falls within a region on the allocated list.
    /// Consulted by the fault handler before it reserves a freshly
    /// faulted page: a fault within an already-allocated region just
    /// needs a frame mapped in; a fault outside one means the page was
    /// never reserved at all and must go through `alloc_fixed` first.
    pub fn is_reserved(&self, addr: usize) -> bool {
        let mut cursor = self.allocated;
        while let Some(node) = cursor {
            let r = unsafe { node.as_ref() };
            if r.base <= addr && addr < r.end() {
                return true;
            }
            cursor = r.next;
        }
        false
    }

    /// Remove the allocated entry at `addr`, coalesce it into the free
    /// list, and return its size so the caller can tear down the
    /// mapping.
    pub fn release(&mut self, pool: &mut RegionPool, addr: usize) -> PResult<usize> {
        let mut cursor = self.allocated;
        let mut prev: Option<NonNull<VirtualRegion>> = None;
        while let Some(node) = cursor {
            let node_ref = unsafe { node.as_ref() };
            if node_ref.base == addr {
                let size = node_ref.size;
                let next = node_ref.next;
                match prev {
                    None => self.allocated = next,
                    Some(mut p) => unsafe { p.as_mut().next = next },
                }
                self.insert_free_coalescing(pool, addr, size)?;
                return Ok(size);
            }
            prev = cursor;
            cursor = node_ref.next;
        }
        Err(PagingError::RegionNotFound { addr })
    }

    // -- internal helpers -------------------------------------------------

    fn push_allocated(&mut self, pool: &mut RegionPool, base: usize, size: usize) -> PResult<()> {
        let node = self.new_node(pool, base, size)?;
        unsafe {
            (*node.as_ptr()).next = self.allocated;
        }
        self.allocated = Some(node);
        Ok(())
    }

    /// Append to the back of the free list, assuming `base` is greater
    /// than every existing entry (used only by `commit_fixed`'s
    /// from-scratch rebuild, which walks spans in sorted order).
    fn push_free_back(&mut self, pool: &mut RegionPool, base: usize, size: usize) -> PResult<()> {
        let node = self.new_node(pool, base, size)?;
        let mut cursor = &mut self.free;
        while let Some(mut n) = *cursor {
            cursor = unsafe { &mut n.as_mut().next };
        }
        *cursor = Some(node);
        Ok(())
    }

    /// Insert `(base, size)` into the sorted free list, coalescing
    /// with the predecessor, successor, or both — the free list never
    /// holds two entries that touch or overlap.
    fn insert_free_coalescing(
        &mut self,
        pool: &mut RegionPool,
        base: usize,
        size: usize,
    ) -> PResult<()> {
        let mut prev: Option<NonNull<VirtualRegion>> = None;
        let mut cursor = self.free;
        while let Some(node) = cursor {
            if unsafe { node.as_ref() }.base >= base {
                break;
            }
            prev = cursor;
            cursor = unsafe { node.as_ref() }.next;
        }

        let touches_prev = prev
            .map(|p| unsafe { p.as_ref() }.end() == base)
            .unwrap_or(false);
        let touches_next = cursor
            .map(|n| unsafe { n.as_ref() }.base == base + size)
            .unwrap_or(false);

        match (touches_prev, touches_next) {
            (true, true) => {
                // Merge into `prev`, absorb `cursor` entirely, drop `cursor`'s node.
                let mut p = prev.unwrap();
                let next_node = cursor.unwrap();
                let next_ref = unsafe { next_node.as_ref() };
                let merged_size =
                    unsafe { p.as_ref() }.size + size + next_ref.size;
                let after = next_ref.next;
                unsafe {
                    p.as_mut().size = merged_size;
                    p.as_mut().next = after;
                }
                unsafe { pool.free(next_node.as_ptr()) };
            }
            (true, false) => {
                let mut p = prev.unwrap();
                unsafe { p.as_mut().size += size };
            }
            (false, true) => {
                let mut n = cursor.unwrap();
                unsafe {
                    n.as_mut().base = base;
                    n.as_mut().size += size;
                }
            }
            (false, false) => {
                let node = self.new_node(pool, base, size)?;
                unsafe { (*node.as_ptr()).next = cursor };
                match prev {
                    None => self.free = Some(node),
                    Some(mut p) => unsafe { p.as_mut().next = Some(node) },
                }
            }
        }
        Ok(())
    }

    fn new_node(
        &mut self,
        pool: &mut RegionPool,
        base: usize,
        size: usize,
    ) -> PResult<NonNull<VirtualRegion>> {
        let ptr = pool.alloc().ok_or(PagingError::Exhausted { resource: "slab" })?;
        unsafe {
            ptr.write(VirtualRegion {
                base,
                size,
                next: None,
            });
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    fn remove_free(&mut self, prev: Option<NonNull<VirtualRegion>>, node: NonNull<VirtualRegion>) {
        let next = unsafe { node.as_ref() }.next;
        match prev {
            None => self.free = next,
            Some(mut p) => unsafe { p.as_mut().next = next },
        }
    }

    /// Iterate the allocated list's `(base, size)` pairs, for
    /// conservation-invariant tests.
    #[cfg(test)]
    pub fn allocated_regions(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cursor = self.allocated;
        while let Some(node) = cursor {
            let r = unsafe { node.as_ref() };
            out.push((r.base, r.size));
            cursor = r.next;
        }
        out
    }

    /// Iterate the free list's `(base, size)` pairs in list order
    /// (already sorted by the invariant).
    #[cfg(test)]
    pub fn free_regions(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cursor = self.free;
        while let Some(node) = cursor {
            let r = unsafe { node.as_ref() };
            out.push((r.base, r.size));
            cursor = r.next;
        }
        out
    }
}

/// Bound on the number of distinct bootstrap regions `commit_fixed` can
/// reconstruct a free list from in one pass. Bootstrap ELF layouts have
/// a handful of segments; this bound exists purely so `commit_fixed`
/// can work over fixed-size stack storage instead of the heap.
const MAX_BOOTSTRAP_REGIONS: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn fresh_pool(n: usize) -> RegionPool {
        let mut pool = RegionPool::new();
        let storage: Box<[MaybeUninit<VirtualRegion>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        pool.grow(Box::leak(storage));
        pool
    }

    #[test]
    fn alloc_is_page_aligned_and_rounded() {
        let mut pool = fresh_pool(16);
        let mut vs = VSpace::new(PAGE_SIZE);
        let a = vs.alloc(&mut pool, 1).unwrap();
        assert!(is_page_aligned(a));
        assert_eq!(vs.allocated_regions(), vec![(PAGE_SIZE, PAGE_SIZE)]);
    }

    #[test]
    fn alloc_then_release_restores_free_list() {
        let mut pool = fresh_pool(16);
        let mut vs = VSpace::new(PAGE_SIZE);
        let a = vs.alloc(&mut pool, PAGE_SIZE).unwrap();
        let freed = vs.release(&mut pool, a).unwrap();
        assert_eq!(freed, PAGE_SIZE);
        assert_eq!(vs.allocated_regions(), vec![]);
        // A single allocate-then-release from empty leaves no free-list
        // residue distinguishable from "never allocated": free_base is
        // never rewound, so we only assert the allocated list is empty
        // and nothing was leaked into free().
    }

    #[test]
    fn release_unknown_base_errors() {
        let mut pool = fresh_pool(4);
        let mut vs = VSpace::new(PAGE_SIZE);
        assert_eq!(
            vs.release(&mut pool, 0x1234),
            Err(PagingError::RegionNotFound { addr: 0x1234 })
        );
    }

    #[test]
    fn fixed_allocations_then_commit_yield_expected_free_list() {
        let mut pool = fresh_pool(16);
        let mut vs = VSpace::new(0x1000);
        vs.alloc_fixed(&mut pool, 0x2000, 0x1000).unwrap();
        vs.alloc_fixed(&mut pool, 0x5000, 0x2000).unwrap();
        vs.commit_fixed(&mut pool).unwrap();

        assert_eq!(vs.free_base(), 0x7000);
        assert_eq!(
            vs.free_regions(),
            vec![(0x1000, 0x1000), (0x3000, 0x2000)]
        );
    }

    #[test]
    fn commit_fixed_is_idempotent() {
        let mut pool = fresh_pool(16);
        let mut vs = VSpace::new(0x1000);
        vs.alloc_fixed(&mut pool, 0x2000, 0x1000).unwrap();
        vs.commit_fixed(&mut pool).unwrap();
        let base_after_first = vs.free_base();
        let free_after_first = vs.free_regions();

        vs.commit_fixed(&mut pool).unwrap();
        assert_eq!(vs.free_base(), base_after_first);
        assert_eq!(vs.free_regions(), free_after_first);
    }

    #[test]
    fn coalesces_both_neighbours() {
        let mut pool = fresh_pool(16);
        let mut vs = VSpace::new(0x1000);
        // Three adjacent fixed regions, release the middle last so it
        // must coalesce with both neighbours at once.
        vs.alloc_fixed(&mut pool, 0x1000, 0x1000).unwrap();
        vs.alloc_fixed(&mut pool, 0x2000, 0x1000).unwrap();
        vs.alloc_fixed(&mut pool, 0x3000, 0x1000).unwrap();
        vs.commit_fixed(&mut pool).unwrap();
        assert_eq!(vs.free_regions(), vec![]);

        vs.release(&mut pool, 0x1000).unwrap();
        vs.release(&mut pool, 0x3000).unwrap();
        vs.release(&mut pool, 0x2000).unwrap();
        assert_eq!(vs.free_regions(), vec![(0x1000, 0x3000)]);
    }

    #[test]
    fn alloc_zero_size_fails() {
        let mut pool = fresh_pool(4);
        let mut vs = VSpace::new(PAGE_SIZE);
        assert!(vs.alloc(&mut pool, 0).is_err());
    }

    #[test]
    fn alloc_fixed_unaligned_fails() {
        let mut pool = fresh_pool(4);
        let mut vs = VSpace::new(PAGE_SIZE);
        assert!(vs.alloc_fixed(&mut pool, 0x1001, 0x1000).is_err());
    }

    #[test]
    fn is_reserved_only_true_within_allocated_list() {
        let mut pool = fresh_pool(8);
        let mut vs = VSpace::new(PAGE_SIZE);
        let a = vs.alloc(&mut pool, PAGE_SIZE).unwrap();
        assert!(vs.is_reserved(a));
        assert!(!vs.is_reserved(a + PAGE_SIZE));
        assert!(!vs.is_reserved(0x1234_0000));
    }
}
