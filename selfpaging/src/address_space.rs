// SPDX-License-Identifier: BlueOak-1.0.0

//! [`AddressSpace`]: the per-process paging state that owns a
//! [`VSpace`], a [`ShadowPageTable`] and the two slab pools they're
//! carved from.
//!
//! The process named `init` builds its paging state in static storage;
//! every other process finds one pre-seeded at a known virtual address.
//! We keep the two lifecycles but discriminate with [`ProcessRole`]
//! instead of a string compare.

use crate::arch::PAGE_SIZE;
use crate::error::{PResult, PagingError};
use crate::shadow_pt::{NodePool, ShadowPageTable, ShadowPtNode};
use crate::slab::SlabPool;
use crate::vspace::{RegionPool, VSpace, VirtualRegion};
use core::mem::MaybeUninit;
use kcap::{Cap, FrameCap, KernelOps, MapFlags};

/// Which bootstrap lifecycle constructed this [`AddressSpace`].
/// Carried for diagnostics; does not change any operation's behaviour
/// once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The distinguished first process: its paging state lives in
    /// static storage installed before any other subsystem runs.
    Init,
    /// Every other process: paging state is pre-seeded at a known
    /// virtual address by the process that spawned it.
    Child,
}

/// Per-process paging state.
///
/// Owns the slab pools the VSpace and shadow-PT managers are carved
/// from directly, rather than the managers holding a back-pointer to
/// it — every operation here is a thin delegation that threads
/// `&mut self.region_pool` / `&mut self.node_pool` through explicitly.
pub struct AddressSpace {
    /// Capability to this process's L1 page table.
    l1: Cap,
    role: ProcessRole,
    vspace: VSpace,
    shadow_pt: ShadowPageTable,
    region_pool: RegionPool,
    node_pool: NodePool,
}

impl AddressSpace {
    fn new(
        role: ProcessRole,
        l1: Cap,
        lowest_managed: usize,
        region_storage: &'static mut [MaybeUninit<VirtualRegion>],
        node_storage: &'static mut [MaybeUninit<ShadowPtNode>],
    ) -> Self {
        let mut region_pool = RegionPool::new();
        region_pool.grow(region_storage);
        let mut node_pool = NodePool::new();
        node_pool.grow(node_storage);
        AddressSpace {
            l1,
            role,
            vspace: VSpace::new(lowest_managed),
            shadow_pt: ShadowPageTable::new(),
            region_pool,
            node_pool,
        }
    }

    /// Construct the distinguished `init` process's paging state.
    /// `region_storage`/`node_storage` are the one page's worth of
    /// static slab storage installed up front.
    pub fn bootstrap_init(
        l1: Cap,
        lowest_managed: usize,
        region_storage: &'static mut [MaybeUninit<VirtualRegion>],
        node_storage: &'static mut [MaybeUninit<ShadowPtNode>],
    ) -> Self {
        Self::new(ProcessRole::Init, l1, lowest_managed, region_storage, node_storage)
    }

    /// Construct paging state for any other process, starting from the
    /// virtual address its paging state was pre-seeded at.
    pub fn bootstrap_child(
        l1: Cap,
        preseeded_at: usize,
        region_storage: &'static mut [MaybeUninit<VirtualRegion>],
        node_storage: &'static mut [MaybeUninit<ShadowPtNode>],
    ) -> Self {
        Self::new(ProcessRole::Child, l1, preseeded_at, region_storage, node_storage)
    }

    /// Which bootstrap lifecycle constructed this address space.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Capability to this process's L1 page table.
    pub fn l1_cap(&self) -> Cap {
        self.l1
    }

    /// Low-water mark: no region has ever been registered above this
    /// address.
    pub fn free_base(&self) -> usize {
        self.vspace.free_base()
    }

    /// Whether `addr` is within an already-allocated region.
    pub fn is_reserved(&self, addr: usize) -> bool {
        self.vspace.is_reserved(addr)
    }

    // -- VSpace delegation, each followed by the cooperative slab
    // refill check required of every operation that consumes a slab. ----

    /// Reserve `size` bytes of virtual address space.
    pub fn alloc(&mut self, kernel: &mut dyn KernelOps, size: usize) -> PResult<usize> {
        let addr = self.vspace.alloc(&mut self.region_pool, size)?;
        self.refill_region_pool(kernel)?;
        Ok(addr)
    }

    /// Reserve a caller-chosen virtual address range.
    pub fn alloc_fixed(&mut self, kernel: &mut dyn KernelOps, addr: usize, size: usize) -> PResult<()> {
        self.vspace.alloc_fixed(&mut self.region_pool, addr, size)?;
        self.refill_region_pool(kernel)?;
        Ok(())
    }

    /// Finish bootstrap: rebuild the free list from the ranges
    /// registered via `alloc_fixed` so far.
    pub fn commit_fixed(&mut self, kernel: &mut dyn KernelOps) -> PResult<()> {
        self.vspace.commit_fixed(&mut self.region_pool)?;
        self.refill_region_pool(kernel)?;
        Ok(())
    }

    /// Release a previously allocated virtual address range.
    pub fn release(&mut self, kernel: &mut dyn KernelOps, addr: usize) -> PResult<usize> {
        let size = self.vspace.release(&mut self.region_pool, addr)?;
        self.refill_region_pool(kernel)?;
        Ok(size)
    }

    // -- Shadow PT delegation --------------------------------------------

    /// Install a mapping of `frame` at `vaddr`.
    pub fn map(
        &mut self,
        kernel: &mut dyn KernelOps,
        vaddr: usize,
        frame: FrameCap,
        size: usize,
        flags: MapFlags,
    ) -> PResult<()> {
        self.shadow_pt.map(kernel, &mut self.node_pool, vaddr, frame, size, flags)?;
        self.refill_node_pool(kernel)?;
        Ok(())
    }

    /// Undo a mapping previously installed by `map`.
    pub fn unmap(&mut self, kernel: &mut dyn KernelOps, vaddr: usize, size: usize) -> PResult<()> {
        self.shadow_pt.unmap(kernel, &mut self.node_pool, vaddr, size)?;
        self.refill_node_pool(kernel)?;
        Ok(())
    }

    /// Allocate in the VSpace, then map `frame` there. Unwinds the
    /// fresh VSpace allocation if the subsequent `map` fails, matching
    /// the rest of this crate's LIFO unwind-on-failure discipline.
    pub fn map_attr(
        &mut self,
        kernel: &mut dyn KernelOps,
        size: usize,
        frame: FrameCap,
        flags: MapFlags,
    ) -> PResult<usize> {
        let vaddr = self.alloc(kernel, size)?;
        match self.map(kernel, vaddr, frame, size, flags) {
            Ok(()) => Ok(vaddr),
            Err(e) => {
                let _ = self.vspace.release(&mut self.region_pool, vaddr);
                Err(e)
            }
        }
    }

    // -- Cooperative slab refill ------------------------------------------

    fn refill_region_pool(&mut self, kernel: &mut dyn KernelOps) -> PResult<()> {
        if !self.region_pool.needs_refill() || !self.region_pool.begin_refill() {
            return Ok(());
        }
        let result = Self::refill_one::<VirtualRegion>(kernel, &mut self.region_pool);
        self.region_pool.end_refill();
        result
    }

    fn refill_node_pool(&mut self, kernel: &mut dyn KernelOps) -> PResult<()> {
        if !self.node_pool.needs_refill() || !self.node_pool.begin_refill() {
            return Ok(());
        }
        let result = Self::refill_one::<ShadowPtNode>(kernel, &mut self.node_pool);
        self.node_pool.end_refill();
        result
    }

    /// Obtain one fresh page of RAM from the kernel and carve it into
    /// the given pool. The RAM capability itself is leaked rather than
    /// ever freed — the pool's storage is meant to live for the
    /// lifetime of the address space, exactly like the static initial
    /// page installed at construction.
    ///
    /// Host test builds back the chunk with an ordinary heap
    /// allocation rather than actually mapping the RAM capability into
    /// this address space: there is no real MMU to map into under
    /// `cargo test`, so this stands in for the page a target build
    /// would obtain by mapping `ram` at a freshly reserved vaddr and
    /// using that vaddr's backing store directly (see `DESIGN.md`).
    fn refill_one<T>(kernel: &mut dyn KernelOps, pool: &mut SlabPool<T>) -> PResult<()> {
        let ram = kernel
            .alloc_ram(PAGE_SIZE, PAGE_SIZE)
            .map_err(PagingError::from)?;
        let count = PAGE_SIZE / core::mem::size_of::<T>().max(1);
        let storage: alloc::boxed::Box<[MaybeUninit<T>]> =
            (0..count).map(|_| MaybeUninit::uninit()).collect();
        let grew = pool.grow(alloc::boxed::Box::leak(storage));
        debug_assert!(grew, "grow must succeed on first try: MAX_CHUNKS is never reached here");
        let _ = ram;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcap::fake::FakeKernel;

    fn leak_region_storage(n: usize) -> &'static mut [MaybeUninit<VirtualRegion>] {
        let v: alloc::boxed::Box<[MaybeUninit<VirtualRegion>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        alloc::boxed::Box::leak(v)
    }

    fn leak_node_storage(n: usize) -> &'static mut [MaybeUninit<ShadowPtNode>] {
        let v: alloc::boxed::Box<[MaybeUninit<ShadowPtNode>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        alloc::boxed::Box::leak(v)
    }

    fn fresh_init() -> (AddressSpace, FakeKernel) {
        let aspace = AddressSpace::bootstrap_init(
            Cap::from_raw(1),
            PAGE_SIZE,
            leak_region_storage(4),
            leak_node_storage(4),
        );
        (aspace, FakeKernel::new())
    }

    #[test]
    fn bootstrap_init_has_init_role() {
        let (aspace, _k) = fresh_init();
        assert_eq!(aspace.role(), ProcessRole::Init);
    }

    #[test]
    fn bootstrap_child_has_child_role() {
        let aspace = AddressSpace::bootstrap_child(
            Cap::from_raw(2),
            0x4000_0000,
            leak_region_storage(4),
            leak_node_storage(4),
        );
        assert_eq!(aspace.role(), ProcessRole::Child);
        assert_eq!(aspace.free_base(), 0x4000_0000);
    }

    #[test]
    fn alloc_then_is_reserved() {
        let (mut aspace, mut kernel) = fresh_init();
        let a = aspace.alloc(&mut kernel, PAGE_SIZE).unwrap();
        assert!(aspace.is_reserved(a));
        assert!(!aspace.is_reserved(a + PAGE_SIZE));
    }

    #[test]
    fn map_attr_allocates_and_maps() {
        let (mut aspace, mut kernel) = fresh_init();
        let frame = kernel.alloc_ram(PAGE_SIZE, PAGE_SIZE).unwrap();
        let vaddr = aspace
            .map_attr(&mut kernel, PAGE_SIZE, frame, MapFlags::RW)
            .unwrap();
        assert!(aspace.is_reserved(vaddr));
    }

    #[test]
    fn map_attr_unwinds_vspace_alloc_on_map_failure() {
        use kcap::fake::FailPoint;
        let (mut aspace, _unused) = fresh_init();
        // Fail the outer L2 install so `map` fails before anything else
        // commits.
        let mut kernel = FakeKernel::new().fail_at(FailPoint::Map(1));
        let frame = kcap::RamCap {
            cap: Cap::from_raw(999),
            bytes: PAGE_SIZE,
        };
        let before = aspace.free_base();
        let res = aspace.map_attr(&mut kernel, PAGE_SIZE, frame, MapFlags::RW);
        assert!(res.is_err());
        // The allocation this call made was released again; free_base
        // only ever grows, so it staying where it was (not advancing
        // further) isn't itself the assertion — absence from the
        // allocated list is.
        assert!(!aspace.is_reserved(before));
    }

    #[test]
    fn region_pool_refills_past_threshold() {
        let aspace = AddressSpace::bootstrap_init(
            Cap::from_raw(1),
            PAGE_SIZE,
            leak_region_storage(crate::slab::REFILL_THRESHOLD + 1),
            leak_node_storage(4),
        );
        let mut aspace = aspace;
        let mut kernel = FakeKernel::new();
        // Consume allocations until a refill must have happened; if it
        // didn't, eventually `alloc` would fail with `Exhausted`.
        for i in 0..crate::slab::REFILL_THRESHOLD + 4 {
            aspace
                .alloc(&mut kernel, PAGE_SIZE)
                .unwrap_or_else(|e| panic!("alloc {} failed, refill must be broken: {:?}", i, e));
        }
    }
}
