// SPDX-License-Identifier: BlueOak-1.0.0

//! Page-fault handler: lazily materialises physical backing for
//! previously reserved virtual regions.
//!
//! Installed per thread on a dedicated exception stack pre-mapped
//! during address-space initialisation; the try-lock here is that
//! thread's guard against a second, concurrent fault, non-blocking —
//! a second faulting thread returns immediately rather than queuing
//! behind the first.

use crate::address_space::AddressSpace;
use crate::arch::{page_align_down, KERNEL_SPLIT, PAGE_SIZE};
use crate::error::{PResult, PagingError};
use core::cell::Cell;
use kcap::{KernelOps, MapFlags};

/// How many guard pages sit immediately below a thread's stack bottom;
/// a fault in this range is treated as a stack overflow rather than a
/// legitimate lazy-materialisation request. One guard page (see
/// `DESIGN.md` for why).
pub const STACK_GUARD_PAGES: usize = 1;

/// Non-blocking try-lock guarding the fault handler against concurrent
/// invocation: a second fault returns immediately rather than queuing.
/// One per thread's exception stack.
#[derive(Default)]
pub struct FaultTryLock {
    held: Cell<bool>,
}

impl FaultTryLock {
    /// A fresh, unheld lock.
    pub const fn new() -> Self {
        FaultTryLock { held: Cell::new(false) }
    }

    /// Attempt to take the lock. Returns `None` immediately if another
    /// fault is already being serviced on this stack.
    pub fn try_lock(&self) -> Option<FaultLockGuard<'_>> {
        if self.held.replace(true) {
            return None;
        }
        Some(FaultLockGuard { lock: self })
    }
}

/// RAII guard releasing a [`FaultTryLock`] on drop — so the lock is
/// always released exactly once, including on every early-return error
/// path.
pub struct FaultLockGuard<'a> {
    lock: &'a FaultTryLock,
}

impl Drop for FaultLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.set(false);
    }
}

/// Outcome of offering a fault to [`FaultHandler::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was serviced: a frame is now mapped at the faulting
    /// page.
    Serviced,
    /// Another fault was already being serviced on this stack; this
    /// one was dropped without being serviced.
    AlreadyBusy,
}

/// Per-thread page-fault handler state: the try-lock and the bounds of
/// this thread's stack, needed for the overflow check.
pub struct FaultHandler {
    lock: FaultTryLock,
    /// Lowest address belonging to this thread's stack (stack grows
    /// down from some higher base).
    stack_bottom: usize,
}

impl FaultHandler {
    /// A fault handler for a thread whose stack's lowest byte is
    /// `stack_bottom`.
    pub const fn new(stack_bottom: usize) -> Self {
        FaultHandler {
            lock: FaultTryLock::new(),
            stack_bottom,
        }
    }

    /// Service (or reject) one page fault at `fault_addr`.
    ///
    /// On any `Fatal` condition (null deref, kernel-space address,
    /// stack overflow) this returns `Err(PagingError::Fatal { .. })`;
    /// the caller is expected to abort the process.
    pub fn handle(
        &self,
        aspace: &mut AddressSpace,
        kernel: &mut dyn KernelOps,
        fault_addr: usize,
    ) -> PResult<FaultOutcome> {
        let Some(_guard) = self.lock.try_lock() else {
            return Ok(FaultOutcome::AlreadyBusy);
        };

        if fault_addr == 0 {
            kcap::klog!("fatal fault: null pointer dereference");
            return Err(PagingError::Fatal { reason: "null pointer dereference" });
        }
        if fault_addr >= KERNEL_SPLIT {
            kcap::klog!("fatal fault: {:#x} is a kernel-space address", fault_addr);
            return Err(PagingError::Fatal { reason: "fault at kernel-space address" });
        }
        let guard_low = self.stack_bottom.saturating_sub(STACK_GUARD_PAGES * PAGE_SIZE);
        if fault_addr >= guard_low && fault_addr < self.stack_bottom {
            kcap::klog!("fatal fault: {:#x} ran into the stack guard page", fault_addr);
            return Err(PagingError::Fatal { reason: "stack overflow" });
        }

        let page = page_align_down(fault_addr);
        if !aspace.is_reserved(page) {
            aspace.alloc_fixed(kernel, page, PAGE_SIZE)?;
            aspace.commit_fixed(kernel)?;
        }

        let ram = kernel.alloc_ram(PAGE_SIZE, PAGE_SIZE).map_err(PagingError::from)?;
        let slot = kernel.alloc_slot().map_err(PagingError::from)?;
        let frame = match kernel.retype_to_frame(ram, slot, PAGE_SIZE) {
            Ok(frame) => frame,
            Err(e) => {
                kernel.free_slot(slot);
                let _ = kernel.free_ram(ram);
                return Err(e.into());
            }
        };
        if let Err(e) = aspace.map(kernel, page, frame, PAGE_SIZE, MapFlags::RW) {
            let _ = kernel.destroy(frame.cap);
            kernel.free_slot(slot);
            return Err(e);
        }

        Ok(FaultOutcome::Serviced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::ProcessRole;
    use crate::shadow_pt::ShadowPtNode;
    use crate::vspace::VirtualRegion;
    use core::mem::MaybeUninit;
    use kcap::{fake::FakeKernel, Cap};

    fn leak_regions(n: usize) -> &'static mut [MaybeUninit<VirtualRegion>] {
        let v: alloc::boxed::Box<[MaybeUninit<VirtualRegion>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        alloc::boxed::Box::leak(v)
    }

    fn leak_nodes(n: usize) -> &'static mut [MaybeUninit<ShadowPtNode>] {
        let v: alloc::boxed::Box<[MaybeUninit<ShadowPtNode>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        alloc::boxed::Box::leak(v)
    }

    fn fresh() -> (AddressSpace, FakeKernel) {
        let aspace = AddressSpace::bootstrap_init(Cap::from_raw(1), PAGE_SIZE, leak_regions(8), leak_nodes(8));
        (aspace, FakeKernel::new())
    }

    #[test]
    fn null_fault_is_fatal() {
        let (mut aspace, mut kernel) = fresh();
        let handler = FaultHandler::new(0x2000_0000);
        assert_eq!(
            handler.handle(&mut aspace, &mut kernel, 0),
            Err(PagingError::Fatal { reason: "null pointer dereference" })
        );
    }

    #[test]
    fn kernel_space_fault_is_fatal() {
        let (mut aspace, mut kernel) = fresh();
        let handler = FaultHandler::new(0x2000_0000);
        assert!(handler.handle(&mut aspace, &mut kernel, KERNEL_SPLIT).is_err());
        assert!(handler.handle(&mut aspace, &mut kernel, KERNEL_SPLIT + PAGE_SIZE).is_err());
    }

    #[test]
    fn stack_guard_page_fault_is_fatal() {
        let (mut aspace, mut kernel) = fresh();
        let stack_bottom = 0x2000_0000;
        let handler = FaultHandler::new(stack_bottom);
        let res = handler.handle(&mut aspace, &mut kernel, stack_bottom - PAGE_SIZE / 2);
        assert_eq!(res, Err(PagingError::Fatal { reason: "stack overflow" }));
    }

    #[test]
    fn fault_within_stack_itself_is_serviced_not_fatal() {
        let (mut aspace, mut kernel) = fresh();
        let stack_bottom = 0x2000_0000;
        let handler = FaultHandler::new(stack_bottom);
        let res = handler.handle(&mut aspace, &mut kernel, stack_bottom);
        assert_eq!(res, Ok(FaultOutcome::Serviced));
    }

    #[test]
    fn lazy_fault_reserves_and_maps() {
        let (mut aspace, mut kernel) = fresh();
        let handler = FaultHandler::new(0x2000_0000);
        let v = 0x0050_0000usize;
        assert!(!aspace.is_reserved(v));

        let outcome = handler.handle(&mut aspace, &mut kernel, v).unwrap();
        assert_eq!(outcome, FaultOutcome::Serviced);
        assert!(aspace.is_reserved(v));

        // Second page, same stride, also materialises lazily.
        let outcome2 = handler.handle(&mut aspace, &mut kernel, v + PAGE_SIZE).unwrap();
        assert_eq!(outcome2, FaultOutcome::Serviced);
        assert!(aspace.is_reserved(v + PAGE_SIZE));
    }

    #[test]
    fn already_reserved_region_skips_alloc_fixed() {
        let (mut aspace, mut kernel) = fresh();
        let addr = aspace.alloc(&mut kernel, PAGE_SIZE).unwrap();
        let handler = FaultHandler::new(0x2000_0000);
        let outcome = handler.handle(&mut aspace, &mut kernel, addr).unwrap();
        assert_eq!(outcome, FaultOutcome::Serviced);
    }

    #[test]
    fn concurrent_fault_on_same_lock_returns_busy() {
        let (mut aspace, mut kernel) = fresh();
        let handler = FaultHandler::new(0x2000_0000);
        // Hold the lock manually to simulate a fault already in flight.
        let _held = handler.lock.try_lock().unwrap();
        let outcome = handler.handle(&mut aspace, &mut kernel, 0x0050_0000).unwrap();
        assert_eq!(outcome, FaultOutcome::AlreadyBusy);
    }

    #[test]
    fn bootstrap_role_is_carried() {
        let (aspace, _k) = fresh();
        assert_eq!(aspace.role(), ProcessRole::Init);
    }
}
