// SPDX-License-Identifier: BlueOak-1.0.0

//! Shadow page-table manager: a binary-search tree of L2-page-table
//! nodes, each owning a secondary BST of leaf mapping records.
//!
//! The outer BST is keyed by L1 index; each outer node's `subtree`
//! field roots an inner BST keyed by page-aligned virtual address.
//! Both trees are built from the same [`ShadowPtNode`] type and the
//! same slab pool, and share one generic BST walk/insert/delete
//! implementation since both trees are unique-key integer-keyed BSTs.
//!
//! Deletion uses index-into-arena pointers rather than pointer-to-
//! pointer indirection, promoting the in-order successor in the
//! two-child case.

use crate::arch::{is_page_aligned, l1_index, l2_page_index, L1_SECTION_SIZE, PAGE_SIZE};
use crate::error::{PResult, PagingError};
use crate::slab::SlabPool;
use core::ptr::NonNull;
use kcap::{Cap, FrameCap, KernelOps, MapFlags, MappingCap};

/// One node in either the outer (L1-index-keyed) or an inner
/// (vaddr-keyed) BST. Which tree a given node belongs to is implicit
/// in how it's reached: outer nodes hang off [`ShadowPageTable::root`],
/// leaf nodes hang off some outer node's `subtree`.
pub struct ShadowPtNode {
    /// BST key: L1 index for an outer node, page-aligned vaddr for a leaf.
    key: usize,
    /// Capability slot this node's installed object occupies.
    slot: Cap,
    /// The L2-page-table capability (outer node) or frame capability
    /// (leaf node) installed at `slot`.
    installed: Cap,
    /// Kernel-returned mapping record for the install at `slot`.
    /// Required to undo it.
    mapping: MappingCap,
    left: Option<NonNull<ShadowPtNode>>,
    right: Option<NonNull<ShadowPtNode>>,
    /// Outer nodes only: root of the inner BST of leaf mapping records
    /// installed under this L2 table.
    subtree: Option<NonNull<ShadowPtNode>>,
}

/// Pool shadow-PT nodes are carved from.
pub type NodePool = SlabPool<ShadowPtNode>;

/// The shadow page-table manager.
pub struct ShadowPageTable {
    root: Option<NonNull<ShadowPtNode>>,
}

impl ShadowPageTable {
    /// An empty shadow page table: no L2s installed yet.
    pub fn new() -> Self {
        ShadowPageTable { root: None }
    }

    /// Map `frame` at `vaddr` for `size` bytes with `flags`, walking
    /// L1-aligned strides and ensuring an L2 table exists for each one
    /// before installing the leaf.
    pub fn map(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        vaddr: usize,
        frame: FrameCap,
        size: usize,
        flags: MapFlags,
    ) -> PResult<()> {
        if !is_page_aligned(vaddr) || size == 0 {
            return Err(PagingError::InvalidArgument {
                detail: "map requires a page-aligned vaddr and non-zero size",
            });
        }
        let end = vaddr + size;
        let mut cur = vaddr;
        // Every successful leaf install is recorded here, together with
        // whether *this call* is the one that created the outer L2 node
        // it hangs off, so a later failure in the same `map()` call can
        // unwind everything this call itself installed, LIFO, without
        // touching prior state.
        let mut installed_this_call: [(usize, bool); MAX_STRIDES_PER_CALL] =
            [(0, false); MAX_STRIDES_PER_CALL];
        let mut installed_count = 0usize;

        while cur < end {
            let stride_end = ((cur / L1_SECTION_SIZE) + 1) * L1_SECTION_SIZE;
            let chunk_end = core::cmp::min(end, stride_end);
            let chunk_len = chunk_end - cur;
            let num_pages = (chunk_len + PAGE_SIZE - 1) / PAGE_SIZE;

            match self.install_one_stride(kernel, pool, cur, frame, num_pages, flags) {
                Ok(created_outer) => {
                    if installed_count < MAX_STRIDES_PER_CALL {
                        installed_this_call[installed_count] = (cur, created_outer);
                        installed_count += 1;
                    }
                }
                Err(e) => {
                    for &(start, created_outer) in
                        installed_this_call[..installed_count].iter().rev()
                    {
                        let _ = self.rollback_stride(kernel, pool, start, created_outer);
                    }
                    return Err(e);
                }
            }
            cur = chunk_end;
        }
        Ok(())
    }

    /// Undo `map` over `[vaddr, vaddr + size)`.
    pub fn unmap(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        vaddr: usize,
        size: usize,
    ) -> PResult<()> {
        let end = vaddr + size;
        let mut cur = vaddr;
        while cur < end {
            let stride_end = ((cur / L1_SECTION_SIZE) + 1) * L1_SECTION_SIZE;
            let chunk_end = core::cmp::min(end, stride_end);
            self.unmap_one_stride(kernel, pool, cur)?;
            cur = chunk_end;
        }
        Ok(())
    }

    /// Whether an outer node exists for `l1_index(vaddr)`.
    pub fn has_l2_for(&self, vaddr: usize) -> bool {
        find(self.root, l1_index(vaddr)).is_some()
    }

    /// Number of outer (L2) nodes currently installed, for testing the
    /// straddling-mapping scenario.
    pub fn outer_node_count(&self) -> usize {
        count(self.root)
    }

    /// Number of leaf nodes under the outer node for `l1_index(vaddr)`,
    /// or `0` if that outer node does not exist.
    pub fn leaf_count_for(&self, vaddr: usize) -> usize {
        match find(self.root, l1_index(vaddr)) {
            Some(outer) => count(unsafe { outer.as_ref() }.subtree),
            None => 0,
        }
    }

    // -- internals ---------------------------------------------------

    /// Installs the leaf for one L1-aligned stride, ensuring its outer
    /// L2 node exists first. Returns whether this call is the one that
    /// created that outer node (as opposed to finding it already
    /// installed) — the caller needs this to fully unwind a failed
    /// `map()` call.
    fn install_one_stride(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        start: usize,
        frame: FrameCap,
        num_pages: usize,
        flags: MapFlags,
    ) -> PResult<bool> {
        let l1 = l1_index(start);
        let (mut outer, created_outer) = self.ensure_l2(kernel, pool, l1)?;
        let outer_ref = unsafe { outer.as_mut() };

        let leaf_slot = kernel.alloc_slot().map_err(PagingError::from)?;
        let install_leaf = || -> PResult<NonNull<ShadowPtNode>> {
            let frame_cap = kernel
                .map(
                    outer_ref.installed,
                    l2_page_index(start),
                    frame.cap,
                    num_pages,
                    flags,
                )
                .map_err(PagingError::from)?;
            let ptr = pool.alloc().ok_or(PagingError::Exhausted { resource: "slab" })?;
            unsafe {
                ptr.write(ShadowPtNode {
                    key: start,
                    slot: leaf_slot,
                    installed: frame.cap,
                    mapping: frame_cap,
                    left: None,
                    right: None,
                    subtree: None,
                });
                Ok(NonNull::new_unchecked(ptr))
            }
        };

        match install_leaf() {
            Ok(leaf) => {
                insert_new(&mut outer_ref.subtree, leaf);
                Ok(created_outer)
            }
            Err(e) => {
                kernel.free_slot(leaf_slot);
                Err(e)
            }
        }
    }

    fn unmap_one_stride(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        start: usize,
    ) -> PResult<()> {
        let l1 = l1_index(start);
        let Some(mut outer) = find(self.root, l1) else {
            return Err(PagingError::RegionNotFound { addr: start });
        };
        let outer_ref = unsafe { outer.as_mut() };
        let Some(leaf) = delete(&mut outer_ref.subtree, start) else {
            return Err(PagingError::RegionNotFound { addr: start });
        };
        let leaf_ref = unsafe { leaf.as_ref() };
        kernel.unmap(leaf_ref.mapping).map_err(PagingError::from)?;
        kernel.destroy(leaf_ref.installed).map_err(PagingError::from)?;
        kernel.free_slot(leaf_ref.slot);
        unsafe { pool.free(leaf.as_ptr()) };

        // Discarding an outer node whose inner BST becomes empty is
        // optional; we keep the L2 table installed (cheaper than
        // re-creating it on the next fault to the same 1 MiB stride)
        // and only ever tear it down when the whole address space is
        // destroyed.
        Ok(())
    }

    /// Undo one stride installed during the *same, still in-flight*
    /// `map()` call that is now failing. Unlike
    /// [`unmap_one_stride`](Self::unmap_one_stride), this also destroys
    /// the outer L2 node when `created_outer` says this call was the one
    /// that brought it into existence — leaving no trace of the failed
    /// call. An outer node this call merely *found* (installed by an
    /// earlier, already-committed `map()` call, or by a concurrent
    /// fault-driven recursion) is left alone even if its subtree is now
    /// empty, matching the ordinary unmap path, where discarding an
    /// emptied outer node is never required.
    fn rollback_stride(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        start: usize,
        created_outer: bool,
    ) -> PResult<()> {
        self.unmap_one_stride(kernel, pool, start)?;
        if !created_outer {
            return Ok(());
        }
        let l1 = l1_index(start);
        let Some(outer) = delete(&mut self.root, l1) else {
            return Ok(());
        };
        let outer_ref = unsafe { outer.as_ref() };
        debug_assert!(outer_ref.subtree.is_none(), "rolled-back outer node must be leafless");
        kernel.unmap(outer_ref.mapping).map_err(PagingError::from)?;
        kernel.destroy(outer_ref.installed).map_err(PagingError::from)?;
        kernel.free_slot(outer_ref.slot);
        unsafe { pool.free(outer.as_ptr()) };
        Ok(())
    }

    /// Look up (or, if absent, install) the outer node for L1 index
    /// `l1`. Tolerates a concurrent install racing in via recursive
    /// fault-driven `map()` calls: re-walks from the root before
    /// discarding a freshly allocated node. The returned `bool` is
    /// whether this call created the node (`false` if it already
    /// existed, whether from an earlier call or a concurrent recursive
    /// one).
    fn ensure_l2(
        &mut self,
        kernel: &mut dyn KernelOps,
        pool: &mut NodePool,
        l1: usize,
    ) -> PResult<(NonNull<ShadowPtNode>, bool)> {
        if let Some(existing) = find(self.root, l1) {
            return Ok((existing, false));
        }

        let slot = kernel.alloc_slot().map_err(PagingError::from)?;
        let outcome = (|| -> PResult<(Cap, MappingCap)> {
            let l2cap = kernel.create_l2_table(slot).map_err(PagingError::from)?;
            let mapping = kernel
                .map(Cap::NULL, l1, l2cap.0, 1, MapFlags::RW)
                .map_err(PagingError::from)?;
            Ok((l2cap.0, mapping))
        })();

        let (l2cap, mapping) = match outcome {
            Ok(v) => v,
            Err(e) => {
                kernel.free_slot(slot);
                return Err(e);
            }
        };

        // Re-walk: a recursive invocation (triggered from within the
        // slab refill that `pool.alloc()` below might have needed)
        // could already have installed this L1 index.
        if let Some(existing) = find(self.root, l1) {
            let _ = kernel.unmap(mapping);
            let _ = kernel.destroy(l2cap);
            kernel.free_slot(slot);
            return Ok((existing, false));
        }

        let ptr = match pool.alloc() {
            Some(ptr) => ptr,
            None => {
                let _ = kernel.unmap(mapping);
                let _ = kernel.destroy(l2cap);
                kernel.free_slot(slot);
                return Err(PagingError::Exhausted { resource: "slab" });
            }
        };
        unsafe {
            ptr.write(ShadowPtNode {
                key: l1,
                slot,
                installed: l2cap,
                mapping,
                left: None,
                right: None,
                subtree: None,
            });
        }
        let node = unsafe { NonNull::new_unchecked(ptr) };
        insert_new(&mut self.root, node);
        Ok((node, true))
    }
}

impl Default for ShadowPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound on the number of L1 strides a single `map()` call can span,
/// used only to size the LIFO-unwind bookkeeping array on the stack.
/// A single call spanning more than this many megabytes is not a
/// pattern this engine needs to support in one invocation.
const MAX_STRIDES_PER_CALL: usize = 64;

// -- generic unique-key BST over `.key`/`.left`/`.right` -------------------
//
// Shared by the outer (L1-index) and every inner (vaddr) tree; see the
// module doc comment. `NonNull` plays the role of an index into an
// arena here, with the slab pool as the arena.

fn find(mut link: Option<NonNull<ShadowPtNode>>, key: usize) -> Option<NonNull<ShadowPtNode>> {
    while let Some(node) = link {
        let n = unsafe { node.as_ref() };
        if key == n.key {
            return Some(node);
        }
        link = if key < n.key { n.left } else { n.right };
    }
    None
}

fn count(link: Option<NonNull<ShadowPtNode>>) -> usize {
    // Iterative in-order-ish traversal using an explicit stack would
    // need allocation; a small recursive walk is simpler and the tree
    // depth is bounded by log2(4096) = 12 at the outer level and
    // log2(256) = 8 at the inner level.
    match link {
        None => 0,
        Some(node) => {
            let n = unsafe { node.as_ref() };
            1 + count(n.left) + count(n.right)
        }
    }
}

/// Insert `new_node` into the tree rooted at `*root`. Caller must have
/// already confirmed `new_node.key` is not present (e.g. via [`find`]).
fn insert_new(root: &mut Option<NonNull<ShadowPtNode>>, new_node: NonNull<ShadowPtNode>) {
    let key = unsafe { new_node.as_ref() }.key;
    match *root {
        None => *root = Some(new_node),
        Some(mut node) => loop {
            let n = unsafe { node.as_mut() };
            if key < n.key {
                match n.left {
                    None => {
                        n.left = Some(new_node);
                        return;
                    }
                    Some(next) => node = next,
                }
            } else {
                match n.right {
                    None => {
                        n.right = Some(new_node);
                        return;
                    }
                    Some(next) => node = next,
                }
            }
        },
    }
}

/// Remove and return the node keyed `key` from the tree rooted at
/// `*link_slot`, or `None` if absent. Standard three-case BST delete:
/// zero children, one child, or two children (promoting the in-order
/// successor).
fn delete(
    link_slot: &mut Option<NonNull<ShadowPtNode>>,
    key: usize,
) -> Option<NonNull<ShadowPtNode>> {
    let mut node = (*link_slot)?;
    let n = unsafe { node.as_mut() };
    if key < n.key {
        return delete(&mut n.left, key);
    }
    if key > n.key {
        return delete(&mut n.right, key);
    }

    match (n.left, n.right) {
        (None, None) => {
            *link_slot = None;
        }
        (Some(only), None) | (None, Some(only)) => {
            *link_slot = Some(only);
        }
        (Some(_), Some(right)) => {
            let mut succ_cursor = right;
            let succ_key = loop {
                let cur_ref = unsafe { succ_cursor.as_ref() };
                match cur_ref.left {
                    Some(next) => succ_cursor = next,
                    None => break cur_ref.key,
                }
            };
            let succ = delete(&mut n.right, succ_key).expect("in-order successor must exist");
            let succ_mut = unsafe { succ.as_ptr().as_mut().unwrap() };
            succ_mut.left = n.left;
            succ_mut.right = n.right;
            *link_slot = Some(succ);
        }
    }
    node.as_mut().left = None;
    node.as_mut().right = None;
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;
    use core::mem::MaybeUninit;
    use kcap::fake::FakeKernel;
    use kcap::RamCap;

    fn fresh_pool(n: usize) -> NodePool {
        let mut pool = NodePool::new();
        let storage: Box<[MaybeUninit<ShadowPtNode>]> =
            (0..n).map(|_| MaybeUninit::uninit()).collect();
        pool.grow(Box::leak(storage));
        pool
    }

    fn dummy_frame(kernel: &mut FakeKernel, bytes: usize) -> FrameCap {
        kernel.alloc_ram(bytes, PAGE_SIZE).unwrap()
    }

    #[test]
    fn single_page_map_creates_one_outer_one_leaf() {
        let mut pool = fresh_pool(16);
        let mut kernel = FakeKernel::new();
        let mut pt = ShadowPageTable::new();
        let frame = dummy_frame(&mut kernel, PAGE_SIZE);

        pt.map(&mut kernel, &mut pool, 0x1000, frame, PAGE_SIZE, MapFlags::RW)
            .unwrap();

        assert_eq!(pt.outer_node_count(), 1);
        assert_eq!(pt.leaf_count_for(0x1000), 1);
    }

    #[test]
    fn straddling_mapping_creates_two_outer_nodes() {
        let mut pool = fresh_pool(16);
        let mut kernel = FakeKernel::new();
        let mut pt = ShadowPageTable::new();
        let frame = dummy_frame(&mut kernel, 0x2000);

        pt.map(&mut kernel, &mut pool, 0x00FF_F000, frame, 0x2000, MapFlags::RW)
            .unwrap();

        assert_eq!(pt.outer_node_count(), 2);
        assert_eq!(pt.leaf_count_for(0x00FF_F000), 1);
        assert_eq!(pt.leaf_count_for(0x0100_0000), 1);

        pt.unmap(&mut kernel, &mut pool, 0x00FF_F000, 0x2000).unwrap();
        assert_eq!(pt.leaf_count_for(0x00FF_F000), 0);
        assert_eq!(pt.leaf_count_for(0x0100_0000), 0);
    }

    #[test]
    fn unmap_unknown_range_errors() {
        let mut pool = fresh_pool(16);
        let mut kernel = FakeKernel::new();
        let mut pt = ShadowPageTable::new();
        assert!(pt.unmap(&mut kernel, &mut pool, 0x4000, PAGE_SIZE).is_err());
    }

    #[test]
    fn map_failure_unwinds_partial_installs() {
        use kcap::fake::FailPoint;
        let mut pool = fresh_pool(16);
        // Fail the *second* `map` kernel call: the first installs the L2,
        // the second is the first leaf install attempt within a
        // two-stride mapping, so nothing should remain installed after
        // the whole `map()` call fails... Exercise with a fail on the
        // second stride of a 2-stride map instead, and assert the first
        // stride's leaf was rolled back.
        let mut kernel = FakeKernel::new().fail_at(FailPoint::Map(3));
        let mut pt = ShadowPageTable::new();
        let frame = RamCap {
            cap: Cap::from_raw(999),
            bytes: 0x2000,
        };

        let res = pt.map(
            &mut kernel,
            &mut pool,
            0x00FF_F000,
            frame,
            0x2000,
            MapFlags::RW,
        );
        assert!(res.is_err());
        assert_eq!(pt.outer_node_count(), 0, "partial outer nodes must unwind");
    }
}
