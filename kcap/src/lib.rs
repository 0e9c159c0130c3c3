// SPDX-License-Identifier: BlueOak-1.0.0

//! Capability handles and the single seam ([`KernelOps`]) through which the
//! self-paging engine and its message transports invoke the kernel.
//!
//! This crate does not issue syscalls itself — the encoding of a `KernelOps`
//! call into an actual trap is arch- and kernel-specific and lives outside
//! this workspace. What lives here is the capability vocabulary every other
//! crate in the workspace shares, plus [`FakeKernel`], a host-testable
//! implementation used by every crate's test suite.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod log;

pub use log::{register_sink, sink, Sink};

use snafu::Snafu;

/// Opaque handle to a kernel object. Two capabilities naming the same
/// object compare equal; capabilities naming distinct objects never do,
/// even if one was later destroyed and its slot reused (the generation
/// counter prevents use-after-destroy aliasing in [`FakeKernel`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cap(u64);

impl Cap {
    /// The null capability. Never names a live kernel object.
    pub const NULL: Cap = Cap(0);

    /// Construct a capability from a raw kernel-assigned identifier.
    /// Only [`KernelOps`] implementations should call this.
    pub const fn from_raw(id: u64) -> Self {
        Cap(id)
    }

    /// The raw identifier, for logging and wire encoding.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null capability.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for Cap {
    fn default() -> Self {
        Cap::NULL
    }
}

/// RAM that has not yet been mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamCap {
    /// Underlying capability slot.
    pub cap: Cap,
    /// Size in bytes. Always a multiple of the base page size.
    pub bytes: usize,
}

/// A frame: RAM capability that may already be mapped somewhere.
pub type FrameCap = RamCap;

/// Capability to an L2 page-table kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2TableCap(pub Cap);

/// Kernel-returned capability that names one specific installed mapping.
/// Required to undo that mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingCap(pub Cap);

/// Capability to one endpoint of an LMP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCap(pub Cap);

/// Machine words carried by one LMP message, plus the tag word.
pub const LMP_MSG_WORDS: usize = 9;

/// One LMP message: up to [`LMP_MSG_WORDS`] machine words and at most
/// one capability. `words[0]` is always a request-kind tag; `lmp`
/// interprets the rest per `RequestKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmpMessage {
    /// Message payload words, `words[0]` being the request-kind tag.
    pub words: [usize; LMP_MSG_WORDS],
    /// The capability riding alongside, or [`Cap::NULL`] if none.
    pub cap: Cap,
}

impl LmpMessage {
    /// A message carrying `words` and no capability.
    pub const fn words(words: [usize; LMP_MSG_WORDS]) -> Self {
        LmpMessage { words, cap: Cap::NULL }
    }

    /// A message carrying `words` and `cap`.
    pub const fn with_cap(words: [usize; LMP_MSG_WORDS], cap: Cap) -> Self {
        LmpMessage { words, cap }
    }
}

impl Default for LmpMessage {
    fn default() -> Self {
        LmpMessage::words([0; LMP_MSG_WORDS])
    }
}

/// Mapping permission flags, installed alongside every mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags {
    bits: u8,
}

impl MapFlags {
    /// Readable.
    pub const READ: MapFlags = MapFlags { bits: 0b001 };
    /// Writable.
    pub const WRITE: MapFlags = MapFlags { bits: 0b010 };
    /// Executable.
    pub const EXEC: MapFlags = MapFlags { bits: 0b100 };
    /// Shorthand for `READ | WRITE`, the common case for lazily
    /// materialised anonymous memory.
    pub const RW: MapFlags = MapFlags { bits: 0b011 };

    /// Bitwise-or two flag sets.
    pub const fn union(self, other: MapFlags) -> MapFlags {
        MapFlags {
            bits: self.bits | other.bits,
        }
    }

    /// Whether `flag` is set.
    pub const fn contains(self, flag: MapFlags) -> bool {
        self.bits & flag.bits == flag.bits
    }
}

/// Errors a kernel invocation can surface: capability-operation failure
/// and slot/RAM exhaustion.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
pub enum KernelError {
    /// A kernel primitive (create/map/unmap/retype/destroy) failed.
    /// The kernel error itself is surfaced verbatim, never swallowed.
    #[snafu(display("kernel capability operation {operation} failed"))]
    CapabilityFailure {
        /// Which primitive failed, for logging.
        operation: &'static str,
    },
    /// No RAM capability of the requested size is available.
    OutOfRam,
    /// The slot allocator has no free slots left in the cap space.
    OutOfSlots,
}

/// Result alias for [`KernelOps`].
pub type KResult<T> = Result<T, KernelError>;

/// The seam every kernel invocation made by `selfpaging`, `lmp` and `ump`
/// goes through.
///
/// A real implementation traps into the kernel; [`FakeKernel`] below is a
/// host-testable stand-in.
pub trait KernelOps {
    /// Allocate a fresh capability slot in the caller's CSpace.
    fn alloc_slot(&mut self) -> KResult<Cap>;

    /// Release a previously allocated slot (does not destroy the object
    /// named by whatever capability the slot held — call [`KernelOps::destroy`]
    /// first if that capability is still live).
    fn free_slot(&mut self, slot: Cap);

    /// Create a new L2 page-table kernel object in `slot`.
    fn create_l2_table(&mut self, slot: Cap) -> KResult<L2TableCap>;

    /// Retype a RAM capability into a frame of the requested size.
    fn retype_to_frame(&mut self, ram: RamCap, slot: Cap, bytes: usize) -> KResult<FrameCap>;

    /// Map `src` (an L2 table or a frame) into `dest_index` of the
    /// structure named by `into`, returning the kernel-issued mapping
    /// record that must later be passed to [`KernelOps::unmap`].
    fn map(
        &mut self,
        into: Cap,
        dest_index: usize,
        src: Cap,
        num_pages: usize,
        flags: MapFlags,
    ) -> KResult<MappingCap>;

    /// Undo a previously installed mapping.
    fn unmap(&mut self, mapping: MappingCap) -> KResult<()>;

    /// Destroy a capability, freeing the kernel object it names if this
    /// was the last reference.
    fn destroy(&mut self, cap: Cap) -> KResult<()>;

    /// Allocate `bytes` of untyped RAM aligned to `align`.
    fn alloc_ram(&mut self, bytes: usize, align: usize) -> KResult<RamCap>;

    /// Return RAM obtained from [`KernelOps::alloc_ram`].
    fn free_ram(&mut self, ram: RamCap) -> KResult<()>;

    /// Create a new endpoint kernel object in `slot`, the local side of
    /// an LMP channel.
    fn create_endpoint(&mut self, slot: Cap) -> KResult<EndpointCap>;

    /// Send `msg` to `dest`. Unlike [`KernelOps::endpoint_recv`], `lmp`
    /// never retries a failed send itself.
    fn endpoint_send(&mut self, dest: EndpointCap, msg: LmpMessage) -> KResult<()>;

    /// Receive the next message addressed to `local`. May fail
    /// transiently even when a message is in fact pending — `lmp`'s
    /// server loop re-arms on any such failure rather than propagating it.
    fn endpoint_recv(&mut self, local: EndpointCap) -> KResult<LmpMessage>;
}

#[cfg(any(test, feature = "fake"))]
pub mod fake {
    //! A host-testable [`KernelOps`] implementation. Tracks installed
    //! slots and mappings in ordinary collections instead of trapping
    //! into a kernel, and lets tests program specific calls to fail so
    //! the unwind-on-failure paths in `selfpaging` can be exercised.

    use super::*;
    use alloc::collections::BTreeSet;

    /// Identifies a call site `FakeKernel` can be told to fail at, for
    /// testing the LIFO-unwind discipline required of every caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum FailPoint {
        /// Fail the Nth call to `create_l2_table`.
        CreateL2Table(u32),
        /// Fail the Nth call to `map`.
        Map(u32),
        /// Fail the Nth call to `retype_to_frame`.
        RetypeToFrame(u32),
        /// Fail the Nth call to `alloc_ram`.
        AllocRam(u32),
        /// Fail the Nth call to `endpoint_recv`, simulating the
        /// spurious transient failure `lmp`'s server loop re-arms on.
        EndpointRecv(u32),
    }

    /// Host-side fake kernel. Not `no_std`-restricted since it only
    /// exists under `cfg(test)` / `feature = "fake"`.
    #[derive(Debug, Default)]
    pub struct FakeKernel {
        next_slot: u64,
        live: BTreeSet<u64>,
        slots_total: u64,
        calls: alloc::collections::BTreeMap<&'static str, u32>,
        fail_at: alloc::vec::Vec<FailPoint>,
        max_slots: Option<u64>,
        /// Per-endpoint inbox, keyed by the endpoint's raw capability
        /// id. A host-test stand-in for the kernel's own endpoint
        /// queues — good enough since these tests run single-threaded
        /// and stage every `endpoint_send` before the matching
        /// `endpoint_recv`.
        mailboxes: alloc::collections::BTreeMap<u64, alloc::collections::VecDeque<LmpMessage>>,
    }

    impl FakeKernel {
        /// Construct a fresh fake kernel with an unbounded slot space.
        pub fn new() -> Self {
            Self {
                next_slot: 1,
                ..Default::default()
            }
        }

        /// Bound the number of live slots, to test `OutOfSlots`.
        pub fn with_max_slots(mut self, max: u64) -> Self {
            self.max_slots = Some(max);
            self
        }

        /// Arrange for a specific, numbered invocation of an operation
        /// to fail with `CapabilityFailure`.
        pub fn fail_at(mut self, point: FailPoint) -> Self {
            self.fail_at.push(point);
            self
        }

        /// How many capability slots are currently live. Used by tests
        /// asserting LIFO unwind actually released everything.
        pub fn live_count(&self) -> usize {
            self.live.len()
        }

        fn bump_call(&mut self, op: &'static str) -> u32 {
            let entry = self.calls.entry(op).or_insert(0);
            *entry += 1;
            *entry
        }

        fn should_fail(&self, point: FailPoint) -> bool {
            self.fail_at.contains(&point)
        }
    }

    impl KernelOps for FakeKernel {
        fn alloc_slot(&mut self) -> KResult<Cap> {
            if let Some(max) = self.max_slots {
                if self.live.len() as u64 >= max {
                    return Err(KernelError::OutOfSlots);
                }
            }
            let id = self.next_slot;
            self.next_slot += 1;
            self.slots_total += 1;
            self.live.insert(id);
            Ok(Cap::from_raw(id))
        }

        fn free_slot(&mut self, slot: Cap) {
            self.live.remove(&slot.raw());
        }

        fn create_l2_table(&mut self, slot: Cap) -> KResult<L2TableCap> {
            let n = self.bump_call("create_l2_table");
            if self.should_fail(FailPoint::CreateL2Table(n)) {
                return Err(KernelError::CapabilityFailure {
                    operation: "create_l2_table",
                });
            }
            Ok(L2TableCap(slot))
        }

        fn retype_to_frame(&mut self, ram: RamCap, slot: Cap, bytes: usize) -> KResult<FrameCap> {
            let n = self.bump_call("retype_to_frame");
            if self.should_fail(FailPoint::RetypeToFrame(n)) {
                return Err(KernelError::CapabilityFailure {
                    operation: "retype_to_frame",
                });
            }
            let _ = ram;
            Ok(RamCap { cap: slot, bytes })
        }

        fn map(
            &mut self,
            _into: Cap,
            _dest_index: usize,
            src: Cap,
            _num_pages: usize,
            _flags: MapFlags,
        ) -> KResult<MappingCap> {
            let n = self.bump_call("map");
            if self.should_fail(FailPoint::Map(n)) {
                return Err(KernelError::CapabilityFailure { operation: "map" });
            }
            Ok(MappingCap(src))
        }

        fn unmap(&mut self, _mapping: MappingCap) -> KResult<()> {
            self.bump_call("unmap");
            Ok(())
        }

        fn destroy(&mut self, cap: Cap) -> KResult<()> {
            self.bump_call("destroy");
            self.live.remove(&cap.raw());
            Ok(())
        }

        fn alloc_ram(&mut self, bytes: usize, _align: usize) -> KResult<RamCap> {
            let n = self.bump_call("alloc_ram");
            if self.should_fail(FailPoint::AllocRam(n)) {
                return Err(KernelError::OutOfRam);
            }
            let cap = self.alloc_slot()?;
            Ok(RamCap { cap, bytes })
        }

        fn free_ram(&mut self, ram: RamCap) -> KResult<()> {
            self.bump_call("free_ram");
            self.live.remove(&ram.cap.raw());
            Ok(())
        }

        fn create_endpoint(&mut self, slot: Cap) -> KResult<EndpointCap> {
            self.bump_call("create_endpoint");
            self.mailboxes.entry(slot.raw()).or_default();
            Ok(EndpointCap(slot))
        }

        fn endpoint_send(&mut self, dest: EndpointCap, msg: LmpMessage) -> KResult<()> {
            self.bump_call("endpoint_send");
            self.mailboxes.entry(dest.0.raw()).or_default().push_back(msg);
            Ok(())
        }

        fn endpoint_recv(&mut self, local: EndpointCap) -> KResult<LmpMessage> {
            let n = self.bump_call("endpoint_recv");
            if self.should_fail(FailPoint::EndpointRecv(n)) {
                return Err(KernelError::CapabilityFailure { operation: "endpoint_recv" });
            }
            self.mailboxes
                .get_mut(&local.0.raw())
                .and_then(alloc::collections::VecDeque::pop_front)
                .ok_or(KernelError::CapabilityFailure { operation: "endpoint_recv" })
        }
    }
}
