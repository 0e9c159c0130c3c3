// SPDX-License-Identifier: BlueOak-1.0.0

//! Dual-ring shared-memory channel between two cores.
//!
//! Two equal-size rings share one memory region, a one-bit selector
//! tells each endpoint which ring it sends on, and a per-slot `valid`
//! flag is the only state that ever crosses cores. Everything else
//! (the payload, `msg_type`, `last`) is plain memory, made visible to
//! the other core only because a memory barrier is issued on both
//! sides of every `valid` transition.

use crate::error::{UResult, UmpError};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicBool, Ordering};

/// Bytes per cache line, and thus per ring slot.
pub const CACHE_LINE_BYTES: usize = 64;

const SLOT_HEADER_BYTES: usize = core::mem::size_of::<u8>() // msg_type
    + core::mem::size_of::<bool>() // last
    + core::mem::size_of::<bool>(); // valid, stored as an AtomicBool below

/// Payload bytes carried by one slot, after the `msg_type`/`last`/
/// `valid` header is subtracted from one cache line.
pub const SLOT_PAYLOAD_BYTES: usize = CACHE_LINE_BYTES - SLOT_HEADER_BYTES;

/// Slots per ring. Chosen so that one ring occupies exactly one base
/// page (`64 slots * 64 bytes = 4 KiB`); recorded in `DESIGN.md`.
pub const UMP_NUM_SLOTS: usize = 64;

/// One ring slot: a cache line holding a payload, a message-type tag,
/// a last-fragment flag and the cross-core `valid` bit.
#[repr(C, align(64))]
struct Slot {
    data: [u8; SLOT_PAYLOAD_BYTES],
    msg_type: u8,
    last: bool,
    valid: AtomicBool,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Slot>(), CACHE_LINE_BYTES);

impl Slot {
    const fn zeroed() -> Self {
        Slot {
            data: [0u8; SLOT_PAYLOAD_BYTES],
            msg_type: 0,
            last: false,
            valid: AtomicBool::new(false),
        }
    }
}

/// One direction's worth of ring slots.
#[repr(C)]
pub struct UmpRing {
    slots: [Slot; UMP_NUM_SLOTS],
}

impl UmpRing {
    const fn zeroed() -> Self {
        const SLOT: Slot = Slot::zeroed();
        UmpRing { slots: [SLOT; UMP_NUM_SLOTS] }
    }
}

impl Default for UmpRing {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// The shared-memory region backing one UMP channel: two rings, one
/// per direction. Both endpoints map (or, in tests, share) the same
/// region and address it with complementary `buf_select` values.
#[repr(C)]
pub struct UmpSharedRegion {
    rings: [UmpRing; 2],
}

impl UmpSharedRegion {
    /// A freshly zeroed region: every slot invalid, every counter
    /// implicitly zero once paired with a [`Channel`].
    pub const fn zeroed() -> Self {
        UmpSharedRegion { rings: [UmpRing::zeroed(), UmpRing::zeroed()] }
    }
}

impl Default for UmpSharedRegion {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// One endpoint of a UMP channel: a selector into a shared
/// [`UmpSharedRegion`] plus this endpoint's own send/receive cursors
/// and an ack counter.
///
/// The two endpoints of a channel are never both owned by the same
/// core — one side's `buf_select` is the other's `1 - buf_select` —
/// so sharing the backing region between them is inherently a
/// cross-core aliasing pattern the borrow checker cannot see through.
/// [`Channel`] therefore holds a raw pointer and only ever touches the
/// region through raw-pointer field access; the `valid` flag (an
/// `AtomicBool`) is the one field ever accessed concurrently, and
/// every other field access is bracketed by an explicit memory
/// barrier.
pub struct Channel {
    region: NonNull<UmpSharedRegion>,
    buf_select: u8,
    tx_counter: usize,
    rx_counter: usize,
    ack_counter: u32,
}

// SAFETY: a `Channel` only ever touches its own tx ring (index
// `buf_select`) for writes and the other ring for reads gated by the
// `valid` flag; it carries no other non-atomic shared mutable state
// across the pointer it was constructed from.
unsafe impl Send for Channel {}

impl Channel {
    /// Bind an endpoint to `region` with the given buffer selector.
    ///
    /// # Safety
    /// `region` must outlive this `Channel`, and the complementary
    /// endpoint (if any, in this address space or another core's) must
    /// be constructed over the very same region with
    /// `1 - buf_select`. The caller is responsible for that region
    /// being backed by memory actually shared with the other core —
    /// this crate has no way to verify that.
    pub unsafe fn new(region: *mut UmpSharedRegion, buf_select: u8) -> Self {
        debug_assert!(buf_select < 2);
        Channel {
            region: NonNull::new_unchecked(region),
            buf_select,
            tx_counter: 0,
            rx_counter: 0,
            ack_counter: 0,
        }
    }

    /// This endpoint's buffer selector (0 or 1).
    pub fn buf_select(&self) -> u8 {
        self.buf_select
    }

    /// Count of acknowledged messages. The send/recv primitives below
    /// never touch it themselves — it is reserved for a higher-level
    /// flow-control layer built on top.
    pub fn ack_counter(&self) -> u32 {
        self.ack_counter
    }

    /// Record one more acknowledged message.
    pub fn bump_ack(&mut self) {
        self.ack_counter = self.ack_counter.wrapping_add(1);
    }

    fn slot_ptr(&self, ring: usize, index: usize) -> *mut Slot {
        debug_assert!(ring < 2);
        debug_assert!(index < UMP_NUM_SLOTS);
        // SAFETY: `region` is valid for the lifetime of `self` per the
        // contract of `new`; we only ever form a raw pointer to one
        // slot, never a `&mut UmpSharedRegion` that would alias the
        // other endpoint's live reference to the same memory.
        unsafe {
            let rings = core::ptr::addr_of_mut!((*self.region.as_ptr()).rings);
            let ring_ptr = (rings as *mut UmpRing).add(ring);
            let slots = core::ptr::addr_of_mut!((*ring_ptr).slots);
            (slots as *mut Slot).add(index)
        }
    }

    /// Send one slot's worth of `buf`.
    ///
    /// Spins until the slot this endpoint is about to write is marked
    /// consumed (`valid == false`) by the other side, then writes the
    /// payload (zero-filling any unused tail so a partial final
    /// fragment never leaks stale slot contents to the reader),
    /// `msg_type` and `last`, and finally sets `valid = true` —
    /// bracketed by a release barrier.
    pub fn send_one(&mut self, buf: &[u8], msg_type: u8, last: bool) -> UResult<()> {
        if buf.len() > SLOT_PAYLOAD_BYTES {
            return Err(UmpError::BufferTooLarge { len: buf.len(), max: SLOT_PAYLOAD_BYTES });
        }

        let slot = self.slot_ptr(self.buf_select as usize, self.tx_counter);
        // SAFETY: `slot` is a live slot in the shared region; `valid`
        // is the only field accessed without the write barrier below
        // already in place, which is fine since it is atomic.
        let valid = unsafe { &(*slot).valid };
        while valid.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // SAFETY: `valid` is false, so the other side is not reading
        // this slot's non-atomic fields right now.
        unsafe {
            let data = core::ptr::addr_of_mut!((*slot).data);
            (*data)[..buf.len()].copy_from_slice(buf);
            (*data)[buf.len()..].fill(0);
            core::ptr::addr_of_mut!((*slot).msg_type).write(msg_type);
            core::ptr::addr_of_mut!((*slot).last).write(last);
        }
        fence(Ordering::Release);
        valid.store(true, Ordering::Release);

        self.tx_counter = (self.tx_counter + 1) % UMP_NUM_SLOTS;
        Ok(())
    }

    /// Receive one slot's worth into `out`. Non-blocking: returns [`UmpError::NoMessage`] immediately if
    /// the next slot in this endpoint's receive ring is not yet valid.
    pub fn recv_one(&mut self, out: &mut [u8; SLOT_PAYLOAD_BYTES]) -> UResult<(u8, bool)> {
        let rx_ring = 1 - self.buf_select as usize;
        let slot = self.slot_ptr(rx_ring, self.rx_counter);
        // SAFETY: see `send_one`.
        let valid = unsafe { &(*slot).valid };
        if !valid.load(Ordering::Acquire) {
            return Err(UmpError::NoMessage);
        }

        fence(Ordering::Acquire);
        // SAFETY: `valid` was observed true, so the sender has already
        // finished writing these fields and issued its own release
        // barrier; we have not yet cleared `valid`, so it cannot start
        // overwriting them underneath us.
        let (msg_type, last) = unsafe {
            out.copy_from_slice(&*core::ptr::addr_of!((*slot).data));
            (*core::ptr::addr_of!((*slot).msg_type), *core::ptr::addr_of!((*slot).last))
        };
        fence(Ordering::Acquire);
        valid.store(false, Ordering::Release);

        self.rx_counter = (self.rx_counter + 1) % UMP_NUM_SLOTS;
        Ok((msg_type, last))
    }

    /// Send `buf` in full, fragmenting across as many slots as needed
    /// and tagging every fragment with `msg_type`; only the final
    /// fragment carries `last = true`.
    pub fn send(&mut self, buf: &[u8], msg_type: u8) -> UResult<()> {
        let mut remaining = buf;
        loop {
            let chunk_len = remaining.len().min(SLOT_PAYLOAD_BYTES);
            let is_last = remaining.len() <= SLOT_PAYLOAD_BYTES;
            self.send_one(&remaining[..chunk_len], msg_type, is_last)?;
            remaining = &remaining[chunk_len..];
            if is_last {
                return Ok(());
            }
        }
    }

    /// Receive one complete, possibly multi-fragment message.
    ///
    /// The first fragment is a single, non-blocking `recv_one`: if
    /// nothing has arrived yet this returns `NoMessage` immediately,
    /// exactly like the single-slot primitive. Once a first fragment
    /// has been observed, this commits to the message and spins on
    /// `recv_one` (tolerating `NoMessage` only) until every fragment
    /// has arrived, asserting every fragment carries the same
    /// `msg_type`.
    ///
    /// The returned buffer's length is always a whole multiple of
    /// [`SLOT_PAYLOAD_BYTES`], since the ring geometry carries no
    /// explicit length field. A caller that needs the exact byte count
    /// of what was sent must encode it inside the payload itself.
    pub fn recv(&mut self) -> UResult<(Vec<u8>, u8)> {
        let mut fragment = [0u8; SLOT_PAYLOAD_BYTES];
        let (msg_type, mut last) = self.recv_one(&mut fragment)?;
        let mut out = Vec::with_capacity(SLOT_PAYLOAD_BYTES);
        out.extend_from_slice(&fragment);

        while !last {
            let (this_type, this_last) = loop {
                match self.recv_one(&mut fragment) {
                    Ok(result) => break result,
                    Err(UmpError::NoMessage) => continue,
                    Err(e) => return Err(e),
                }
            };
            assert_eq!(
                this_type, msg_type,
                "UMP fragment carried a msg_type inconsistent with the first fragment"
            );
            out.extend_from_slice(&fragment);
            last = this_last;
        }
        Ok((out, msg_type))
    }

    /// Busy-loop [`recv`](Self::recv) until a message arrives.
    pub fn recv_blocking(&mut self) -> (Vec<u8>, u8) {
        loop {
            match self.recv() {
                Ok(result) => return result,
                Err(UmpError::NoMessage) => continue,
                Err(e) => unreachable!("recv_blocking saw an unexpected error: {e:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn leak_region() -> &'static mut UmpSharedRegion {
        Box::leak(Box::new(UmpSharedRegion::zeroed()))
    }

    /// Two endpoints over one leaked region, selectors 0 and 1 —
    /// standing in for "core A" and "core B" within a single test
    /// process.
    fn paired_channels() -> (Channel, Channel) {
        let region = leak_region();
        let ptr: *mut UmpSharedRegion = region;
        unsafe { (Channel::new(ptr, 0), Channel::new(ptr, 1)) }
    }

    #[test]
    fn send_one_then_recv_one_roundtrip() {
        let (mut a, mut b) = paired_channels();
        a.send_one(b"hello", 7, true).unwrap();

        let mut buf = [0u8; SLOT_PAYLOAD_BYTES];
        let (msg_type, last) = b.recv_one(&mut buf).unwrap();
        assert_eq!(msg_type, 7);
        assert!(last);
        assert_eq!(&buf[..5], b"hello");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn recv_one_on_empty_ring_is_no_message() {
        let (_a, mut b) = paired_channels();
        let mut buf = [0u8; SLOT_PAYLOAD_BYTES];
        assert_eq!(b.recv_one(&mut buf), Err(UmpError::NoMessage));
    }

    #[test]
    fn send_one_rejects_oversized_payload() {
        let (mut a, _b) = paired_channels();
        let oversized = alloc::vec![0u8; SLOT_PAYLOAD_BYTES + 1];
        assert_eq!(
            a.send_one(&oversized, 0, true),
            Err(UmpError::BufferTooLarge { len: SLOT_PAYLOAD_BYTES + 1, max: SLOT_PAYLOAD_BYTES })
        );
    }

    #[test]
    fn send_one_spins_until_slot_consumed() {
        let (mut a, mut b) = paired_channels();
        // Fill every slot in A's tx ring without draining it.
        for _ in 0..UMP_NUM_SLOTS {
            a.send_one(b"x", 1, false).unwrap();
        }
        let mut buf = [0u8; SLOT_PAYLOAD_BYTES];
        // Drain exactly one slot on B's side so A's wraparound send has
        // somewhere to land.
        b.recv_one(&mut buf).unwrap();
        // This would spin forever if `send_one` did not correctly wrap
        // `tx_counter` back onto the now-free slot.
        a.send_one(b"y", 1, false).unwrap();
    }

    #[test]
    fn fragmented_round_trip_reassembles_exact_prefix() {
        let (mut a, mut b) = paired_channels();
        let payload: alloc::vec::Vec<u8> = (0..96u32).map(|i| (i % 251) as u8).collect();
        a.send(&payload, 42).unwrap();

        let (received, msg_type) = b.recv().unwrap();
        assert_eq!(msg_type, 42);
        let expected_fragments = (96 + SLOT_PAYLOAD_BYTES - 1) / SLOT_PAYLOAD_BYTES;
        assert_eq!(received.len(), expected_fragments * SLOT_PAYLOAD_BYTES);
        assert_eq!(&received[..96], &payload[..]);
        assert!(received[96..].iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "inconsistent")]
    fn fragments_must_share_one_msg_type() {
        // Manually interleave two different msg_types on the same ring
        // the way a corrupt sender might, and confirm `recv` asserts.
        let (mut a, mut b) = paired_channels();
        a.send_one(b"first", 1, false).unwrap();
        a.send_one(b"second", 2, true).unwrap();
        let _ = b.recv();
    }

    #[test]
    fn recv_blocking_waits_for_a_later_send() {
        let (mut a, mut b) = paired_channels();
        a.send_one(b"late", 9, true).unwrap();
        let (received, msg_type) = b.recv_blocking();
        assert_eq!(msg_type, 9);
        assert_eq!(&received[..4], b"late");
    }

    #[test]
    fn two_directions_do_not_interfere() {
        let (mut a, mut b) = paired_channels();
        a.send_one(b"to-b", 1, true).unwrap();
        b.send_one(b"to-a", 2, true).unwrap();

        let mut buf = [0u8; SLOT_PAYLOAD_BYTES];
        let (t, _) = b.recv_one(&mut buf).unwrap();
        assert_eq!(t, 1);
        assert_eq!(&buf[..4], b"to-b");

        let (t2, _) = a.recv_one(&mut buf).unwrap();
        assert_eq!(t2, 2);
        assert_eq!(&buf[..4], b"to-a");
    }

    #[test]
    fn ack_counter_is_caller_managed() {
        let (mut a, _b) = paired_channels();
        assert_eq!(a.ack_counter(), 0);
        a.bump_ack();
        a.bump_ack();
        assert_eq!(a.ack_counter(), 2);
    }
}
