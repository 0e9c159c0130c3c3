// SPDX-License-Identifier: BlueOak-1.0.0

//! Lock-free, cache-line-granular shared-memory message channel
//! between two cores.
//!
//! Paging state is per address space and never shared across cores;
//! when one core's user-level code needs something from another core
//! — a remote spawn request, a remote memory grant — it goes through
//! a [`Channel`] instead. `lmp` depends on this crate for exactly that
//! one case.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod channel;
mod error;

pub use channel::{Channel, UmpRing, UmpSharedRegion, CACHE_LINE_BYTES, SLOT_PAYLOAD_BYTES, UMP_NUM_SLOTS};
pub use error::{UResult, UmpError};
