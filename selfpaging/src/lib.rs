// SPDX-License-Identifier: BlueOak-1.0.0

//! User-level self-paging engine: VSpace manager, shadow page-table
//! manager, page-fault handler and the [`AddressSpace`] that ties them
//! together.
//!
//! This crate targets a single architecture — ARMv7's short-descriptor
//! two-level translation table — and paging state is single-threaded
//! per address space, guarded by a try-lock that rejects rather than
//! queues concurrent fault service.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address_space;
pub mod arch;
pub mod error;
pub mod fault;
pub mod shadow_pt;
pub mod slab;
pub mod vspace;

pub use address_space::{AddressSpace, ProcessRole};
pub use error::{PResult, PagingError};
pub use fault::FaultHandler;
pub use shadow_pt::ShadowPageTable;
pub use slab::SlabPool;
pub use vspace::VSpace;
