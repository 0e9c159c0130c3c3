// SPDX-License-Identifier: BlueOak-1.0.0

//! Local (same-core) capability-carrying message channel: the wire
//! protocol ([`protocol`]) and the server-side dispatch loop
//! ([`server`]) built on top of [`kcap::KernelOps`]'s endpoint
//! primitives.
//!
//! A production LMP channel is a thin wrapper over a pair of kernel
//! endpoint objects; this crate does not introduce its own transport
//! below `KernelOps`. What lives here is the message framing
//! (`protocol`) and the dispatch discipline (`server`) every
//! LMP-speaking server in the system — the memory server, the spawn
//! server, the terminal driver — shares.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod error;
pub mod protocol;
pub mod server;

pub use error::{LResult, LmpError};
pub use protocol::{RequestKind, Status};
pub use server::{forward_spawn_over_ump, DispatchOutcome, Handlers, Server};
