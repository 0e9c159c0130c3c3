// SPDX-License-Identifier: BlueOak-1.0.0

//! Error kinds for the UMP channel primitives.

use snafu::Snafu;

/// Failure kinds surfaced by [`crate::Channel`].
///
/// `NoMessage` is the one variant that is not really a failure: it is
/// the non-blocking "nothing here yet" result of `recv_one`, polled by
/// [`crate::Channel::recv_blocking`] rather than propagated as a hard
/// error.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum UmpError {
    /// A payload handed to `send_one` does not fit in one slot.
    #[snafu(display("UMP payload of {len} bytes exceeds the {max}-byte slot capacity"))]
    BufferTooLarge {
        /// The payload length that was rejected.
        len: usize,
        /// The slot's payload capacity.
        max: usize,
    },
    /// The polled slot is not yet valid — a polling condition, not a
    /// hard error.
    #[snafu(display("no UMP message available"))]
    NoMessage,
}

/// Shorthand for `Result<T, UmpError>`.
pub type UResult<T> = Result<T, UmpError>;
