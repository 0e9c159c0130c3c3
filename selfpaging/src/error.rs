// SPDX-License-Identifier: BlueOak-1.0.0

//! The error taxonomy shared by every module in this crate.

use kcap::KernelError;
use snafu::Snafu;

/// Errors the self-paging engine can return. Transport crates
/// (`lmp`, `ump`) re-export this where they surface paging failures
/// through message replies.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[snafu(visibility(pub(crate)))]
pub enum PagingError {
    /// A size, alignment or address argument was invalid.
    #[snafu(display("invalid argument: {detail}"))]
    InvalidArgument {
        /// Human-readable detail, stable enough to assert on in tests.
        detail: &'static str,
    },

    /// A kernel primitive (map/unmap/create/retype/destroy) failed.
    /// Never swallowed — the source error is carried verbatim.
    #[snafu(display("kernel capability failure: {source}"))]
    KernelCapability {
        /// The underlying kernel error.
        source: KernelError,
    },

    /// Slabs, slots or RAM ran out.
    #[snafu(display("exhausted: {resource}"))]
    Exhausted {
        /// Which resource was exhausted ("slab", "slot", "ram").
        resource: &'static str,
    },

    /// `release` was asked to free a base address not present in the
    /// allocated list.
    #[snafu(display("region not found at {addr:#x}"))]
    RegionNotFound {
        /// The address that was looked up.
        addr: usize,
    },

    /// A condition the fault handler treats as unrecoverable: null
    /// dereference, kernel-space address, or stack overflow. The
    /// process aborts; this is never returned to a caller that could
    /// retry.
    #[snafu(display("fatal fault: {reason}"))]
    Fatal {
        /// Which fatal condition was hit.
        reason: &'static str,
    },
}

impl From<KernelError> for PagingError {
    fn from(source: KernelError) -> Self {
        PagingError::KernelCapability { source }
    }
}

/// Result alias used throughout `selfpaging`.
pub type PResult<T> = Result<T, PagingError>;
