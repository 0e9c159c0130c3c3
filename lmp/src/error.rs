// SPDX-License-Identifier: BlueOak-1.0.0

//! Error kinds surfaced by this crate's own API (not the `Status` wire
//! code carried inside a reply, which is a successfully-delivered
//! protocol-level result, not a transport failure).

use kcap::KernelError;
use snafu::Snafu;

/// Failures that prevent a request or reply from being framed or
/// delivered at all.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum LmpError {
    /// The kernel endpoint primitive failed. Never swallowed — the
    /// source error is carried verbatim.
    #[snafu(display("kernel capability failure: {source}"))]
    KernelCapability {
        /// The underlying kernel error.
        source: KernelError,
    },
    /// `words[0]` did not decode to a known `RequestKind`.
    #[snafu(display("unrecognised LMP request tag {tag}"))]
    UnknownRequest {
        /// The raw, unrecognised tag value.
        tag: usize,
    },
    /// A string payload does not fit in the short-buf word budget and
    /// no frame capability was supplied to carry it instead.
    #[snafu(display("string payload of {len} bytes needs a frame capability"))]
    PayloadNeedsFrame {
        /// The payload length that did not fit.
        len: usize,
    },
    /// A spawn request's process name exceeds the word-packed name
    /// budget.
    #[snafu(display("process name of {len} bytes exceeds the {max}-byte budget"))]
    NameTooLong {
        /// The name length that was rejected.
        len: usize,
        /// The budget it exceeded.
        max: usize,
    },
}

impl From<KernelError> for LmpError {
    fn from(source: KernelError) -> Self {
        LmpError::KernelCapability { source }
    }
}

/// Shorthand for `Result<T, LmpError>`.
pub type LResult<T> = Result<T, LmpError>;
