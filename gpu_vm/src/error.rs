//! Public error taxonomy (spec.md §7).
//!
//! `NotPresent` is deliberately not a variant here: it is an internal
//! sentinel produced by [`crate::cursor::Cursor::load_tables`] when a walk
//! into an unallocated subtree is not allowed to create tables, and it
//! never crosses the public boundary — callers that can tolerate it (range
//! unmap) swallow it, callers that cannot translate it into
//! [`VmError::InvalidArgument`].

use snafu::Snafu;

/// Errors returned at the public boundary of the VM subsystem.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum VmError {
    /// Bad alignment, bad range, or an unmap/lookup handle that does not
    /// match an installed mapping's exact start address.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: &'static str },

    /// The requested range overlaps an already-installed mapping.
    #[snafu(display("range [{start:#x}, +{size:#x}) is already mapped"))]
    AlreadyMapped { start: u64, size: u64 },

    /// `unmap`/reverse-lookup found no matching mapping.
    #[snafu(display("no mapping at {addr:#x}"))]
    NotFound { addr: u64 },

    /// A backing-page or mapping-node allocation failed.
    #[snafu(display("out of memory"))]
    OutOfMemory,

    /// `mmu_flush` did not complete within its timeout.
    #[snafu(display("MMU flush timed out"))]
    Timeout,

    /// The cursor tried to advance past the top of the address space.
    #[snafu(display("cursor advance wrapped past the top of the address space"))]
    HierarchyWrap,
}

/// Internal-only sentinel (spec.md §7). Not part of [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Internal {
    /// A table was missing and creation was not requested.
    NotPresent,
    /// One of the public [`VmError`] kinds, already fully formed.
    Public(VmError),
}

impl From<VmError> for Internal {
    fn from(e: VmError) -> Self {
        Internal::Public(e)
    }
}

pub(crate) type IResult<T> = core::result::Result<T, Internal>;
pub(crate) type Result<T> = core::result::Result<T, VmError>;
