//! Device virtual-memory subsystem for a tile-based rasterizer GPU.
//!
//! Owns a per-context three-level page-table tree that translates a 40-bit
//! device-virtual address space into host DMA addresses, plus the interval
//! index of currently installed mappings. The three data structures that
//! must stay mutually consistent under every failure path are:
//!
//! - [`tree`] — the mirror page-table tree (L2 root, L1, L0) with per-table
//!   valid-entry refcounts and cascading lazy creation/destruction.
//! - [`cursor`] — the walker that creates/destroys leaves and batches
//!   CPU→device syncs.
//! - [`mapping`] — the augmented interval index of installed mappings.
//!
//! Above these sits [`context::VmContext`], the public façade.
//!
//! Job submission, firmware command channels, GEM buffer allocation,
//! scatter-gather construction, and ioctl marshalling are external
//! collaborators; see the [`device`] module for the traits a host driver
//! implements to plug into this crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod backing_page;
pub mod context;
pub mod cursor;
pub mod device;
pub mod entry;
pub mod error;
pub mod heap;
pub mod mapping;
pub mod sgl;
pub mod tree;

#[cfg(test)]
mod test_support;

pub use context::{Located, VmContext};
pub use device::{CommandChannel, Device, GemObject};
pub use error::VmError;

// ---------------------------------------------------------------------------
// Device page size (build-time constant, spec.md §3/§4.9)
// ---------------------------------------------------------------------------
//
// Exactly one `page-*` feature is expected to be enabled (see Cargo.toml);
// `page-4k` is the crate default. Selecting the constant at compile time
// lets the entry codec and the index-decomposition math in this module be
// specialised rather than carry a runtime page-size field, per design note
// §9(a) of SPEC_FULL.md.

cfg_if::cfg_if! {
    if #[cfg(feature = "page-2m")] {
        /// `log2(DEVICE_PAGE_SIZE)`.
        pub const DEVICE_PAGE_SHIFT: u32 = 21;
    } else if #[cfg(feature = "page-1m")] {
        pub const DEVICE_PAGE_SHIFT: u32 = 20;
    } else if #[cfg(feature = "page-256k")] {
        pub const DEVICE_PAGE_SHIFT: u32 = 18;
    } else if #[cfg(feature = "page-64k")] {
        pub const DEVICE_PAGE_SHIFT: u32 = 16;
    } else if #[cfg(feature = "page-16k")] {
        pub const DEVICE_PAGE_SHIFT: u32 = 14;
    } else {
        pub const DEVICE_PAGE_SHIFT: u32 = 12;
    }
}

/// Device page size in bytes, one of {4K, 16K, 64K, 256K, 1M, 2M}.
pub const DEVICE_PAGE_SIZE: u64 = 1u64 << DEVICE_PAGE_SHIFT;

/// Mask of the low, in-page bits of a device address.
pub const DEVICE_PAGE_MASK: u64 = DEVICE_PAGE_SIZE - 1;

/// The host page backing every raw page table. Must be at least as large
/// as the device page size (spec.md §3); below that floor it is a fixed
/// 4 KiB, matching the common host MMU page size.
pub const HOST_PAGE_SIZE: u64 = {
    const FLOOR: u64 = 4096;
    if DEVICE_PAGE_SIZE > FLOOR {
        DEVICE_PAGE_SIZE
    } else {
        FLOOR
    }
};

/// Width of the device-virtual address space: 40 bits, 1 TiB (spec.md §3).
pub const ADDR_BITS: u32 = 40;

/// Size of the device-virtual address space in bytes.
pub const ADDR_SPACE_SIZE: u64 = 1u64 << ADDR_BITS;

/// Mask of the valid low `ADDR_BITS` bits of a device address.
pub const ADDR_MASK: u64 = ADDR_SPACE_SIZE - 1;

/// `floor(log2(HOST_PAGE_SIZE / 8))` — the number of index bits an L1 or L0
/// table can address given one backing page of 64-bit raw entries. Both
/// levels use 64-bit entries and the same backing-page size, so they share
/// this capacity.
const fn leaf_capacity_bits() -> u32 {
    let entries = HOST_PAGE_SIZE / 8;
    63 - entries.leading_zeros()
}

const fn const_min(a: u32, b: u32) -> u32 {
    if a < b {
        a
    } else {
        b
    }
}

/// Number of `l0_idx` bits. Filled to capacity first (spec.md §4.9 / design
/// note §9(a): the L0 table is walked most often, so it is kept as wide as
/// one backing page allows).
pub const L0_IDX_BITS: u32 = const_min(leaf_capacity_bits(), ADDR_BITS - DEVICE_PAGE_SHIFT);

/// Number of `l1_idx` bits. Takes whatever remains after L0, capped at the
/// same per-table capacity.
pub const L1_IDX_BITS: u32 = const_min(
    leaf_capacity_bits(),
    ADDR_BITS - DEVICE_PAGE_SHIFT - L0_IDX_BITS,
);

/// Number of `l2_idx` bits: whatever address space is left over. L2 entries
/// are 32 bits (half the width of L1/L0 entries), so its backing page has
/// twice the capacity; the remainder always fits.
pub const L2_IDX_BITS: u32 = ADDR_BITS - DEVICE_PAGE_SHIFT - L0_IDX_BITS - L1_IDX_BITS;

/// `ROGUE_MMUCTRL_ENTRIES_PT_L2_VALUE` — number of child slots in the L2
/// (root) table.
pub const L2_ENTRIES: usize = 1usize << L2_IDX_BITS;
/// Number of child slots in an L1 table.
pub const L1_ENTRIES: usize = 1usize << L1_IDX_BITS;
/// Number of leaf slots in an L0 table.
pub const L0_ENTRIES: usize = 1usize << L0_IDX_BITS;

const _: () = assert!(L0_IDX_BITS + L1_IDX_BITS + L2_IDX_BITS + DEVICE_PAGE_SHIFT == ADDR_BITS);
const _: () = assert!(L2_ENTRIES * 4 <= HOST_PAGE_SIZE as usize);
const _: () = assert!(L1_ENTRIES * 8 <= HOST_PAGE_SIZE as usize);
const _: () = assert!(L0_ENTRIES * 8 <= HOST_PAGE_SIZE as usize);

/// Index invalid sentinel for `parent_idx` (spec.md §3, §9).
pub const IDX_INVALID: usize = usize::MAX;

/// Split a device-virtual address into `(l2_idx, l1_idx, l0_idx)`.
#[inline]
pub const fn split_addr(addr: u64) -> (usize, usize, usize) {
    let l0_idx = ((addr >> DEVICE_PAGE_SHIFT) & ((L0_ENTRIES as u64) - 1)) as usize;
    let l1_idx = ((addr >> (DEVICE_PAGE_SHIFT + L0_IDX_BITS)) & ((L1_ENTRIES as u64) - 1)) as usize;
    let l2_idx = ((addr >> (DEVICE_PAGE_SHIFT + L0_IDX_BITS + L1_IDX_BITS))
        & ((L2_ENTRIES as u64) - 1)) as usize;
    (l2_idx, l1_idx, l0_idx)
}

/// Reassemble a device-virtual address from its three indices.
#[inline]
pub const fn join_addr(l2_idx: usize, l1_idx: usize, l0_idx: usize) -> u64 {
    (l2_idx as u64) << (DEVICE_PAGE_SHIFT + L0_IDX_BITS + L1_IDX_BITS)
        | (l1_idx as u64) << (DEVICE_PAGE_SHIFT + L0_IDX_BITS)
        | (l0_idx as u64) << DEVICE_PAGE_SHIFT
}
