//! Bit-exact raw page-table entry codec (spec.md §6.1).
//!
//! These bit positions are hardware-defined: the device MMU walks the raw
//! tables directly, so every encode/decode here must match §6.1 exactly.
//! Each entry type is a thin wrapper over the word(s) actually stored in a
//! [`crate::backing_page::BackingPage`].

use crate::DEVICE_PAGE_SHIFT;

// ---------------------------------------------------------------------------
// L2 entry — 32 bits: {valid, pending, l1_base[39:12]}
// ---------------------------------------------------------------------------

const L2_VALID: u32 = 1 << 0;
const L2_PENDING: u32 = 1 << 1;
/// L1 base address is stored 4 KiB-aligned, right-shifted into bits [31:4].
const L2_BASE_SHIFT: u32 = 4;
const L2_BASE_ADDR_SHIFT: u32 = 12;

/// L2 (root) raw entry: points at one L1 table, 4 KiB-aligned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct L2Entry(pub u32);

impl L2Entry {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 & L2_VALID != 0
    }

    pub fn is_pending(&self) -> bool {
        self.0 & L2_PENDING != 0
    }

    /// Build a valid entry pointing at `l1_base` (must be 4 KiB-aligned).
    pub fn new(l1_base: u64) -> Self {
        debug_assert_eq!(l1_base & 0xFFF, 0, "L1 base must be 4 KiB-aligned");
        debug_assert!(l1_base < (1u64 << 40), "L1 base must fit the MMU's 40-bit table range");
        let shifted = ((l1_base >> L2_BASE_ADDR_SHIFT) as u32) << L2_BASE_SHIFT;
        Self(shifted | L2_VALID)
    }

    /// The L1 table's base address, or `0` if this entry is not valid.
    pub fn l1_base(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        ((self.0 >> L2_BASE_SHIFT) as u64) << L2_BASE_ADDR_SHIFT
    }
}

// ---------------------------------------------------------------------------
// L1 entry — 64 bits: {valid, page_size[3..1], l0_base[39:5], pending[40]}
// ---------------------------------------------------------------------------

const L1_VALID: u64 = 1 << 0;
const L1_PAGE_SIZE_SHIFT: u64 = 1;
const L1_PAGE_SIZE_MASK: u64 = 0b111 << L1_PAGE_SIZE_SHIFT;
const L1_BASE_SHIFT: u32 = 5;
const L1_PENDING: u64 = 1 << 40;

/// Hardware page-size code stored in an L1 entry's `page_size` field
/// (spec.md §6.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageSizeCode {
    Size4K = 0,
    Size16K = 1,
    Size64K = 2,
    Size256K = 3,
    Size1M = 4,
    Size2M = 5,
}

impl PageSizeCode {
    /// The code for the build's configured `DEVICE_PAGE_SHIFT`.
    pub const CURRENT: Self = {
        match DEVICE_PAGE_SHIFT {
            12 => PageSizeCode::Size4K,
            14 => PageSizeCode::Size16K,
            16 => PageSizeCode::Size64K,
            18 => PageSizeCode::Size256K,
            20 => PageSizeCode::Size1M,
            21 => PageSizeCode::Size2M,
            _ => unreachable!(),
        }
    };
}

/// L1 (mid-level) raw entry: points at one L0 table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct L1Entry(pub u64);

impl L1Entry {
    pub const INVALID: Self = Self(0);

    /// Mask selecting `l0_base` bits `[39:5]` in the raw word (spec.md
    /// §6.1): the L0 table's DMA address must itself fit in the 40-bit
    /// range the MMU's table walker can address.
    const BASE_MASK: u64 = ((1u64 << 40) - 1) & !((1u64 << L1_BASE_SHIFT) - 1);

    pub fn is_valid(&self) -> bool {
        self.0 & L1_VALID != 0
    }

    pub fn is_pending(&self) -> bool {
        self.0 & L1_PENDING != 0
    }

    /// Build a valid entry pointing at `l0_base`, tagged with the current
    /// build's page-size code. The base's low-bit alignment requirement is
    /// page-size dependent (spec.md §3); this build always writes
    /// [`PageSizeCode::CURRENT`], so the alignment in force is always
    /// [`crate::HOST_PAGE_SIZE`].
    pub fn new(l0_base: u64) -> Self {
        debug_assert_eq!(l0_base & (crate::HOST_PAGE_SIZE - 1), 0);
        debug_assert!(l0_base < (1u64 << 40), "L0 base must fit the MMU's 40-bit table range");
        let page_size = (PageSizeCode::CURRENT as u64) << L1_PAGE_SIZE_SHIFT;
        let base = l0_base & Self::BASE_MASK;
        Self(base | page_size | L1_VALID)
    }

    pub fn page_size(&self) -> u8 {
        ((self.0 & L1_PAGE_SIZE_MASK) >> L1_PAGE_SIZE_SHIFT) as u8
    }

    pub fn l0_base(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        self.0 & Self::BASE_MASK
    }
}

// ---------------------------------------------------------------------------
// L0 entry — 64 bits, the leaf, per spec.md §6.1
// ---------------------------------------------------------------------------

const L0_VALID: u64 = 1 << 0;
const L0_READ_ONLY: u64 = 1 << 1;
const L0_CACHE_COHERENT: u64 = 1 << 2;
const L0_SLC_BYPASS: u64 = 1 << 3;
const L0_PM_SRC: u64 = 1 << 4;
const L0_PENDING: u64 = 1 << 5;
const L0_PM_FW_PROTECT: u64 = 1 << 62;
/// `vp_page` low bits, [11:6].
const L0_VP_LOW_SHIFT: u32 = 6;
const L0_VP_LOW_MASK: u64 = 0x3F << L0_VP_LOW_SHIFT;
/// `vp_page` high bits, [61:40].
const L0_VP_HIGH_SHIFT: u32 = 40;
const L0_VP_HIGH_BITS: u32 = 22;
const L0_VP_HIGH_MASK: u64 = ((1u64 << L0_VP_HIGH_BITS) - 1) << L0_VP_HIGH_SHIFT;

/// Flags an L0 entry carries alongside the physical page (spec.md §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct L0Flags {
    pub read_only: bool,
    pub cache_coherent: bool,
    pub slc_bypass: bool,
    pub pm_src: bool,
    pub pm_fw_protect: bool,
}

/// L0 (leaf) raw entry: one DMA-addressable device page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct L0Entry(pub u64);

impl L0Entry {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 & L0_VALID != 0
    }

    pub fn is_pending(&self) -> bool {
        self.0 & L0_PENDING != 0
    }

    /// Mask selecting `phys_page` bits `[39:DEVICE_PAGE_SHIFT]` in the raw
    /// word. The address is device-page aligned, so its low
    /// `DEVICE_PAGE_SHIFT` bits are already zero and can be OR'd in
    /// directly alongside the flag bits below them, the same way
    /// `PageTableEntry::set` packs an x86 PTE.
    const PHYS_MASK: u64 = ((1u64 << 40) - 1) & !((1u64 << DEVICE_PAGE_SHIFT) - 1);

    /// Build a valid leaf entry for `phys_page` (device-page aligned).
    pub fn new(phys_page: u64, flags: L0Flags, vp_page: u64) -> Self {
        debug_assert_eq!(phys_page & crate::DEVICE_PAGE_MASK, 0);
        let mut bits = phys_page & Self::PHYS_MASK;
        bits |= L0_VALID;
        if flags.read_only {
            bits |= L0_READ_ONLY;
        }
        if flags.cache_coherent {
            bits |= L0_CACHE_COHERENT;
        }
        if flags.slc_bypass {
            bits |= L0_SLC_BYPASS;
        }
        if flags.pm_src {
            bits |= L0_PM_SRC;
        }
        if flags.pm_fw_protect {
            bits |= L0_PM_FW_PROTECT;
        }
        bits |= (vp_page << L0_VP_LOW_SHIFT) & L0_VP_LOW_MASK;
        bits |= (vp_page >> 6 << L0_VP_HIGH_SHIFT) & L0_VP_HIGH_MASK;
        Self(bits)
    }

    pub fn phys_page(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        self.0 & Self::PHYS_MASK
    }

    pub fn flags(&self) -> L0Flags {
        L0Flags {
            read_only: self.0 & L0_READ_ONLY != 0,
            cache_coherent: self.0 & L0_CACHE_COHERENT != 0,
            slc_bypass: self.0 & L0_SLC_BYPASS != 0,
            pm_src: self.0 & L0_PM_SRC != 0,
            pm_fw_protect: self.0 & L0_PM_FW_PROTECT != 0,
        }
    }
}
