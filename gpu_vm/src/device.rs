//! Host collaborator traits (spec.md §6 — external collaborators).
//!
//! The core never allocates physical memory, talks to a bus, or owns a
//! command ring itself; a host driver implements these traits the way a
//! GPU driver wraps its PCI device and frame allocator behind narrow
//! interfaces for its own ring/DMA needs.

use core::time::Duration;

use crate::error::VmError;

/// One host-page-sized, zero-filled allocation, mapped into both CPU and
/// device (DMA) address spaces. Produced by [`Device::alloc_dma_page`] and
/// consumed by [`crate::backing_page::BackingPage`].
pub struct DmaPage {
    /// Device DMA address, aligned to `HOST_PAGE_SIZE`.
    pub dma_addr: u64,
    /// CPU pointer to the same page.
    pub host_ptr: *mut u8,
}

// SAFETY: `DmaPage` is a plain (address, pointer) pair describing memory
// the host allocator owns; moving it across threads carries no aliasing
// implications by itself. Callers still serialise all access through the
// VM context's lock (spec.md §5).
unsafe impl Send for DmaPage {}

/// Flags requested on an MMU cache invalidate (spec.md §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuInvalidate {
    pub l0: bool,
    pub l1: bool,
    pub l2: bool,
    pub tlb: bool,
    pub interrupt: bool,
}

impl MmuInvalidate {
    /// The VM subsystem always requests every flag simultaneously on every
    /// flush (spec.md §6.2).
    pub const ALL: Self = Self {
        l0: true,
        l1: true,
        l2: true,
        tlb: true,
        interrupt: true,
    };
}

/// Opaque handle to a submitted command (spec.md §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(pub u64);

/// The asynchronous command channel the VM subsystem sends
/// `MMU_CACHE_INVALIDATE` commands on.
pub trait CommandChannel {
    /// Enqueue a command, returning a slot to wait on.
    fn send(&self, cmd: MmuInvalidate) -> SlotId;

    /// Block until `slot` completes or `timeout` elapses.
    fn wait(&self, slot: SlotId, timeout: Duration) -> Result<(), VmError>;
}

/// The device a [`crate::context::VmContext`] is bound to.
pub trait Device {
    /// Width of the device-virtual address space this device's MMU
    /// advertises, validated against [`crate::ADDR_BITS`] at context
    /// creation (spec.md §4.6).
    fn addr_space_bits(&self) -> u32;

    /// Whether the named hardware quirk is present on this chip
    /// (spec.md §6.3, §9 — a runtime property of the probed device, not a
    /// build-time feature).
    fn has_quirk(&self, quirk_id: u32) -> bool;

    /// Allocate one zero-filled, DMA-mapped host page (spec.md §4.1).
    fn alloc_dma_page(&self) -> Result<DmaPage, VmError>;

    /// Release a page previously returned by `alloc_dma_page`.
    ///
    /// # Safety
    /// `page` must have been produced by this same device's
    /// `alloc_dma_page` and must not still be referenced by any live
    /// mirror table.
    unsafe fn free_dma_page(&self, page: DmaPage);

    /// The command channel used for MMU cache invalidation.
    fn command_channel(&self) -> &dyn CommandChannel;
}

/// Flags copied from a buffer object into a mapping at map time
/// (spec.md §3, "Mapping node").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectFlags {
    pub slc_bypass: bool,
    pub pm_fw_protect: bool,
}

/// One physically-contiguous run of a scatter-gather list (spec.md §6,
/// "SGL / SGT").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Device DMA address of the start of this run.
    pub dma_addr: u64,
    /// Length of this run in bytes.
    pub length: u64,
}

/// A buffer object externally refcounted by the host (spec.md §5,
/// "Shared resources"). Cloning a `GemObject` handle is expected to bump
/// the host's refcount, mirroring `Arc::clone`; dropping the last handle
/// releases it. The VM subsystem never allocates or frees the backing
/// memory itself.
pub trait GemObject: Clone {
    /// Size of the object in bytes.
    fn size(&self) -> u64;

    /// The object's scatter-gather list, in ascending offset order.
    fn sgl(&self) -> &[SgEntry];

    /// Flags to cache on a mapping of this object.
    fn flags(&self) -> ObjectFlags;
}
