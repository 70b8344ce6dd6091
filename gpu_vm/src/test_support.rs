//! Test-only fakes for the host collaborator traits (spec.md §8, "test
//! tooling"). Not compiled outside `#[cfg(test)]`; `std` is available here
//! even in an otherwise `no_std` build (see `lib.rs`).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::time::Duration;

use crate::device::{CommandChannel, Device, DmaPage, MmuInvalidate, ObjectFlags, SgEntry, SlotId};
use crate::error::VmError;
use crate::HOST_PAGE_SIZE;

/// Backs each `FakeDevice`-allocated page with a heap `Vec<u8>` the fake
/// pretends is simultaneously CPU- and device-addressable: its "DMA
/// address" is just the boxed slab's starting host address.
struct Slab {
    bytes: Box<[u8]>,
}

/// A [`Device`] whose "DMA memory" is ordinary heap memory and whose
/// command channel completes every invalidate immediately.
pub struct FakeDevice {
    live: RefCell<Vec<Option<Slab>>>,
    quirks: RefCell<Vec<u32>>,
    addr_space_bits: u32,
    /// Remaining allocations before `alloc_dma_page` starts failing.
    /// `None` means never fail.
    fail_after: Cell<Option<usize>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::with_addr_space_bits(crate::ADDR_BITS)
    }

    /// A device advertising a deliberately wrong address-space width, for
    /// exercising `VmContext::create`'s validation.
    pub fn with_addr_space_bits(addr_space_bits: u32) -> Self {
        Self {
            live: RefCell::new(Vec::new()),
            quirks: RefCell::new(Vec::new()),
            addr_space_bits,
            fail_after: Cell::new(None),
        }
    }

    /// Enable `has_quirk(id)` for subsequent calls.
    pub fn enable_quirk(&self, id: u32) {
        self.quirks.borrow_mut().push(id);
    }

    /// Let the next `n` calls to `alloc_dma_page` succeed, then fail every
    /// call after that with `OutOfMemory` (spec.md §8, scenario 5: inject
    /// an allocation failure partway through a large map).
    pub fn fail_allocation_after(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    /// Undo a prior [`FakeDevice::fail_allocation_after`]: every
    /// subsequent call succeeds again.
    pub fn stop_failing_allocations(&self) {
        self.fail_after.set(None);
    }

    /// Number of pages not yet freed, for leak assertions in tests.
    pub fn live_page_count(&self) -> usize {
        self.live.borrow().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FakeDevice {
    fn addr_space_bits(&self) -> u32 {
        self.addr_space_bits
    }

    fn has_quirk(&self, quirk_id: u32) -> bool {
        self.quirks.borrow().contains(&quirk_id)
    }

    fn alloc_dma_page(&self) -> Result<DmaPage, VmError> {
        if let Some(remaining) = self.fail_after.get() {
            if remaining == 0 {
                return Err(VmError::OutOfMemory);
            }
            self.fail_after.set(Some(remaining - 1));
        }
        let mut bytes = alloc::vec![0u8; HOST_PAGE_SIZE as usize].into_boxed_slice();
        let host_ptr = bytes.as_mut_ptr();
        let mut live = self.live.borrow_mut();
        let slot = live.len() as u64;
        live.push(Some(Slab { bytes }));
        // The fake's "DMA address" just tags the slot; it is never
        // dereferenced as a real bus address.
        Ok(DmaPage { dma_addr: slot + 1, host_ptr })
    }

    unsafe fn free_dma_page(&self, page: DmaPage) {
        let slot = (page.dma_addr - 1) as usize;
        let mut live = self.live.borrow_mut();
        assert!(live[slot].is_some(), "double free of a FakeDevice page");
        live[slot] = None;
    }

    fn command_channel(&self) -> &dyn CommandChannel {
        self
    }
}

impl CommandChannel for FakeDevice {
    fn send(&self, _cmd: MmuInvalidate) -> SlotId {
        SlotId(0)
    }

    fn wait(&self, _slot: SlotId, _timeout: Duration) -> Result<(), VmError> {
        Ok(())
    }
}

/// A [`crate::device::GemObject`] backed by an explicit, caller-chosen
/// scatter-gather list.
#[derive(Clone, Debug)]
pub struct FakeGemObject {
    sgl: alloc::sync::Arc<Vec<SgEntry>>,
    flags: ObjectFlags,
}

impl FakeGemObject {
    /// One contiguous run starting at `dma_addr`, `size` bytes long.
    pub fn contiguous(dma_addr: u64, size: u64) -> Self {
        Self {
            sgl: alloc::sync::Arc::new(alloc::vec![SgEntry { dma_addr, length: size }]),
            flags: ObjectFlags::default(),
        }
    }

    pub fn with_runs(runs: Vec<SgEntry>) -> Self {
        Self { sgl: alloc::sync::Arc::new(runs), flags: ObjectFlags::default() }
    }

    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl crate::device::GemObject for FakeGemObject {
    fn size(&self) -> u64 {
        self.sgl.iter().map(|e| e.length).sum()
    }

    fn sgl(&self) -> &[SgEntry] {
        &self.sgl
    }

    fn flags(&self) -> ObjectFlags {
        self.flags
    }
}
