//! Backing page — one host-page-sized raw page table (spec.md §4.1).
//!
//! A `BackingPage` is the only thing in this crate that talks to the host
//! allocator (via [`Device::alloc_dma_page`]). Every raw L2/L1/L0 table is
//! one of these; mirror tables in [`crate::tree`] just interpret the bytes.

use crate::device::{Device, DmaPage};
use crate::error::VmError;
use crate::HOST_PAGE_SIZE;

/// One host page, mapped simultaneously into CPU and device address
/// spaces, used as the raw storage for one page table level.
///
/// Invariant (spec.md §3): `dma_addr == 0 <=> host_ptr.is_null() <=>
/// uninitialised`. This is what makes `fini` idempotent.
pub struct BackingPage {
    dma_addr: u64,
    host_ptr: *mut u8,
}

// SAFETY: the pointer is a private, page-owning allocation; the VM context
// lock (spec.md §5) serialises all reads and writes to it.
unsafe impl Send for BackingPage {}

impl BackingPage {
    /// An uninitialised page. Matches the zeroed-struct state `fini`
    /// leaves behind.
    pub const fn uninit() -> Self {
        Self {
            dma_addr: 0,
            host_ptr: core::ptr::null_mut(),
        }
    }

    /// Allocate and zero-fill one backing page from `device`.
    ///
    /// On failure no resources are retained (spec.md §4.1); on success
    /// `dma_addr() != 0`.
    pub fn init(device: &dyn Device) -> Result<Self, VmError> {
        let DmaPage { dma_addr, host_ptr } = device.alloc_dma_page()?;
        debug_assert_ne!(dma_addr, 0, "Device::alloc_dma_page must not return a null DMA address");
        let page = Self { dma_addr, host_ptr };
        // SAFETY: `host_ptr` is a freshly allocated, host-page-sized,
        // exclusively-owned region.
        unsafe {
            core::ptr::write_bytes(page.host_ptr, 0, HOST_PAGE_SIZE as usize);
        }
        Ok(page)
    }

    /// Release the page back to `device`. Idempotent: a no-op on an
    /// already-uninitialised page.
    ///
    /// # Safety
    /// `device` must be the same device `init` was called with.
    pub unsafe fn fini(&mut self, device: &dyn Device) {
        if self.dma_addr == 0 {
            debug_assert!(self.host_ptr.is_null());
            return;
        }
        device.free_dma_page(DmaPage {
            dma_addr: self.dma_addr,
            host_ptr: self.host_ptr,
        });
        self.dma_addr = 0;
        self.host_ptr = core::ptr::null_mut();
    }

    /// Flush CPU-side writes so the device MMU observes them
    /// (spec.md §4.1).
    ///
    /// The DMA direction is always `TO_DEVICE`: page tables are write-only
    /// from the CPU's point of view, so there is never a `FROM_DEVICE`
    /// sync that would needlessly invalidate CPU caches (spec.md §9).
    pub fn sync(&self) {
        debug_assert_ne!(self.dma_addr, 0, "sync on an uninitialised backing page");
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        // A real host driver additionally issues a bus DMA sync (e.g.
        // `dma_sync_single_for_device`) here; that call is owned by
        // `Device` and out of scope for this crate (spec.md §1).
    }

    /// Device DMA address of this page, or `0` if uninitialised.
    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    /// Whether this page has been allocated.
    pub fn is_init(&self) -> bool {
        self.dma_addr != 0
    }

    /// Raw byte contents, as 64-bit words (enough for both 32-bit L2 and
    /// 64-bit L1/L0 raw entries).
    pub fn words(&self) -> &[u64] {
        debug_assert!(self.is_init());
        // SAFETY: `host_ptr` points at `HOST_PAGE_SIZE` bytes we own and
        // initialised to zero in `init`; `u64` has no alignment niches and
        // the page is allocated host-page-aligned, which is always a
        // multiple of 8.
        unsafe {
            core::slice::from_raw_parts(self.host_ptr as *const u64, HOST_PAGE_SIZE as usize / 8)
        }
    }

    /// Mutable raw byte contents as 64-bit words.
    pub fn words_mut(&mut self) -> &mut [u64] {
        debug_assert!(self.is_init());
        // SAFETY: see `words`.
        unsafe {
            core::slice::from_raw_parts_mut(self.host_ptr as *mut u64, HOST_PAGE_SIZE as usize / 8)
        }
    }

    /// Raw byte contents as 32-bit words, for the L2 (root) level whose
    /// entries are half the width of L1/L0's.
    pub fn words32(&self) -> &[u32] {
        debug_assert!(self.is_init());
        // SAFETY: see `words`; `u32` alignment is a fortiori satisfied.
        unsafe {
            core::slice::from_raw_parts(self.host_ptr as *const u32, HOST_PAGE_SIZE as usize / 4)
        }
    }

    /// Mutable raw byte contents as 32-bit words.
    pub fn words32_mut(&mut self) -> &mut [u32] {
        debug_assert!(self.is_init());
        // SAFETY: see `words32`.
        unsafe {
            core::slice::from_raw_parts_mut(self.host_ptr as *mut u32, HOST_PAGE_SIZE as usize / 4)
        }
    }
}

impl Drop for BackingPage {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.dma_addr, 0,
            "BackingPage dropped while still initialised; call fini() first"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDevice;

    #[test]
    fn init_zero_fills_and_fini_is_idempotent() {
        let dev = FakeDevice::new();
        let mut page = BackingPage::init(&dev).unwrap();
        assert_ne!(page.dma_addr(), 0);
        assert!(page.words().iter().all(|&w| w == 0));

        unsafe { page.fini(&dev) };
        assert_eq!(page.dma_addr(), 0);
        assert!(!page.is_init());

        // idempotent
        unsafe { page.fini(&dev) };
        assert_eq!(page.dma_addr(), 0);
    }

    #[test]
    fn uninit_page_reports_uninitialised() {
        let page = BackingPage::uninit();
        assert_eq!(page.dma_addr(), 0);
        assert!(!page.is_init());
    }
}
