//! VM context façade (spec.md §4.6): the public entry point a host driver
//! calls into. Owns one context's L2 root and mapping tree behind a single
//! coarse lock (spec.md §5) and a refcount the lock does not protect.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cursor::Cursor;
use crate::device::{Device, GemObject, MmuInvalidate};
use crate::error::VmError;
use crate::heap::{all_heaps, find_heap_containing, Heap, QUIRK_RGNHDR};
use crate::mapping::{MappingNode, MappingTree};
use crate::sgl;
use crate::tree::L2Table;
use crate::{ADDR_SPACE_SIZE, DEVICE_PAGE_MASK, HOST_PAGE_SIZE};

/// How long `mmu_flush` waits for the device before reporting `Timeout`
/// (spec.md §5, "implementation-defined timeout").
const MMU_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

struct ContextState<G: GemObject> {
    root: Box<L2Table>,
    mappings: MappingTree<G>,
}

/// A buffer object located by reverse lookup, with the window of it this
/// mapping covers (spec.md §4.6, `find_gem_object`).
#[derive(Debug)]
pub struct Located<G> {
    pub object: G,
    pub offset: u64,
    pub size: u64,
}

/// One context's page tables, mapping tree and lock (spec.md §3, "VM
/// Context lifecycle"). `'d` is the borrow of the [`Device`] the context is
/// bound to; a host driver typically keeps one of these per GPU address
/// space alongside an `Arc` for its own refcounting, and additionally calls
/// [`VmContext::get`]/[`VmContext::put`] to track the intrusive refcount
/// this type's own field carries, per spec.md §4.6.
pub struct VmContext<'d, G: GemObject> {
    device: &'d dyn Device,
    refcount: AtomicUsize,
    /// Whether a firmware-visible memory context was requested at
    /// `create`. Acquiring and releasing one is an external collaborator
    /// concern with no interface named in this subsystem's scope; this
    /// flag is the hook a host driver's own firmware layer keys off of.
    fw_ctx: bool,
    /// `None` once `put` has torn the context down; guards against a
    /// use-after-destroy from a caller holding a stale reference.
    state: Mutex<Option<ContextState<G>>>,
}

// `Device` does not require `Debug`, so this is written by hand instead of
// derived.
impl<'d, G: GemObject> core::fmt::Debug for VmContext<'d, G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmContext")
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("fw_ctx", &self.fw_ctx)
            .finish_non_exhaustive()
    }
}

impl<'d, G: GemObject> VmContext<'d, G> {
    /// Allocate the L2 root, initialise the mapping tree, and set the
    /// refcount to 1 (spec.md §4.6).
    pub fn create(device: &'d dyn Device, create_fw_ctx: bool) -> Result<Self, VmError> {
        if device.addr_space_bits() != crate::ADDR_BITS {
            return Err(VmError::InvalidArgument {
                reason: "device address-space width does not match ADDR_BITS",
            });
        }
        let root = L2Table::init(device)?;
        Ok(Self {
            device,
            refcount: AtomicUsize::new(1),
            fw_ctx: create_fw_ctx,
            state: Mutex::new(Some(ContextState { root, mappings: MappingTree::new() })),
        })
    }

    /// Bump the strong refcount.
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the strong refcount. Returns `true` if this was the last
    /// reference, in which case the context has already been fully torn
    /// down by the time this returns (spec.md §4.6).
    pub fn put(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        let Some(ContextState { mut root, mappings }) = self.state.lock().take() else {
            return true;
        };

        let dangling = mappings.len();
        if dangling > 0 {
            log::warn!("vm context destroyed with {dangling} dangling mapping(s)");
        }
        for node in mappings.iter() {
            let n_pages = node.size / crate::DEVICE_PAGE_SIZE;
            // SAFETY: `root` is exclusively owned here, the context is
            // being torn down and no other access to it can race.
            let mut cursor = match unsafe { Cursor::init(self.device, &mut root, node.start, false) } {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("vm context teardown: could not seek to {:#x}: {e}", node.start);
                    continue;
                }
            };
            if let Err(e) = sgl::unmap_from_cursor(&mut cursor, n_pages) {
                log::warn!("vm context teardown: failed to unmap {:#x}: {e}", node.start);
            }
            cursor.fini();
        }
        // Dropping `mappings` here releases this context's share of every
        // object's external refcount (spec.md §5, "shared resources").
        drop(mappings);

        if self.fw_ctx {
            log::debug!("vm context teardown: releasing firmware memory context");
        }

        // SAFETY: every leaf this tree could still hold was just cleared
        // above (or a warning was logged and the leak is confined to that
        // one subtree); `fini` is unconditional regardless either way, and
        // `self.device` is the device `root` was allocated from.
        unsafe { root.fini(self.device) };
        true
    }

    fn lock(&self) -> Result<spin::MutexGuard<'_, Option<ContextState<G>>>, VmError> {
        let guard = self.state.lock();
        if guard.is_none() {
            return Err(VmError::InvalidArgument { reason: "vm context used after destroy" });
        }
        Ok(guard)
    }

    /// Validate a `(device_addr, size)` window against the address-space
    /// bound and both page-size granularities (spec.md §4.6, §6.4) before
    /// the context lock is ever acquired.
    fn validate_window(device_addr: u64, size: u64) -> Result<(), VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument { reason: "mapping size must be non-zero" });
        }
        if device_addr & DEVICE_PAGE_MASK != 0 || size & DEVICE_PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument {
                reason: "device address and size must be device-page aligned",
            });
        }
        if device_addr & (HOST_PAGE_SIZE - 1) != 0 {
            return Err(VmError::InvalidArgument {
                reason: "device address must be host-page aligned",
            });
        }
        match device_addr.checked_add(size) {
            Some(end) if end <= ADDR_SPACE_SIZE => Ok(()),
            _ => Err(VmError::InvalidArgument { reason: "range runs past the address space" }),
        }
    }

    /// Map the whole of `obj` at `device_addr` (spec.md §4.6).
    pub fn map(&self, obj: G, device_addr: u64) -> Result<(), VmError> {
        let size = obj.size();
        Self::validate_window(device_addr, size)?;

        let mut guard = self.lock()?;
        let state = guard.as_mut().expect("checked by lock()");
        if state.mappings.contains(device_addr, size) {
            return Err(VmError::AlreadyMapped { start: device_addr, size });
        }
        // SAFETY: `state.root` is owned by `self` and outlives the cursor;
        // the context lock is held for the cursor's whole lifetime.
        let mut cursor = unsafe { Cursor::init(self.device, &mut state.root, device_addr, true)? };
        match sgl::map_sgt_whole(&obj, &mut cursor) {
            Ok(()) => cursor.fini(),
            // Rollback may have freed a table `cursor` still caches; see
            // sgl.rs. Drop it rather than calling `fini`.
            Err(e) => return Err(e),
        }
        let flags = obj.flags();
        state.mappings.insert(MappingNode {
            start: device_addr,
            size,
            object: obj,
            object_offset: None,
            flags,
        });
        self.mmu_flush_warn();
        drop(guard);
        Ok(())
    }

    /// Map `[obj_offset, obj_offset + size)` of `obj` at `device_addr`
    /// (spec.md §4.6).
    pub fn map_partial(
        &self,
        obj: G,
        obj_offset: u64,
        device_addr: u64,
        size: u64,
    ) -> Result<(), VmError> {
        Self::validate_window(device_addr, size)?;
        let fits = matches!(obj_offset.checked_add(size), Some(end) if end <= obj.size());
        if !fits {
            return Err(VmError::InvalidArgument {
                reason: "object window runs past the object's size",
            });
        }

        let mut guard = self.lock()?;
        let state = guard.as_mut().expect("checked by lock()");
        if state.mappings.contains(device_addr, size) {
            return Err(VmError::AlreadyMapped { start: device_addr, size });
        }
        // SAFETY: see `map`.
        let mut cursor = unsafe { Cursor::init(self.device, &mut state.root, device_addr, true)? };
        match sgl::map_sgt_partial(&obj, obj_offset, size, &mut cursor) {
            Ok(()) => cursor.fini(),
            Err(e) => return Err(e),
        }
        let flags = obj.flags();
        state.mappings.insert(MappingNode {
            start: device_addr,
            size,
            object: obj,
            object_offset: Some(obj_offset),
            flags,
        });
        self.mmu_flush_warn();
        drop(guard);
        Ok(())
    }

    /// Unmap the mapping whose start exactly equals `device_addr`
    /// (spec.md §4.6).
    pub fn unmap(&self, device_addr: u64) -> Result<(), VmError> {
        let mut guard = self.lock()?;
        let state = guard.as_mut().expect("checked by lock()");
        let node = state
            .mappings
            .get(device_addr)
            .ok_or(VmError::NotFound { addr: device_addr })?;
        let n_pages = node.size / crate::DEVICE_PAGE_SIZE;

        // SAFETY: see `map`.
        let mut cursor =
            unsafe { Cursor::init(self.device, &mut state.root, device_addr, false)? };
        // Unlike `map`/`map_partial`, `unmap_from_cursor` only ever calls
        // `page_destroy` on this same cursor (no separate rollback
        // snapshot), which keeps its own cached tables in sync as it
        // cascades — safe to `fini` regardless of the outcome.
        let result = sgl::unmap_from_cursor(&mut cursor, n_pages);
        cursor.fini();
        result?;
        state.mappings.remove(device_addr);
        self.mmu_flush_warn();
        drop(guard);
        Ok(())
    }

    /// Reverse lookup: the mapping (if any) that completely contains
    /// `[device_addr, device_addr + 1)`, bumping the found object's
    /// refcount via `Clone` (spec.md §4.6).
    pub fn find_gem_object(&self, device_addr: u64) -> Result<Located<G>, VmError> {
        let guard = self.lock()?;
        let state = guard.as_ref().expect("checked by lock()");
        let node = state
            .mappings
            .find(device_addr, 1)
            .ok_or(VmError::NotFound { addr: device_addr })?;
        Ok(Located {
            object: node.object.clone(),
            offset: node.object_offset.unwrap_or(0),
            size: node.size,
        })
    }

    /// Raw DMA address of the L2 root's backing page.
    pub fn get_root_dma_addr(&self) -> Result<u64, VmError> {
        let guard = self.lock()?;
        Ok(guard.as_ref().expect("checked by lock()").root.dma_addr())
    }

    /// Send an `MMU_CACHE_INVALIDATE` with every flag set and wait for it
    /// (spec.md §6.2). Called after every successful `map`/`map_partial`/
    /// `unmap`.
    pub fn mmu_flush(&self) -> Result<(), VmError> {
        let channel = self.device.command_channel();
        let slot = channel.send(MmuInvalidate::ALL);
        channel.wait(slot, MMU_FLUSH_TIMEOUT)
    }

    /// `mmu_flush`, but a `Timeout` is logged rather than propagated: the
    /// mapping or unmapping it follows already fully committed to the tree
    /// (spec.md §5, "cancellation / timeouts").
    fn mmu_flush_warn(&self) {
        if let Err(e) = self.mmu_flush() {
            log::warn!("mmu_flush did not complete: {e}");
        }
    }

    /// Every heap visible on this context's device (spec.md §6.3).
    pub fn heaps(&self) -> Vec<Heap> {
        all_heaps(self.device.has_quirk(QUIRK_RGNHDR))
    }

    /// The heap (if any) that entirely contains `[start, start + size)`.
    pub fn heap_containing(&self, start: u64, size: u64) -> Option<Heap> {
        find_heap_containing(start, size, self.device.has_quirk(QUIRK_RGNHDR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDevice, FakeGemObject};
    use crate::DEVICE_PAGE_SIZE;

    #[test]
    fn create_rejects_address_space_mismatch() {
        let mismatched = FakeDevice::with_addr_space_bits(crate::ADDR_BITS + 1);
        let err = VmContext::<FakeGemObject>::create(&mismatched, false).unwrap_err();
        assert_eq!(
            err,
            VmError::InvalidArgument { reason: "device address-space width does not match ADDR_BITS" }
        );
    }

    #[test]
    fn map_then_reverse_lookup_then_unmap() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let obj = FakeGemObject::contiguous(0x5000, DEVICE_PAGE_SIZE * 4);
        let addr = 0x0001_0000_0000u64;

        ctx.map(obj, addr).unwrap();

        let found = ctx.find_gem_object(addr + 0x400).unwrap();
        assert_eq!(found.offset, 0);
        assert_eq!(found.size, DEVICE_PAGE_SIZE * 4);

        ctx.unmap(addr).unwrap();
        assert_eq!(ctx.find_gem_object(addr + 0x400).unwrap_err(), VmError::NotFound { addr: addr + 0x400 });

        assert!(ctx.put());
        assert_eq!(dev.live_page_count(), 0, "tearing down an empty context must leak nothing");
    }

    #[test]
    fn map_rejects_misaligned_address() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let obj = FakeGemObject::contiguous(0x5000, DEVICE_PAGE_SIZE);
        let err = ctx.map(obj, 1).unwrap_err();
        assert_eq!(
            err,
            VmError::InvalidArgument { reason: "device address and size must be device-page aligned" }
        );
        assert!(ctx.put());
    }

    #[test]
    fn second_map_at_same_address_is_rejected_then_succeeds_after_unmap() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let addr = 0x1000u64;
        let a = FakeGemObject::contiguous(0x10000, DEVICE_PAGE_SIZE);
        let b = FakeGemObject::contiguous(0x20000, DEVICE_PAGE_SIZE);

        ctx.map(a, addr).unwrap();
        let err = ctx.map(b.clone(), addr).unwrap_err();
        assert_eq!(err, VmError::AlreadyMapped { start: addr, size: DEVICE_PAGE_SIZE });

        ctx.unmap(addr).unwrap();
        ctx.map(b, addr).unwrap();

        assert!(ctx.put());
    }

    #[test]
    fn map_partial_reverse_lookup_reports_object_offset() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let p = DEVICE_PAGE_SIZE;
        let obj = FakeGemObject::with_runs(alloc::vec![
            crate::device::SgEntry { dma_addr: 0x10000, length: p * 2 },
            crate::device::SgEntry { dma_addr: 0x20000, length: p },
            crate::device::SgEntry { dma_addr: 0x30000, length: p * 2 },
        ]);
        let addr = 0x2_0000u64;
        ctx.map_partial(obj, p, addr, p * 3).unwrap();

        let found = ctx.find_gem_object(addr + p).unwrap();
        assert_eq!(found.offset, p);
        assert_eq!(found.size, p * 3);

        ctx.unmap(addr).unwrap();
        assert!(ctx.put());
    }

    #[test]
    fn destroy_warns_and_releases_dangling_mappings() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let a = FakeGemObject::contiguous(0x10000, DEVICE_PAGE_SIZE);
        let b = FakeGemObject::contiguous(0x20000, DEVICE_PAGE_SIZE * 2);
        ctx.map(a, 0x0).unwrap();
        ctx.map(b, 0x10_0000).unwrap();

        // Dropping the last reference with mappings still installed must
        // not panic or leak; `put` tears everything down itself.
        assert!(ctx.put());
        assert_eq!(dev.live_page_count(), 0);
    }

    #[test]
    fn get_root_dma_addr_is_stable_across_maps() {
        let dev = FakeDevice::new();
        let ctx = VmContext::create(&dev, false).unwrap();
        let before = ctx.get_root_dma_addr().unwrap();
        let obj = FakeGemObject::contiguous(0x1000, DEVICE_PAGE_SIZE);
        ctx.map(obj, 0x4000).unwrap();
        assert_eq!(ctx.get_root_dma_addr().unwrap(), before);
        assert!(ctx.put());
    }

    #[test]
    fn heaps_respect_the_device_quirk() {
        let dev = FakeDevice::new();
        let ctx = VmContext::<FakeGemObject>::create(&dev, false).unwrap();
        assert_eq!(ctx.heaps().len(), 4);
        dev.enable_quirk(QUIRK_RGNHDR);
        assert_eq!(ctx.heaps().len(), 5);
        assert!(ctx.put());
    }

    #[test]
    fn get_keeps_context_alive_across_one_put() {
        let dev = FakeDevice::new();
        let ctx = VmContext::<FakeGemObject>::create(&dev, false).unwrap();
        ctx.get();
        assert!(!ctx.put(), "refcount was 2, this put must not destroy");
        assert!(ctx.put(), "refcount was 1, this put must destroy");
    }
}
