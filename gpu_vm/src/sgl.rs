//! Range and scatter-gather mapping (spec.md §4.4). Everything here drives
//! a [`Cursor`] to install or remove runs of leaves; every entry point that
//! mutates the tree and then fails rolls back to a cursor snapshot taken
//! before the first write, so a failed map or unmap leaves the tree exactly
//! as it found it.
//!
//! Rollback walks its own snapshot of the cursor, not the cursor the caller
//! passed in, and may cascade-destroy a table the caller's cursor still has
//! cached. On any `Err` from `map_direct`/`map_sgl`/`map_sgt_partial`/
//! `map_sgt_whole`, the caller's cursor must be dropped, not `fini`'d.

use crate::cursor::Cursor;
use crate::device::{GemObject, ObjectFlags, SgEntry};
use crate::entry::L0Flags;
use crate::error::{Internal, VmError};
use crate::DEVICE_PAGE_SIZE;

fn leaf_flags(flags: ObjectFlags) -> L0Flags {
    L0Flags {
        read_only: false,
        cache_coherent: false,
        slc_bypass: flags.slc_bypass,
        pm_src: false,
        pm_fw_protect: flags.pm_fw_protect,
    }
}

fn is_device_page_aligned(x: u64) -> bool {
    x & (DEVICE_PAGE_SIZE - 1) == 0
}

fn advance(cursor: &mut Cursor, should_create: bool) -> Result<(), VmError> {
    match cursor.next_page(should_create) {
        Ok(()) => Ok(()),
        // Only reachable when `should_create` is false; callers that pass
        // `true` never see this arm.
        Err(Internal::NotPresent) => Ok(()),
        Err(Internal::Public(e)) => Err(e),
    }
}

/// Destroy up to `n_pages` leaves starting at the cursor's current
/// position. The first page is handled without advancing; every
/// subsequent one advances first. Advancing into an unallocated subtree
/// (`NotPresent`) is not an error — there is nothing to unmap there.
pub fn unmap_from_cursor(cursor: &mut Cursor, n_pages: u64) -> Result<(), VmError> {
    for i in 0..n_pages {
        if i > 0 {
            match cursor.next_page(false) {
                Ok(()) => {}
                Err(Internal::NotPresent) => continue,
                Err(Internal::Public(e)) => return Err(e),
            }
        }
        cursor.page_destroy();
    }
    Ok(())
}

/// Roll back `created` pages already installed starting at `saved`, then
/// return `err`. `saved`'s own sync obligation is flushed before
/// returning, since nothing else will ever retire this cursor.
fn rollback(mut saved: Cursor, created: u64, err: VmError) -> Result<(), VmError> {
    let _ = unmap_from_cursor(&mut saved, created);
    saved.fini();
    Err(err)
}

/// Map `size` contiguous bytes starting at `dma_start` at the cursor's
/// current position, advancing one device page at a time. `size` must be a
/// multiple of the device page size.
pub fn map_direct(
    dma_start: u64,
    size: u64,
    cursor: &mut Cursor,
    flags: ObjectFlags,
) -> Result<(), VmError> {
    if size == 0 || !is_device_page_aligned(size) {
        return Err(VmError::InvalidArgument {
            reason: "map size must be a non-zero multiple of the device page size",
        });
    }
    if !is_device_page_aligned(dma_start) {
        return Err(VmError::InvalidArgument { reason: "dma address must be device-page aligned" });
    }

    let n_pages = size / DEVICE_PAGE_SIZE;
    let saved = cursor.snapshot();
    let leaf = leaf_flags(flags);
    let mut dma = dma_start;

    if let Err(e) = cursor.page_create(dma, leaf, 0) {
        return Err(e);
    }
    let mut created = 1u64;

    for _ in 1..n_pages {
        if let Err(e) = advance(cursor, true) {
            return rollback(saved, created, e);
        }
        dma += DEVICE_PAGE_SIZE;
        if let Err(e) = cursor.page_create(dma, leaf, 0) {
            return rollback(saved, created, e);
        }
        created += 1;
    }
    Ok(())
}

/// Map `[offset, offset + size)` of one scatter-gather entry. A thin
/// bounds-checking wrapper over [`map_direct`].
pub fn map_sgl(
    entry: SgEntry,
    offset: u64,
    size: u64,
    cursor: &mut Cursor,
    flags: ObjectFlags,
) -> Result<(), VmError> {
    if size == 0 || offset.saturating_add(size) > entry.length {
        return Err(VmError::InvalidArgument {
            reason: "sgl window lies outside the entry",
        });
    }
    map_direct(entry.dma_addr + offset, size, cursor, flags)
}

/// Locate the SGL entry containing byte `target_offset` of the object.
/// Returns `(entry_index, offset_into_entry)`, validating along the way
/// that every entry walked past is itself device-page aligned in both
/// address and length — an entry that fails this check can never be a
/// valid interior boundary for a device mapping.
fn locate(sgl: &[SgEntry], target_offset: u64) -> Result<(usize, u64), VmError> {
    let mut base = 0u64;
    for (i, &entry) in sgl.iter().enumerate() {
        if target_offset < base + entry.length {
            return Ok((i, target_offset - base));
        }
        if !is_device_page_aligned(entry.dma_addr) || !is_device_page_aligned(entry.length) {
            return Err(VmError::InvalidArgument {
                reason: "intermediate sgl entry is not device-page aligned",
            });
        }
        base += entry.length;
    }
    Err(VmError::InvalidArgument { reason: "offset lies past the end of the scatter-gather list" })
}

/// Map the byte window `[sgt_offset, sgt_offset + size)` of `object`'s
/// scatter-gather list at the cursor's position (spec.md §4.4, the
/// three-stage algorithm).
pub fn map_sgt_partial<G: GemObject>(
    object: &G,
    sgt_offset: u64,
    size: u64,
    cursor: &mut Cursor,
) -> Result<(), VmError> {
    if size == 0 {
        return Err(VmError::InvalidArgument { reason: "map size must be non-zero" });
    }
    let sgl = object.sgl();
    let flags = object.flags();

    let (first_idx, first_offset) = locate(sgl, sgt_offset)?;
    let first_entry = sgl[first_idx];
    if !is_device_page_aligned(first_entry.dma_addr + first_offset) {
        return Err(VmError::InvalidArgument {
            reason: "window start is not device-page aligned",
        });
    }
    let first_available = first_entry.length - first_offset;
    if size <= first_available {
        // Whole window fits inside the first entry: short-circuit.
        return map_sgl(first_entry, first_offset, size, cursor, flags);
    }
    let first_size = first_available;
    if !is_device_page_aligned(first_size) {
        return Err(VmError::InvalidArgument {
            reason: "first sgl run is not a multiple of the device page size",
        });
    }

    let (last_idx, last_offset) = locate(sgl, sgt_offset + size - 1)?;
    let last_entry = sgl[last_idx];
    let last_size = last_offset + 1;

    let saved = cursor.snapshot();
    let mut created = 0u64;

    // Stage A: the tail of the first entry.
    if let Err(e) = map_direct(first_entry.dma_addr + first_offset, first_size, cursor, flags) {
        return rollback(saved, created, e);
    }
    created += first_size / DEVICE_PAGE_SIZE;

    // Stage B: every entry strictly between first and last, whole.
    for &entry in &sgl[first_idx + 1..last_idx] {
        if let Err(e) = advance(cursor, true) {
            return rollback(saved, created, e);
        }
        if let Err(e) = map_sgl(entry, 0, entry.length, cursor, flags) {
            return rollback(saved, created, e);
        }
        created += entry.length / DEVICE_PAGE_SIZE;
    }

    // Stage C: the head of the last entry.
    if let Err(e) = advance(cursor, true) {
        return rollback(saved, created, e);
    }
    if let Err(e) = map_sgl(last_entry, 0, last_size, cursor, flags) {
        return rollback(saved, created, e);
    }

    Ok(())
}

/// Map the whole of `object`'s scatter-gather list at the cursor's
/// position. Structurally the same as [`map_sgt_partial`]'s stage B, but
/// without offset bookkeeping: every entry is whole, the first with no
/// advance and every subsequent one with an advance first.
pub fn map_sgt_whole<G: GemObject>(object: &G, cursor: &mut Cursor) -> Result<(), VmError> {
    let sgl = object.sgl();
    let flags = object.flags();
    let saved = cursor.snapshot();
    let mut created = 0u64;

    for (i, &entry) in sgl.iter().enumerate() {
        if i > 0 {
            if let Err(e) = advance(cursor, true) {
                return rollback(saved, created, e);
            }
        }
        if let Err(e) = map_sgl(entry, 0, entry.length, cursor, flags) {
            return rollback(saved, created, e);
        }
        created += entry.length / DEVICE_PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDevice;
    use crate::tree::L2Table;

    #[test]
    fn map_direct_then_unmap_round_trips() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        // SAFETY: `root` outlives the cursor.
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };

        map_direct(0x10000, DEVICE_PAGE_SIZE * 4, &mut cursor, ObjectFlags::default()).unwrap();

        cursor.set(0, false).unwrap();
        assert!(cursor.is_page_present());

        unmap_from_cursor(&mut cursor, 4).unwrap();
        cursor.fini();

        cursor.set(0, false).unwrap();
        assert!(!cursor.is_page_present());
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_direct_rejects_misaligned_size() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };
        let err = map_direct(0, DEVICE_PAGE_SIZE + 1, &mut cursor, ObjectFlags::default())
            .unwrap_err();
        assert_eq!(
            err,
            VmError::InvalidArgument {
                reason: "map size must be a non-zero multiple of the device page size"
            }
        );
        cursor.fini();
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_direct_rolls_back_on_overlap() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };

        // Pre-install a page in the middle of a would-be 4-page run.
        cursor.set(DEVICE_PAGE_SIZE * 2, true).unwrap();
        cursor.page_create(0x9000, L0Flags::default(), 0).unwrap();

        cursor.set(0, true).unwrap();
        let err =
            map_direct(0x1000, DEVICE_PAGE_SIZE * 4, &mut cursor, ObjectFlags::default())
                .unwrap_err();
        assert_eq!(err, VmError::AlreadyMapped { start: DEVICE_PAGE_SIZE * 2, size: DEVICE_PAGE_SIZE });

        cursor.set(0, false).unwrap();
        assert!(!cursor.is_page_present(), "rollback must undo page 0");
        cursor.set(DEVICE_PAGE_SIZE, false).unwrap();
        assert!(!cursor.is_page_present(), "rollback must undo page 1");
        cursor.set(DEVICE_PAGE_SIZE * 2, false).unwrap();
        assert!(cursor.is_page_present(), "the pre-existing page must survive rollback");

        cursor.fini();
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_sgl_rejects_window_outside_entry() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };
        let entry = SgEntry { dma_addr: 0x1000, length: DEVICE_PAGE_SIZE };
        let err = map_sgl(entry, 0, DEVICE_PAGE_SIZE * 2, &mut cursor, ObjectFlags::default())
            .unwrap_err();
        assert_eq!(err, VmError::InvalidArgument { reason: "sgl window lies outside the entry" });
        cursor.fini();
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_sgt_whole_spans_multiple_entries() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };
        let object = crate::test_support::FakeGemObject::with_runs(alloc::vec![
            SgEntry { dma_addr: 0x10000, length: DEVICE_PAGE_SIZE * 2 },
            SgEntry { dma_addr: 0x40000, length: DEVICE_PAGE_SIZE },
        ]);
        map_sgt_whole(&object, &mut cursor).unwrap();

        cursor.set(0, false).unwrap();
        assert!(cursor.is_page_present());
        cursor.set(DEVICE_PAGE_SIZE * 2, false).unwrap();
        assert!(cursor.is_page_present());
        cursor.fini();
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_sgt_partial_spans_head_middle_and_tail_entries() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };
        let p = DEVICE_PAGE_SIZE;
        let object = crate::test_support::FakeGemObject::with_runs(alloc::vec![
            SgEntry { dma_addr: 0x10000, length: p * 3 },
            SgEntry { dma_addr: 0x20000, length: p * 2 },
            SgEntry { dma_addr: 0x30000, length: p * 4 },
        ]);

        // Object byte offset `p` skips the first page of entry 0; the
        // window spans 2 pages of entry 0's tail, all of entry 1, and 1
        // page of entry 2's head — 5 device pages starting at the cursor.
        map_sgt_partial(&object, p, p * 5, &mut cursor).unwrap();

        for i in 0..5u64 {
            cursor.set(p * i, false).unwrap();
            assert!(cursor.is_page_present(), "page {i} of the window must be mapped");
        }

        cursor.set(p * 5, false).unwrap();
        assert!(!cursor.is_page_present(), "byte range past the window must stay unmapped");

        cursor.fini();
        unsafe { root.fini(&dev) };
    }

    #[test]
    fn map_sgt_partial_short_circuits_inside_one_entry() {
        let dev = FakeDevice::new();
        let mut root = L2Table::init(&dev).unwrap();
        let mut cursor = unsafe { crate::cursor::Cursor::init(&dev, &mut root, 0, true).unwrap() };
        let p = DEVICE_PAGE_SIZE;
        let object = crate::test_support::FakeGemObject::with_runs(alloc::vec![SgEntry {
            dma_addr: 0x10000,
            length: p * 4,
        }]);

        map_sgt_partial(&object, p, p * 2, &mut cursor).unwrap();

        cursor.set(0, false).unwrap();
        assert!(!cursor.is_page_present());
        cursor.set(p, false).unwrap();
        assert!(cursor.is_page_present());
        cursor.set(p * 2, false).unwrap();
        assert!(cursor.is_page_present());
        cursor.set(p * 3, false).unwrap();
        assert!(!cursor.is_page_present());

        cursor.fini();
        unsafe { root.fini(&dev) };
    }
}
