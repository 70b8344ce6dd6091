//! Page-table cursor (spec.md §4.3): the only component that writes leaf
//! entries or advances across tables.
//!
//! A cursor caches the three tables currently under its indices and the
//! highest table level with writes the device MMU has not yet observed
//! (`sync_level_required`). Callers batch many leaf writes between one
//! `sync`: syncing per-leaf would be prohibitively slow for a long
//! scatter-gather run, and syncing only at the very end of a range op would
//! leave the device able to walk into a half-written table if that op is
//! itself composed of several cursor moves — see [`crate::sgl`].

use core::ptr::NonNull;

use crate::device::Device;
use crate::entry::L0Flags;
use crate::error::{IResult, Internal, VmError};
use crate::tree::{L0Table, L1Table, L2Table};
use crate::{L0_ENTRIES, L1_ENTRIES, L2_ENTRIES};

/// A mutable walker over one context's mirror tree, positioned at a device
/// address. Lifetime `'a` is the borrow of the [`Device`] used to allocate
/// any table the walk creates.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    device: &'a dyn Device,
    root: NonNull<L2Table>,
    l1: Option<NonNull<L1Table>>,
    l0: Option<NonNull<L0Table>>,
    l2_idx: usize,
    l1_idx: usize,
    l0_idx: usize,
    /// Highest level with unsynced writes: `-1` none, `0..=2` = L0..=L2.
    sync_level_required: i8,
}

// `Device` does not require `Debug`, so this is written by hand instead of
// derived.
impl<'a> core::fmt::Debug for Cursor<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cursor")
            .field("l2_idx", &self.l2_idx)
            .field("l1_idx", &self.l1_idx)
            .field("l0_idx", &self.l0_idx)
            .field("sync_level_required", &self.sync_level_required)
            .finish_non_exhaustive()
    }
}

impl<'a> Cursor<'a> {
    /// Bind a fresh cursor to `root` and seek it to `device_addr`.
    ///
    /// # Safety
    /// `root` must outlive the cursor, and the caller must hold the owning
    /// context's lock for the cursor's entire lifetime (spec.md §5): the
    /// cursor caches raw pointers into the tree with no borrow of its own.
    pub unsafe fn init(
        device: &'a dyn Device,
        root: &mut L2Table,
        device_addr: u64,
        should_create: bool,
    ) -> Result<Self, VmError> {
        let mut cursor = Self {
            device,
            root: NonNull::from(root),
            l1: None,
            l0: None,
            l2_idx: 0,
            l1_idx: 0,
            l0_idx: 0,
            sync_level_required: -1,
        };
        cursor.set(device_addr, should_create)?;
        Ok(cursor)
    }

    /// Re-seek this cursor to `device_addr`, first flushing whatever the
    /// previous position left pending.
    pub fn set(&mut self, device_addr: u64, should_create: bool) -> Result<(), VmError> {
        self.sync();
        let (l2_idx, l1_idx, l0_idx) = crate::split_addr(device_addr);
        self.l2_idx = l2_idx;
        self.l1_idx = l1_idx;
        self.l0_idx = l0_idx;
        self.l1 = None;
        self.l0 = None;
        match self.load_tables(should_create) {
            Ok(()) | Err(Internal::NotPresent) => Ok(()),
            Err(Internal::Public(e)) => Err(e),
        }
    }

    pub fn l0_idx(&self) -> usize {
        self.l0_idx
    }

    /// Whether the leaf currently under the cursor holds a valid mapping.
    pub fn is_page_present(&self) -> bool {
        match self.l0 {
            // SAFETY: `l0` is always either `None` or a table owned by
            // `self.root`'s tree, kept alive by the caller's lock.
            Some(l0) => unsafe { l0.as_ref() }.raw(self.l0_idx).is_valid(),
            None => false,
        }
    }

    /// Resolve `l1` then `l0` from the current indices. Leaves a field
    /// `None` (and returns [`Internal::NotPresent`]) if `should_create` is
    /// false and the corresponding table does not exist yet.
    fn load_tables(&mut self, should_create: bool) -> IResult<()> {
        // SAFETY: see `init`'s safety contract.
        let root = unsafe { self.root.as_mut() };
        let l1_existed = root.child(self.l2_idx).is_some();
        let mut l1 = if should_create {
            root.get_or_create_l1(self.l2_idx, self.device).map_err(Internal::Public)?
        } else {
            match root.child_mut(self.l2_idx) {
                Some(l1) => NonNull::from(l1),
                None => {
                    self.l1 = None;
                    self.l0 = None;
                    return Err(Internal::NotPresent);
                }
            }
        };
        if !l1_existed {
            self.require_sync(2);
        }
        self.l1 = Some(l1);

        // SAFETY: `l1` was just resolved above and is owned by `root`,
        // which outlives this call under the caller's lock.
        let l1_ref = unsafe { l1.as_mut() };
        let l0_existed = l1_ref.child(self.l1_idx).is_some();
        let l0 = if should_create {
            match l1_ref.get_or_create_l0(self.l1_idx, self.device) {
                Ok(l0) => l0,
                Err(e) => {
                    if !l1_existed {
                        // This call is what created `l1`, and it is still
                        // empty: undo it rather than leaving a zero-entry
                        // table behind (spec.md §4.2).
                        self.l1 = None;
                        // SAFETY: `device` is the device `root`'s tables
                        // were allocated from.
                        unsafe { root.destroy_l1_if_empty(self.l2_idx, self.device) };
                    }
                    return Err(Internal::Public(e));
                }
            }
        } else {
            match l1_ref.child_mut(self.l1_idx) {
                Some(l0) => NonNull::from(l0),
                None => {
                    self.l0 = None;
                    return Err(Internal::NotPresent);
                }
            }
        };
        if !l0_existed {
            self.require_sync(1);
        }
        self.l0 = Some(l0);
        Ok(())
    }

    fn require_sync(&mut self, level: i8) {
        if level > self.sync_level_required {
            self.sync_level_required = level;
        }
    }

    /// Advance to the next device page, crossing table boundaries (and
    /// syncing whatever they leave behind) as needed.
    pub fn next_page(&mut self, should_create: bool) -> IResult<()> {
        self.l0_idx += 1;
        if self.l0_idx < L0_ENTRIES {
            return Ok(());
        }
        self.l0_idx = 0;
        self.sync_partial(0);
        self.l1_idx += 1;
        if self.l1_idx < L1_ENTRIES {
            return self.load_tables(should_create);
        }
        self.l1_idx = 0;
        self.sync_partial(1);
        self.l2_idx += 1;
        if self.l2_idx >= L2_ENTRIES {
            return Err(Internal::Public(VmError::HierarchyWrap));
        }
        self.load_tables(should_create)
    }

    /// Flush tables from L0 up through `level`, honoring whatever is
    /// actually pending: if `level` covers everything outstanding, the
    /// pending state resets; otherwise only the lower levels are flushed
    /// and the higher-level obligation remains.
    pub fn sync_partial(&mut self, level: i8) {
        let effective = if level >= self.sync_level_required {
            let pending = self.sync_level_required;
            self.sync_level_required = -1;
            pending
        } else {
            level
        };
        if effective < 0 {
            return;
        }
        // SAFETY: see `init`'s safety contract.
        if let Some(l0) = self.l0 {
            unsafe { l0.as_ref() }.sync();
        }
        if effective >= 1 {
            if let Some(l1) = self.l1 {
                unsafe { l1.as_ref() }.sync();
            }
        }
        if effective >= 2 {
            unsafe { self.root.as_ref() }.sync();
        }
    }

    /// Flush every level with pending writes.
    pub fn sync(&mut self) {
        self.sync_partial(2);
    }

    /// Snapshot this cursor's position for later rollback. The snapshot
    /// does not inherit any pending-sync obligation: `self` continues to
    /// own syncing whatever it writes after the snapshot is taken.
    pub fn snapshot(&self) -> Self {
        let mut copy = *self;
        copy.sync_level_required = -1;
        copy
    }

    /// Flush whatever is pending. Equivalent to `sync`, kept as a distinct
    /// name for the point in a caller's lifecycle where the cursor is being
    /// retired rather than reused.
    pub fn fini(mut self) {
        self.sync();
    }

    /// Write a leaf entry at the cursor (spec.md §4.3). Fails if one is
    /// already installed there.
    pub fn page_create(
        &mut self,
        phys_page: u64,
        flags: L0Flags,
        vp_page: u64,
    ) -> Result<(), VmError> {
        let Some(mut l0) = self.l0 else {
            return Err(VmError::InvalidArgument {
                reason: "page_create on a cursor with no L0 table resolved",
            });
        };
        // SAFETY: see `init`'s safety contract.
        let l0_ref = unsafe { l0.as_mut() };
        if l0_ref.raw(self.l0_idx).is_valid() {
            let start = crate::join_addr(self.l2_idx, self.l1_idx, self.l0_idx);
            return Err(VmError::AlreadyMapped { start, size: crate::DEVICE_PAGE_SIZE });
        }
        l0_ref.set(self.l0_idx, phys_page, flags, vp_page);
        self.require_sync(0);
        Ok(())
    }

    /// Clear the leaf entry at the cursor, cascading the destroy of now-
    /// empty L0/L1 tables. A no-op if nothing is mapped here.
    pub fn page_destroy(&mut self) {
        let Some(mut l0) = self.l0 else {
            return;
        };
        // SAFETY: see `init`'s safety contract.
        let l0_ref = unsafe { l0.as_mut() };
        if !l0_ref.raw(self.l0_idx).is_valid() {
            return;
        }
        l0_ref.clear(self.l0_idx);
        self.require_sync(0);

        if l0_ref.is_empty() {
            // SAFETY: see `init`'s safety contract.
            let l1_ref = unsafe { self.l1.expect("L0 table implies a linked L1 parent").as_mut() };
            unsafe { l1_ref.destroy_l0_if_empty(self.l1_idx, self.device) };
            self.l0 = None;
            if l1_ref.is_empty() {
                // SAFETY: see `init`'s safety contract.
                let root = unsafe { self.root.as_mut() };
                unsafe { root.destroy_l1_if_empty(self.l2_idx, self.device) };
                self.l1 = None;
            }
        }
    }
}
