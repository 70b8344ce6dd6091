//! Mirror page-table tree (spec.md §4.2): L2 root, L1, L0 tables with
//! per-table valid-entry refcounts and cascading lazy creation/destruction.
//!
//! Each level wraps one [`BackingPage`] holding the raw hardware entries a
//! [`crate::cursor::Cursor`] writes through, plus a same-shaped array of
//! owned mirror children — the L0 level has none, since it is the leaf.
//! `entry_count` is the number of currently-valid raw entries; `tree.rs`
//! only ever mutates it by one at a time, so "is this table now empty"
//! never needs to rescan the backing page.

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::backing_page::BackingPage;
use crate::device::Device;
use crate::entry::{L0Entry, L0Flags, L1Entry, L2Entry};
use crate::error::VmError;
use crate::{L1_ENTRIES, L2_ENTRIES};

/// Leaf table: `L0_ENTRIES` raw leaf slots, no mirror children of its own.
pub struct L0Table {
    backing: BackingPage,
    entry_count: usize,
    parent: NonNull<L1Table>,
    parent_idx: usize,
}

impl L0Table {
    fn new(backing: BackingPage, parent: NonNull<L1Table>, parent_idx: usize) -> Box<Self> {
        Box::new(Self { backing, entry_count: 0, parent, parent_idx })
    }

    pub fn dma_addr(&self) -> u64 {
        self.backing.dma_addr()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn parent_idx(&self) -> usize {
        self.parent_idx
    }

    pub fn raw(&self, idx: usize) -> L0Entry {
        L0Entry(self.backing.words()[idx])
    }

    /// Install a leaf entry at `idx`. The caller must have already checked
    /// `idx` is currently invalid.
    pub fn set(&mut self, idx: usize, phys_page: u64, flags: L0Flags, vp_page: u64) {
        debug_assert!(!self.raw(idx).is_valid());
        self.backing.words_mut()[idx] = L0Entry::new(phys_page, flags, vp_page).0;
        self.entry_count += 1;
    }

    /// Clear a previously-valid leaf entry at `idx`.
    pub fn clear(&mut self, idx: usize) {
        debug_assert!(self.raw(idx).is_valid());
        self.backing.words_mut()[idx] = L0Entry::INVALID.0;
        self.entry_count -= 1;
    }

    pub fn sync(&self) {
        self.backing.sync()
    }

    /// Tear down this table, releasing its backing page regardless of
    /// whether any leaves are still marked valid in it. The caller (an
    /// [`L1Table`]) must already have invalidated its own entry pointing
    /// here. Context destroy (spec.md §4.6) relies on this being
    /// unconditional: it is not allowed to leave resources pinned even if
    /// an earlier step in teardown failed to unmap everything first.
    ///
    /// # Safety
    /// `device` must be the device the backing page was allocated from.
    unsafe fn fini(mut self: Box<Self>, device: &dyn Device) {
        self.entry_count = 0;
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.backing.fini(device) };
    }
}

/// Mid-level table: `L1_ENTRIES` slots, each optionally owning one
/// [`L0Table`].
pub struct L1Table {
    backing: BackingPage,
    entry_count: usize,
    children: [Option<Box<L0Table>>; L1_ENTRIES],
    parent: NonNull<L2Table>,
    parent_idx: usize,
}

impl L1Table {
    fn new(backing: BackingPage, parent: NonNull<L2Table>, parent_idx: usize) -> Box<Self> {
        Box::new(Self {
            backing,
            entry_count: 0,
            children: core::array::from_fn(|_| None),
            parent,
            parent_idx,
        })
    }

    pub fn dma_addr(&self) -> u64 {
        self.backing.dma_addr()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn parent_idx(&self) -> usize {
        self.parent_idx
    }

    pub fn raw(&self, idx: usize) -> L1Entry {
        L1Entry(self.backing.words()[idx])
    }

    pub fn entry_is_valid(&self, idx: usize) -> bool {
        self.raw(idx).is_valid()
    }

    pub fn child(&self, idx: usize) -> Option<&L0Table> {
        self.children[idx].as_deref()
    }

    pub fn child_mut(&mut self, idx: usize) -> Option<&mut L0Table> {
        self.children[idx].as_deref_mut()
    }

    /// Return the L0 table at `idx`, allocating and linking a fresh one if
    /// none exists yet (spec.md §4.2, "lazy table creation"). On allocation
    /// failure the table is left exactly as it was before the call.
    pub fn get_or_create_l0(
        &mut self,
        idx: usize,
        device: &dyn Device,
    ) -> Result<NonNull<L0Table>, VmError> {
        if self.children[idx].is_none() {
            let backing = BackingPage::init(device)?;
            let dma = backing.dma_addr();
            let parent = NonNull::from(&mut *self);
            let child = L0Table::new(backing, parent, idx);
            self.backing.words_mut()[idx] = L1Entry::new(dma).0;
            self.children[idx] = Some(child);
            self.entry_count += 1;
        }
        let child = self.children[idx].as_mut().expect("just inserted or already present");
        Ok(NonNull::from(&mut **child))
    }

    /// If the L0 table at `idx` exists and is empty, invalidate this
    /// table's entry and destroy it (spec.md §4.2, "cascading destroy").
    /// A no-op if the slot is empty or the child still holds leaves.
    ///
    /// # Safety
    /// `device` must be the device the backing pages were allocated from.
    pub unsafe fn destroy_l0_if_empty(&mut self, idx: usize, device: &dyn Device) {
        let destroy = matches!(&self.children[idx], Some(child) if child.is_empty());
        if !destroy {
            return;
        }
        let child = self.children[idx].take().expect("checked above");
        self.backing.words_mut()[idx] = L1Entry::INVALID.0;
        self.entry_count -= 1;
        // SAFETY: forwarded from the caller's contract.
        unsafe { child.fini(device) };
    }

    pub fn sync(&self) {
        self.backing.sync()
    }

    /// Recursively finalise this table and every L0 table still linked
    /// under it.
    ///
    /// # Safety
    /// `device` must be the device the backing pages were allocated from.
    unsafe fn fini(mut self: Box<Self>, device: &dyn Device) {
        for slot in self.children.iter_mut() {
            if let Some(l0) = slot.take() {
                // SAFETY: forwarded from the caller's contract.
                unsafe { l0.fini(device) };
            }
        }
        self.entry_count = 0;
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.backing.fini(device) };
    }
}

/// Root table: `L2_ENTRIES` slots, each optionally owning one [`L1Table`].
/// One of these anchors each [`crate::context::VmContext`].
pub struct L2Table {
    backing: BackingPage,
    entry_count: usize,
    children: [Option<Box<L1Table>>; L2_ENTRIES],
}

impl L2Table {
    pub fn init(device: &dyn Device) -> Result<Box<Self>, VmError> {
        let backing = BackingPage::init(device)?;
        Ok(Box::new(Self { backing, entry_count: 0, children: core::array::from_fn(|_| None) }))
    }

    pub fn dma_addr(&self) -> u64 {
        self.backing.dma_addr()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn raw(&self, idx: usize) -> L2Entry {
        L2Entry(self.backing.words32()[idx])
    }

    pub fn entry_is_valid(&self, idx: usize) -> bool {
        self.raw(idx).is_valid()
    }

    pub fn child(&self, idx: usize) -> Option<&L1Table> {
        self.children[idx].as_deref()
    }

    pub fn child_mut(&mut self, idx: usize) -> Option<&mut L1Table> {
        self.children[idx].as_deref_mut()
    }

    /// Return the L1 table at `idx`, allocating and linking a fresh one if
    /// none exists yet. On allocation failure the table is left exactly as
    /// it was before the call.
    pub fn get_or_create_l1(
        &mut self,
        idx: usize,
        device: &dyn Device,
    ) -> Result<NonNull<L1Table>, VmError> {
        if self.children[idx].is_none() {
            let backing = BackingPage::init(device)?;
            let dma = backing.dma_addr();
            let parent = NonNull::from(&mut *self);
            let child = L1Table::new(backing, parent, idx);
            self.backing.words32_mut()[idx] = L2Entry::new(dma).0;
            self.children[idx] = Some(child);
            self.entry_count += 1;
        }
        let child = self.children[idx].as_mut().expect("just inserted or already present");
        Ok(NonNull::from(&mut **child))
    }

    /// If the L1 table at `idx` exists and is empty, invalidate this
    /// table's entry and destroy it. A no-op if the slot is empty or the
    /// child still holds entries.
    ///
    /// # Safety
    /// `device` must be the device the backing pages were allocated from.
    pub unsafe fn destroy_l1_if_empty(&mut self, idx: usize, device: &dyn Device) {
        let destroy = matches!(&self.children[idx], Some(child) if child.is_empty());
        if !destroy {
            return;
        }
        let child = self.children[idx].take().expect("checked above");
        self.backing.words32_mut()[idx] = L2Entry::INVALID.0;
        self.entry_count -= 1;
        // SAFETY: forwarded from the caller's contract.
        unsafe { child.fini(device) };
    }

    pub fn sync(&self) {
        self.backing.sync()
    }

    /// Recursively finalise the whole tree (spec.md §4.6, context
    /// destroy): every still-linked L1 and L0 table is released before the
    /// root itself.
    ///
    /// # Safety
    /// `device` must be the device the backing pages were allocated from.
    pub unsafe fn fini(mut self: Box<Self>, device: &dyn Device) {
        for slot in self.children.iter_mut() {
            if let Some(l1) = slot.take() {
                // SAFETY: forwarded from the caller's contract.
                unsafe { l1.fini(device) };
            }
        }
        self.entry_count = 0;
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.backing.fini(device) };
    }
}
