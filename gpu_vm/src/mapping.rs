//! Mapping interval tree (spec.md §4.5): the index of currently installed
//! mappings, keyed by their device-virtual start address.
//!
//! Mappings are guaranteed non-overlapping (enforced by the caller via
//! [`MappingTree::contains`] before every insert), so a `BTreeMap<u64, _>`
//! keyed by `start` gives every operation an augmented red-black tree would
//! — ordered iteration, nearest-predecessor lookup for `find`/`contains` —
//! without hand-rolling the "subtree max last" augmentation (see
//! DESIGN.md).

use alloc::collections::BTreeMap;

use crate::device::ObjectFlags;

/// One installed mapping (spec.md §3, "Mapping node").
pub struct MappingNode<G> {
    pub start: u64,
    pub size: u64,
    pub object: G,
    /// Byte offset into `object` this mapping starts at, or `None` for
    /// "the whole object, from offset zero".
    pub object_offset: Option<u64>,
    pub flags: ObjectFlags,
}

impl<G> MappingNode<G> {
    /// Inclusive end of the interval, for intersection tests.
    pub fn last(&self) -> u64 {
        debug_assert_ne!(self.size, 0);
        self.start + self.size - 1
    }
}

/// The tree of mappings for one [`crate::context::VmContext`].
pub struct MappingTree<G> {
    nodes: BTreeMap<u64, MappingNode<G>>,
}

impl<G> MappingTree<G> {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link `node` into the tree. Precondition: `node.start` is not
    /// currently linked and does not intersect any linked node (checked by
    /// the caller via `contains` before building the node).
    pub fn insert(&mut self, node: MappingNode<G>) {
        debug_assert!(
            !self.contains(node.start, node.size),
            "overlap checks must run before insert"
        );
        let prev = self.nodes.insert(node.start, node);
        debug_assert!(prev.is_none(), "node.start was already linked");
    }

    /// Unlink and return the node whose `start` equals `start` exactly.
    pub fn remove(&mut self, start: u64) -> Option<MappingNode<G>> {
        self.nodes.remove(&start)
    }

    /// The node whose `start` exactly equals `start` (spec.md §4.5, used by
    /// `unmap` to match the caller's handle).
    pub fn get(&self, start: u64) -> Option<&MappingNode<G>> {
        self.nodes.get(&start)
    }

    /// Whether any linked node intersects `[start, start + size)`.
    pub fn contains(&self, start: u64, size: u64) -> bool {
        self.intersecting(start, size).next().is_some()
    }

    /// The node that *completely* contains `[start, start + size)`, used by
    /// reverse lookup.
    pub fn find(&self, start: u64, size: u64) -> Option<&MappingNode<G>> {
        if size == 0 {
            return None;
        }
        let last = start + size - 1;
        self.predecessor(start).filter(|n| n.start <= start && n.last() >= last)
    }

    /// All nodes intersecting `[start, start + size)`, in ascending `start`
    /// order (spec.md §4.5, `iter_first`/`iter_next`).
    pub fn intersecting(&self, start: u64, size: u64) -> impl Iterator<Item = &MappingNode<G>> {
        let last = start.saturating_add(size).wrapping_sub(1);
        let floor = self.predecessor(start).map(|n| n.start).unwrap_or(start);
        self.nodes
            .range(floor..)
            .take_while(move |(&s, _)| size != 0 && s <= last)
            .map(|(_, n)| n)
            .filter(move |n| n.last() >= start)
    }

    /// Every linked node, in ascending `start` order (used by context
    /// teardown to walk and unmap whatever is left).
    pub fn iter(&self) -> impl Iterator<Item = &MappingNode<G>> {
        self.nodes.values()
    }

    /// The node with the greatest `start <= addr`, if any — the only node
    /// that could possibly contain `addr` given non-overlap.
    fn predecessor(&self, addr: u64) -> Option<&MappingNode<G>> {
        self.nodes.range(..=addr).next_back().map(|(_, n)| n)
    }
}

impl<G> Default for MappingTree<G> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGemObject;

    fn node(start: u64, size: u64) -> MappingNode<FakeGemObject> {
        MappingNode {
            start,
            size,
            object: FakeGemObject::contiguous(0x1000, size),
            object_offset: None,
            flags: ObjectFlags::default(),
        }
    }

    #[test]
    fn get_matches_exact_start_only() {
        let mut tree = MappingTree::new();
        tree.insert(node(0x1000, 0x1000));
        assert!(tree.get(0x1000).is_some());
        assert!(tree.get(0x1800).is_none());
    }

    #[test]
    fn contains_detects_overlap_from_either_side() {
        let mut tree = MappingTree::new();
        tree.insert(node(0x2000, 0x2000));
        assert!(tree.contains(0x1000, 0x1500)); // overlaps the start
        assert!(tree.contains(0x3000, 0x2000)); // overlaps the middle/end
        assert!(!tree.contains(0x4000, 0x1000)); // adjacent, not overlapping
        assert!(!tree.contains(0x0, 0x1000)); // strictly before
    }

    #[test]
    fn find_requires_full_containment() {
        let mut tree = MappingTree::new();
        tree.insert(node(0x1000, 0x4000));
        assert!(tree.find(0x2000, 0x1000).is_some());
        assert!(tree.find(0x0, 0x2000).is_none(), "starts before the mapping");
        assert!(tree.find(0x3000, 0x3000).is_none(), "runs past the mapping's end");
    }

    #[test]
    fn intersecting_is_ascending_and_exhaustive() {
        let mut tree = MappingTree::new();
        tree.insert(node(0x0, 0x1000));
        tree.insert(node(0x2000, 0x1000));
        tree.insert(node(0x4000, 0x1000));
        let starts: alloc::vec::Vec<u64> =
            tree.intersecting(0x1000, 0x3001).map(|n| n.start).collect();
        assert_eq!(starts, alloc::vec![0x2000, 0x4000]);
    }

    #[test]
    fn remove_unlinks_and_frees_the_slot() {
        let mut tree = MappingTree::new();
        tree.insert(node(0x1000, 0x1000));
        assert!(tree.remove(0x1000).is_some());
        assert!(tree.get(0x1000).is_none());
        assert!(tree.is_empty());
    }
}
