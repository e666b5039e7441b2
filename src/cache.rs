//! In-memory cache coordinator: tracks which tree nodes are resident, which
//! are volatile (dirty), which are pinned, and drives the cold/volatile/
//! pinned state machine that `Engine` consults on every traversal step.
//!
//! A production system might shard the cold set across many buckets by
//! entry hash to cut lock contention under concurrent eviction. `Engine`
//! already serializes all cache-coordinator access behind its own mutex (see
//! `engine.rs`), so sharding would buy nothing here; this keeps a single
//! recency-ordered structure instead and records the simplification in
//! DESIGN.md rather than building contention relief nothing contends for.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::arena::NodeId;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    volatile: bool,
    pin_count: u32,
}

impl CacheEntry {
    fn evictable(&self) -> bool {
        self.pin_count == 0 && !self.volatile
    }
}

/// Tracks residency, volatility and pinning for every node `Engine` has
/// loaded into its arena. Does not itself own `TreeNode` data — callers
/// supply ancestor chains and child lookups, since parent/child links live
/// in `Engine`'s arena.
pub struct CacheCoordinator {
    entries: HashMap<NodeId, CacheEntry>,
    /// Cold set in LRU order: front is least recently used. A `HashSet`
    /// mirrors membership for O(1) cold/not-cold checks.
    cold_order: Vec<NodeId>,
    cold_members: HashSet<NodeId>,
    /// Roots of maximal volatile subtrees awaiting flush.
    buffer_set: HashSet<NodeId>,
    capacity: usize,
}

impl CacheCoordinator {
    pub fn new(capacity: usize) -> Self {
        CacheCoordinator {
            entries: HashMap::new(),
            cold_order: Vec::new(),
            cold_members: HashSet::new(),
            buffer_set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resident_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_resident(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_volatile(&self, id: NodeId) -> bool {
        self.entries.get(&id).map(|e| e.volatile).unwrap_or(false)
    }

    pub fn pin_count(&self, id: NodeId) -> u32 {
        self.entries.get(&id).map(|e| e.pin_count).unwrap_or(0)
    }

    fn ensure_entry(&mut self, id: NodeId) {
        self.entries.entry(id).or_insert(CacheEntry {
            volatile: false,
            pin_count: 0,
        });
    }

    fn is_cold(&self, id: NodeId) -> bool {
        self.cold_members.contains(&id)
    }

    fn add_to_cold(&mut self, id: NodeId) {
        if self.cold_members.insert(id) {
            self.cold_order.push(id);
        }
    }

    fn remove_from_cold(&mut self, id: NodeId) {
        if self.cold_members.remove(&id) {
            if let Some(pos) = self.cold_order.iter().position(|&x| x == id) {
                self.cold_order.remove(pos);
            }
        }
    }

    fn touch_cold(&mut self, id: NodeId) {
        if self.cold_members.contains(&id) {
            if let Some(pos) = self.cold_order.iter().position(|&x| x == id) {
                self.cold_order.remove(pos);
            }
            self.cold_order.push(id);
        }
    }

    // --- residency and volatility transitions ---------------------------

    /// Bump recency if `node` is in the cold set.
    pub fn read_from_memory(&mut self, node: NodeId) {
        self.touch_cold(node);
    }

    /// A node was just loaded from disk: it becomes resident and evictable.
    pub fn read_from_disk(&mut self, node: NodeId) {
        self.ensure_entry(node);
        self.add_to_cold(node);
    }

    /// Register the root as resident without entering the cold set. The
    /// root is the one node every traversal passes through, so it is never
    /// a sensible eviction target (mirrors `SchemaFile`'s own root page,
    /// which stays pinned in its page cache permanently) — expressed here
    /// as "never cold" rather than a borrowed pin, since no caller actually
    /// holds a pin on it.
    pub fn register_root(&mut self, id: NodeId) {
        self.ensure_entry(id);
    }

    /// A brand-new node was appended as a child. `ancestors` is the chain
    /// from the immediate parent up to (excluding) the root's own parent,
    /// nearest first.
    pub fn append_child(&mut self, new: NodeId, ancestors: &[NodeId]) {
        self.ensure_entry(new);
        self.entries.get_mut(&new).unwrap().volatile = true;
        self.remove_from_cold(new);
        self.mark_volatile_chain(ancestors);
    }

    /// An existing node was mutated in place. Identical ancestor-chain
    /// bookkeeping to `append_child`, applied starting at `node` itself.
    pub fn update(&mut self, node: NodeId, ancestors: &[NodeId]) {
        self.ensure_entry(node);
        let was_volatile = self.entries[&node].volatile;
        self.entries.get_mut(&node).unwrap().volatile = true;
        self.remove_from_cold(node);
        if !was_volatile {
            self.mark_volatile_chain(ancestors);
        }
    }

    /// Walk upward from the first ancestor: the nearest non-volatile
    /// ancestor joins the buffer set (it now has a volatile direct child);
    /// every ancestor visited is pulled out of the cold set. Stops at the
    /// first ancestor that was already non-cold (it and everything above it
    /// are already excluded from eviction).
    fn mark_volatile_chain(&mut self, ancestors: &[NodeId]) {
        let mut iter = ancestors.iter();
        if let Some(&parent) = iter.next() {
            self.ensure_entry(parent);
            if !self.entries[&parent].volatile {
                self.buffer_set.insert(parent);
            }
        }
        for &ancestor in ancestors {
            if !self.is_cold(ancestor) && self.entries.contains_key(&ancestor) {
                // Already excluded from eviction higher up; nothing further
                // to do for this or any ancestor above it, EXCEPT this loop
                // still needs to remove `ancestor` itself if it was cold.
                continue;
            }
            self.ensure_entry(ancestor);
            self.remove_from_cold(ancestor);
        }
    }

    /// Snapshot the buffer set and clear it, the first step of a flush.
    pub fn take_buffer_set(&mut self) -> Vec<NodeId> {
        self.buffer_set.drain().collect()
    }

    /// Re-queue a subtree root whose flush attempt failed.
    pub fn readd_to_buffer(&mut self, root: NodeId) {
        self.buffer_set.insert(root);
    }

    /// Every node in a successfully flushed subtree becomes clean and
    /// rejoins the cold set (unless still pinned).
    pub fn persist_complete(&mut self, subtree_nodes: &[NodeId]) {
        for &id in subtree_nodes {
            self.ensure_entry(id);
            let entry = self.entries.get_mut(&id).unwrap();
            entry.volatile = false;
            if entry.pin_count == 0 {
                self.add_to_cold(id);
            }
        }
        trace!("persisted {} nodes, rejoined cold set", subtree_nodes.len());
    }

    /// Increment `pin_count` on `node` and every ancestor up to the root.
    /// Pinned nodes leave the cold set.
    pub fn pin(&mut self, node: NodeId, ancestors: &[NodeId]) {
        for &id in std::iter::once(&node).chain(ancestors.iter()) {
            self.ensure_entry(id);
            let entry = self.entries.get_mut(&id).unwrap();
            entry.pin_count += 1;
            self.remove_from_cold(id);
        }
    }

    /// Decrement `pin_count` on `node` and, while it has just reached zero,
    /// on each ancestor in turn. A node that drops to zero pins rejoins the
    /// cold set unless it is volatile.
    pub fn unpin(&mut self, node: NodeId, ancestors: &[NodeId]) {
        let mut reached_zero = true;
        for &id in std::iter::once(&node).chain(ancestors.iter()) {
            if !reached_zero {
                break;
            }
            self.ensure_entry(id);
            let entry = self.entries.get_mut(&id).unwrap();
            debug_assert!(entry.pin_count > 0, "unbalanced unpin on {id:?}");
            entry.pin_count = entry.pin_count.saturating_sub(1);
            reached_zero = entry.pin_count == 0;
            if reached_zero && !entry.volatile {
                self.add_to_cold(id);
            }
        }
    }

    /// Drop a node's cache entry entirely (used once `Engine` has actually
    /// evicted or deleted it).
    pub fn remove(&mut self, id: NodeId) {
        self.entries.remove(&id);
        self.remove_from_cold(id);
        self.buffer_set.remove(&id);
    }

    /// Pick one evictable subtree: walk the cold set oldest-first, and for
    /// each candidate check (via `children_of`) whether its entire resident
    /// descendant set is itself evictable. Returns the full set of node ids
    /// to tear down (candidate last, so callers can detach leaves first),
    /// or `None` if nothing in the cold set currently qualifies.
    ///
    /// A subtree is evicted atomically: if any descendant is pinned or
    /// volatile, this candidate is skipped entirely rather than partially
    /// torn down.
    pub fn evict_one<F>(&mut self, children_of: F) -> Option<Vec<NodeId>>
    where
        F: Fn(NodeId) -> Vec<NodeId>,
    {
        for i in 0..self.cold_order.len() {
            let candidate = self.cold_order[i];
            if let Some(subtree) = self.collect_evictable_subtree(candidate, &children_of) {
                for &id in &subtree {
                    self.remove(id);
                }
                debug!("evicting subtree rooted at {candidate:?} ({} nodes)", subtree.len());
                return Some(subtree);
            }
        }
        None
    }

    fn collect_evictable_subtree<F>(&self, root: NodeId, children_of: &F) -> Option<Vec<NodeId>>
    where
        F: Fn(NodeId) -> Vec<NodeId>,
    {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.entries.get(&id) {
                Some(entry) if entry.evictable() => {}
                _ => return None,
            }
            out.push(id);
            for child in children_of(id) {
                if self.entries.contains_key(&child) {
                    stack.push(child);
                }
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId(id)
    }

    #[test]
    fn append_child_marks_volatile_and_pulls_ancestors_from_cold() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.read_from_disk(n(1));
        c.append_child(n(2), &[n(1), n(0)]);

        assert!(c.is_volatile(n(2)));
        assert!(!c.is_cold(n(2)));
        assert!(!c.is_cold(n(1)));
        assert!(!c.is_cold(n(0)));
    }

    #[test]
    fn persist_complete_clears_volatile_and_rejoins_cold() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.append_child(n(1), &[n(0)]);
        let roots = c.take_buffer_set();
        assert_eq!(roots, vec![n(0)]);
        c.persist_complete(&[n(0), n(1)]);
        assert!(!c.is_volatile(n(1)));
        assert!(c.is_cold(n(0)));
        assert!(c.is_cold(n(1)));
    }

    #[test]
    fn pin_propagates_up_ancestor_chain() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.read_from_disk(n(1));
        c.read_from_disk(n(2));
        c.pin(n(2), &[n(1), n(0)]);
        assert_eq!(c.pin_count(n(2)), 1);
        assert_eq!(c.pin_count(n(1)), 1);
        assert_eq!(c.pin_count(n(0)), 1);
        assert!(!c.is_cold(n(2)));

        c.unpin(n(2), &[n(1), n(0)]);
        assert_eq!(c.pin_count(n(2)), 0);
        assert_eq!(c.pin_count(n(1)), 0);
        assert_eq!(c.pin_count(n(0)), 0);
        assert!(c.is_cold(n(2)));
    }

    #[test]
    fn evict_one_skips_subtrees_with_pinned_descendant() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.read_from_disk(n(1));
        c.pin(n(1), &[]);

        let children = |id: NodeId| if id == n(0) { vec![n(1)] } else { vec![] };
        assert!(c.evict_one(children).is_none());
    }

    #[test]
    fn evict_one_tears_down_whole_evictable_subtree() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.read_from_disk(n(1));

        let children = |id: NodeId| if id == n(0) { vec![n(1)] } else { vec![] };
        let evicted = c.evict_one(children).unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(!c.is_resident(n(0)));
        assert!(!c.is_resident(n(1)));
    }

    #[test]
    fn never_evicts_a_volatile_node() {
        let mut c = CacheCoordinator::new(100);
        c.read_from_disk(n(0));
        c.append_child(n(1), &[n(0)]);

        let children = |id: NodeId| if id == n(0) { vec![n(1)] } else { vec![] };
        assert!(c.evict_one(children).is_none());
    }
}
