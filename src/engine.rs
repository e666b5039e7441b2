//! `Engine`, the crate's single public entry point. Assembled the way a
//! paged-file reader typically wires up its pieces: one `SchemaFile` behind
//! a mutex, one `CacheCoordinator`, one `LockPool`, and an arena of
//! `TreeNode`s that mirrors whatever part of the on-disk tree has been
//! touched so far.
//!
//! A tree traversal acquires a `NodeLock` per visited node, consults the
//! `CacheCoordinator` for residency, and falls through to `SchemaFile` on a
//! miss. Everything below `Engine` is private to this crate; callers outside
//! it — a query planner, an RPC layer, or anything else built on top of the
//! metadata tree — talk to it only through this facade.

use std::path::Path;

use log::debug;
use parking_lot::Mutex;

use crate::arena::{Arena, NodeId};
use crate::cache::CacheCoordinator;
use crate::config::EngineConfig;
use crate::error::{PmtError, Result};
use crate::node::{ChildRecord, NodeKind, TreeNode};
use crate::node_lock::LockPool;
use crate::schema_file::SchemaFile;

/// Average child-name length assumed by `estimate_segment_size` when no
/// better information is available. Real workloads should tune this by
/// measuring; the core engine just needs a reasonable starting estimate.
const AVG_NAME_LEN: usize = 16;
const PAYLOAD_ESTIMATE_INTERNAL: usize = 14;
const PAYLOAD_ESTIMATE_MEASUREMENT_BASE: usize = 24;

fn payload_estimate(kind: &NodeKind) -> usize {
    match kind {
        NodeKind::Measurement { alias } => {
            PAYLOAD_ESTIMATE_MEASUREMENT_BASE + alias.as_deref().map(str::len).unwrap_or(0)
        }
        _ => PAYLOAD_ESTIMATE_INTERNAL,
    }
}

/// The metadata tree storage engine. `Engine::open` brings the root node
/// into memory; everything else is loaded lazily as callers traverse.
pub struct Engine {
    schema_file: Mutex<SchemaFile>,
    cache: Mutex<CacheCoordinator>,
    locks: LockPool,
    arena: Mutex<Arena<TreeNode>>,
    root: NodeId,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_at(&config.file_path, &config)
    }

    fn open_at(path: &Path, config: &EngineConfig) -> Result<Self> {
        let mut schema_file = SchemaFile::open(path, config.page_cache_capacity)?;
        let mut arena = Arena::new();
        let root = arena.insert(TreeNode::new_root(NodeKind::Database));
        let mut cache = CacheCoordinator::new(config.node_cache_capacity);
        cache.register_root(root);
        schema_file.flush()?;
        debug!("engine opened at {:?}", path);
        Ok(Engine {
            schema_file: Mutex::new(schema_file),
            cache: Mutex::new(cache),
            locks: LockPool::new(config.lock_pool_capacity),
            arena: Mutex::new(arena),
            root,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // --- ancestor-chain bookkeeping shared by several operations --------

    /// Ancestor chain of `node`, nearest parent first, not including `node`
    /// itself. Every transition that touches the cold set or pin counts
    /// needs this chain.
    fn ancestors_of(&self, node: NodeId) -> Vec<NodeId> {
        let arena = self.arena.lock();
        let mut out = Vec::new();
        let mut cur = arena.get(node).and_then(|n| n.parent);
        while let Some(id) = cur {
            out.push(id);
            cur = arena.get(id).and_then(|n| n.parent);
        }
        out
    }

    pub fn pin(&self, node: NodeId) {
        let ancestors = self.ancestors_of(node);
        self.cache.lock().pin(node, &ancestors);
    }

    pub fn unpin(&self, node: NodeId) {
        let ancestors = self.ancestors_of(node);
        self.cache.lock().unpin(node, &ancestors);
    }

    pub fn is_volatile(&self, node: NodeId) -> bool {
        self.cache.lock().is_volatile(node)
    }

    pub fn pin_count(&self, node: NodeId) -> u32 {
        self.cache.lock().pin_count(node)
    }

    pub fn name_of(&self, node: NodeId) -> Option<String> {
        self.arena.lock().get(node).map(|n| n.name.clone())
    }

    /// Count of nodes currently resident in the cache coordinator. Exposed
    /// for callers that need to observe the eviction invariant (spec.md 8
    /// "resident count stays <= capacity") rather than inferring it.
    pub fn resident_count(&self) -> usize {
        self.cache.lock().resident_count()
    }

    // --- read path --------------------------------------------------------

    /// Resolve `name` under `parent`, reading from memory if already loaded,
    /// else asking `SchemaFile` and caching the result.
    pub fn get_child(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        let parent_lock = self.locks.get_or_create(parent);
        let _guard = parent_lock.read(false);
        self.resolve_child(parent, name)
    }

    /// The body of `get_child` once `parent`'s lock is already held by the
    /// caller. Kept separate so a caller already holding `parent`'s write
    /// guard (`delete_child`) can resolve a child without re-entering the
    /// same `NodeLock`, which would deadlock (`NodeLock` is not reentrant).
    fn resolve_child(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        if let Some(existing) = self.find_loaded_child(parent, name) {
            self.cache.lock().read_from_memory(existing);
            return Ok(Some(existing));
        }

        let subtree_addr = {
            let arena = self.arena.lock();
            let node = arena
                .get(parent)
                .ok_or_else(|| PmtError::corrupt("parent node not resident"))?;
            if node.kind.is_leaf() {
                return Ok(None);
            }
            node.subtree_address
        };
        let Some(addr) = subtree_addr else {
            return Ok(None);
        };

        let payload = self.schema_file.lock().read_child(addr, name.as_bytes())?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let record = ChildRecord::decode(&payload)?;
        let id = self.materialize_child(parent, name, record);
        self.cache.lock().read_from_disk(id);
        self.evict_if_over_capacity();
        Ok(Some(id))
    }

    /// Look for `name` among whatever children of `parent` are already
    /// resident, regardless of whether the full child set has ever been
    /// enumerated. `children_loaded` only means "the complete set is known"
    /// (consulted separately by `children()`); gating this lookup on it too
    /// would make a child fetched individually via `get_child` invisible to
    /// the next `get_child` for the same name, re-decoding it from
    /// `SchemaFile` and materializing a duplicate `NodeId` every time.
    fn find_loaded_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let arena = self.arena.lock();
        let node = arena.get(parent)?;
        node.children
            .iter()
            .copied()
            .find(|&id| arena.get(id).map(|n| n.name == name).unwrap_or(false))
    }

    fn materialize_child(&self, parent: NodeId, name: &str, record: ChildRecord) -> NodeId {
        let mut arena = self.arena.lock();
        let mut child = TreeNode::new_child(name.to_string(), record.kind, parent);
        child.subtree_address = record.subtree_address;
        child.attributes = record.attributes;
        child.persisted = true;
        let id = arena.insert(child);
        if let Some(p) = arena.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    /// Materialize every child of `parent`, streaming the whole segment
    /// chain on first access. The iterator itself is private to
    /// `SchemaFile`; `Engine` drains it once and caches the result, since
    /// callers expect `children()` to be revisitable.
    pub fn children(&self, parent: NodeId) -> Result<Vec<NodeId>> {
        let parent_lock = self.locks.get_or_create(parent);
        let _guard = parent_lock.read(false);

        let already_loaded = {
            let arena = self.arena.lock();
            arena.get(parent).map(|n| n.children_loaded).unwrap_or(false)
        };
        if already_loaded {
            let arena = self.arena.lock();
            return Ok(arena.get(parent).map(|n| n.children.clone()).unwrap_or_default());
        }

        let (is_leaf, addr) = {
            let arena = self.arena.lock();
            let node = arena
                .get(parent)
                .ok_or_else(|| PmtError::corrupt("parent node not resident"))?;
            (node.kind.is_leaf(), node.subtree_address)
        };
        if is_leaf || addr.is_none() {
            if let Some(node) = self.arena.lock().get_mut(parent) {
                node.children_loaded = true;
            }
            return Ok(Vec::new());
        }

        let raw: Vec<(Vec<u8>, Vec<u8>)> = {
            let mut sf = self.schema_file.lock();
            sf.children(addr.unwrap()).collect::<Result<Vec<_>>>()?
        };

        let mut ids = Vec::with_capacity(raw.len());
        for (key, payload) in raw {
            let name = String::from_utf8(key)
                .map_err(|e| PmtError::corrupt(format!("non-utf8 child name: {e}")))?;
            if let Some(existing) = self.find_loaded_child(parent, &name) {
                ids.push(existing);
                continue;
            }
            let record = ChildRecord::decode(&payload)?;
            let id = self.materialize_child(parent, &name, record);
            self.cache.lock().read_from_disk(id);
            ids.push(id);
        }
        if let Some(node) = self.arena.lock().get_mut(parent) {
            node.children_loaded = true;
        }
        self.evict_if_over_capacity();
        Ok(ids)
    }

    // --- write path: append/update are staged volatile and deferred to
    //     `flush`; delete is eager ------------------------------------------

    /// Append a brand-new child under `parent`. The child is only marked
    /// volatile here; it is not written to `SchemaFile` until `flush`.
    pub fn append_child(
        &self,
        parent: NodeId,
        name: impl Into<String>,
        kind: NodeKind,
        attributes: Vec<u8>,
    ) -> Result<NodeId> {
        let parent_lock = self.locks.get_or_create(parent);
        let _guard = parent_lock.write();

        let name = name.into();
        if self.find_loaded_child(parent, &name).is_some() {
            return Err(PmtError::Duplicate);
        }

        let id = {
            let mut arena = self.arena.lock();
            let mut node = TreeNode::new_child(name, kind, parent);
            node.attributes = attributes;
            let id = arena.insert(node);
            if let Some(p) = arena.get_mut(parent) {
                p.children.push(id);
            }
            id
        };

        let ancestors = self.ancestors_of(id);
        self.cache.lock().append_child(id, &ancestors);
        self.evict_if_over_capacity();
        Ok(id)
    }

    /// Overwrite `node`'s attribute blob, marking it (and its ancestor
    /// chain, if not already volatile) dirty.
    pub fn update_child(&self, node: NodeId, attributes: Vec<u8>) -> Result<()> {
        let lock = self.locks.get_or_create(node);
        let _guard = lock.write();

        {
            let mut arena = self.arena.lock();
            let n = arena
                .get_mut(node)
                .ok_or_else(|| PmtError::corrupt("node not resident"))?;
            n.attributes = attributes;
        }
        let ancestors = self.ancestors_of(node);
        self.cache.lock().update(node, &ancestors);
        Ok(())
    }

    /// Remove `name` from under `parent` immediately: unlike append/update,
    /// delete is eager, since there is no "volatile delete" state in the
    /// cache model.
    pub fn delete_child(&self, parent: NodeId, name: &str) -> Result<()> {
        let parent_lock = self.locks.get_or_create(parent);
        let _guard = parent_lock.write();

        let child_id = self.resolve_child(parent, name)?.ok_or(PmtError::NotFound)?;

        let (subtree_addr, parent_subtree) = {
            let arena = self.arena.lock();
            let child = arena.get(child_id).unwrap();
            let parent_node = arena.get(parent).unwrap();
            (child.subtree_address, parent_node.subtree_address)
        };

        if let Some(parent_addr) = parent_subtree {
            let mut sf = self.schema_file.lock();
            match sf.delete_child(parent_addr, name.as_bytes()) {
                Ok(()) | Err(PmtError::NotFound) => {}
                Err(e) => return Err(e),
            }
            if let Some(addr) = subtree_addr {
                sf.free_subtree(addr)?;
            }
        }

        {
            let mut arena = self.arena.lock();
            if let Some(p) = arena.get_mut(parent) {
                p.children.retain(|&id| id != child_id);
            }
            arena.remove(child_id);
        }
        self.cache.lock().remove(child_id);
        Ok(())
    }

    // --- flush --------------------------------------------------------

    /// Persist every volatile subtree to `SchemaFile`. Subtrees that fail
    /// remain volatile and are re-queued; the first error encountered (if
    /// any) is returned after every subtree has been attempted.
    pub fn flush(&self) -> Result<()> {
        let roots = self.cache.lock().take_buffer_set();
        let mut first_err = None;

        for root in roots {
            let write_list = self.collect_write_list(root);
            match self.write_subtree(&write_list) {
                Ok(()) => self.cache.lock().persist_complete(&write_list),
                Err(e) => {
                    self.cache.lock().readd_to_buffer(root);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        self.schema_file.lock().flush()?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.schema_file.into_inner().close()
    }

    /// Pre-order (parent before child) list of every node that itself holds
    /// at least one volatile child, rooted at a buffer-set anchor. Parent
    /// before child so pre-allocation of a child's subtree address is
    /// visible when the parent's own record is written.
    fn collect_write_list(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = vec![node];
        let children = {
            let arena = self.arena.lock();
            arena.get(node).map(|n| n.children.clone()).unwrap_or_default()
        };
        for child in children {
            if self.cache.lock().is_volatile(child) {
                out.extend(self.collect_write_list(child));
            }
        }
        out
    }

    /// Write every node in `write_list` (each entry is a node whose
    /// newly-appended/updated children must be persisted into its own
    /// subtree segment).
    fn write_subtree(&self, write_list: &[NodeId]) -> Result<()> {
        for &node in write_list {
            self.write_node(node)?;
        }
        Ok(())
    }

    fn write_node(&self, node: NodeId) -> Result<()> {
        let children: Vec<NodeId> = {
            let arena = self.arena.lock();
            arena
                .get(node)
                .ok_or_else(|| PmtError::corrupt("node not resident during flush"))?
                .children
                .clone()
        };

        let existing_addr = self.arena.lock().get(node).and_then(|n| n.subtree_address);
        let children_payload_estimate = {
            let arena = self.arena.lock();
            children
                .iter()
                .filter_map(|&c| arena.get(c).map(|n| payload_estimate(&n.kind)))
                .max()
                .unwrap_or(PAYLOAD_ESTIMATE_INTERNAL)
        };
        let addr_before = {
            let mut sf = self.schema_file.lock();
            sf.ensure_subtree_address(existing_addr, children.len().max(1), AVG_NAME_LEN, children_payload_estimate)?
        };
        if let Some(n) = self.arena.lock().get_mut(node) {
            n.subtree_address = Some(addr_before);
        }

        let mut head = addr_before;
        for child in children {
            let is_new = !self.arena.lock().get(child).map(|n| n.persisted).unwrap_or(false);

            let needs_subtree = {
                let arena = self.arena.lock();
                let c = arena.get(child).unwrap();
                !c.kind.is_leaf() && c.subtree_address.is_none()
            };
            if needs_subtree {
                let (grandchild_count, grandchild_payload_estimate) = {
                    let arena = self.arena.lock();
                    let grandchildren = arena.get(child).map(|n| n.children.clone()).unwrap_or_default();
                    let estimate = grandchildren
                        .iter()
                        .filter_map(|&g| arena.get(g).map(|n| payload_estimate(&n.kind)))
                        .max()
                        .unwrap_or(PAYLOAD_ESTIMATE_INTERNAL);
                    (grandchildren.len(), estimate)
                };
                let child_addr = self.schema_file.lock().ensure_subtree_address(
                    None,
                    grandchild_count.max(1),
                    AVG_NAME_LEN,
                    grandchild_payload_estimate,
                )?;
                if let Some(c) = self.arena.lock().get_mut(child) {
                    c.subtree_address = Some(child_addr);
                }
            }

            let (name, record) = {
                let arena = self.arena.lock();
                let c = arena.get(child).unwrap();
                (c.name.clone(), c.to_record().encode())
            };

            head = if is_new {
                self.schema_file.lock().insert_child(head, name.as_bytes(), &record)?
            } else {
                self.schema_file.lock().update_child(head, name.as_bytes(), &record)?
            };
            if let Some(c) = self.arena.lock().get_mut(child) {
                c.persisted = true;
            }
        }

        if let Some(n) = self.arena.lock().get_mut(node) {
            n.subtree_address = Some(head);
        }
        if head != addr_before {
            self.propagate_address_change(node)?;
        }
        Ok(())
    }

    /// `node`'s own subtree segment moved (transplant). The record that
    /// describes `node` — stored in `node.parent`'s segment — must be
    /// rewritten to point at the new address, and if that rewrite itself
    /// grows the parent's segment, the grandparent's record needs the same
    /// treatment, and so on up to (but excluding) the root.
    fn propagate_address_change(&self, mut node: NodeId) -> Result<()> {
        loop {
            let parent = self.arena.lock().get(node).and_then(|n| n.parent);
            let Some(parent) = parent else {
                return Ok(());
            };
            let parent_addr = self
                .arena
                .lock()
                .get(parent)
                .and_then(|n| n.subtree_address)
                .ok_or_else(|| PmtError::corrupt("parent missing subtree address during flush"))?;

            let (name, record) = {
                let arena = self.arena.lock();
                let n = arena.get(node).unwrap();
                (n.name.clone(), n.to_record().encode())
            };
            let new_parent_addr = self
                .schema_file
                .lock()
                .update_child(parent_addr, name.as_bytes(), &record)?;

            let changed = new_parent_addr != parent_addr;
            if let Some(p) = self.arena.lock().get_mut(parent) {
                p.subtree_address = Some(new_parent_addr);
            }
            if !changed {
                return Ok(());
            }
            node = parent;
        }
    }

    // --- eviction -----------------------------------------------------

    fn evict_if_over_capacity(&self) {
        loop {
            let over = {
                let cache = self.cache.lock();
                cache.resident_count() > cache.capacity()
            };
            if !over {
                return;
            }
            let evicted = {
                let arena = self.arena.lock();
                let mut cache = self.cache.lock();
                cache.evict_one(|id| arena.get(id).map(|n| n.children.clone()).unwrap_or_default())
            };
            match evicted {
                Some(ids) => self.detach_evicted(&ids),
                None => return,
            }
        }
    }

    fn detach_evicted(&self, ids: &[NodeId]) {
        let mut arena = self.arena.lock();
        let evicted: std::collections::HashSet<NodeId> = ids.iter().copied().collect();
        for &id in ids {
            if let Some(node) = arena.get(id) {
                if let Some(parent) = node.parent {
                    if !evicted.contains(&parent) {
                        if let Some(p) = arena.get_mut(parent) {
                            p.children.retain(|c| c != &id);
                            p.children_loaded = false;
                        }
                    }
                }
            }
            arena.remove(id);
        }
    }
}
