use std::collections::{HashMap, HashSet};

use crate::error::{Result, TreeError};
use crate::node::{LoadState, Node, NodeId, NodeKey, Record};

/// One position in a folder's child list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Loaded(NodeKey),
    /// An explicit gap: the row exists on the server but has not been
    /// fetched. Consumers request it rather than block on it.
    Placeholder,
}

/// Arena of currently-known tree nodes.
///
/// Cross-references are arena keys, never pointers: the parent owns its
/// child slots, children carry a non-owning back key, and an id index gives
/// O(1) lookup for records with server identity. Every non-root node is
/// reachable from the (virtual, hidden) root via exactly one parent chain.
///
/// All operations here are synchronous and non-blocking; merges are atomic
/// per call, so concurrent readers never observe a half-written node.
pub struct NodeStore {
    arena: HashMap<NodeKey, Node>,
    by_id: HashMap<NodeId, NodeKey>,
    root: NodeKey,
    next_key: u64,
    default_is_folder: bool,
    discard_parentless: bool,
}

impl NodeStore {
    pub fn new(default_is_folder: bool, discard_parentless: bool) -> Self {
        let root = NodeKey(0);
        let mut arena = HashMap::new();
        arena.insert(
            root,
            Node {
                key: root,
                parent: None,
                record: Record {
                    is_folder: Some(true),
                    ..Default::default()
                },
                children: Vec::new(),
                load_state: LoadState::Unloaded,
                expanded: true,
                depth: 0,
            },
        );
        Self {
            arena,
            by_id: HashMap::new(),
            root,
            next_key: 1,
            default_is_folder,
            discard_parentless,
        }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.arena.get(&key)
    }

    pub fn key_of(&self, id: &str) -> Option<NodeKey> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.arena.contains_key(&key)
    }

    /// Number of cached nodes, the virtual root included.
    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn set_expanded(&mut self, key: NodeKey, expanded: bool) {
        match self.arena.get_mut(&key) {
            Some(node) => node.expanded = expanded,
            None => tracing::debug!(?key, "set_expanded on unknown node ignored"),
        }
    }

    pub(crate) fn node_mut(&mut self, key: NodeKey) -> Result<&mut Node> {
        self.arena
            .get_mut(&key)
            .ok_or_else(|| TreeError::DanglingReference(format!("unknown node {key:?}")))
    }

    fn node_ref(&self, key: NodeKey) -> Result<&Node> {
        self.arena
            .get(&key)
            .ok_or_else(|| TreeError::DanglingReference(format!("unknown node {key:?}")))
    }

    fn alloc_key(&mut self) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub(crate) fn normalize(&self, mut record: Record) -> Record {
        let folderish =
            record.is_folder.unwrap_or(self.default_is_folder) || record.child_count.is_some();
        record.is_folder = Some(folderish);
        record
    }

    /// The total number of children of a folder, when known.
    pub fn declared_child_count(&self, key: NodeKey) -> Option<usize> {
        let node = self.node(key)?;
        match node.load_state {
            LoadState::FullyLoaded => Some(node.children.len()),
            LoadState::PartiallyLoaded { child_count } => Some(child_count),
            _ => node.record.child_count,
        }
    }

    /// Child slots for `start..end`, with explicit placeholder gaps.
    ///
    /// For a folder whose total is unknown and whose children are not yet
    /// loaded, every requested index is reported as a gap.
    pub fn child_range(&self, parent: NodeKey, start: usize, end: usize) -> Vec<Slot> {
        let Some(node) = self.node(parent) else {
            tracing::debug!(?parent, "child_range on unknown parent");
            return Vec::new();
        };
        let declared = self.declared_child_count(parent);
        let mut out = Vec::new();
        for i in start..end {
            if let Some(slot) = node.children.get(i) {
                out.push(match slot {
                    Some(key) => Slot::Loaded(*key),
                    None => Slot::Placeholder,
                });
            } else {
                match declared {
                    Some(total) if i < total => out.push(Slot::Placeholder),
                    Some(_) => break,
                    None => out.push(Slot::Placeholder),
                }
            }
        }
        out
    }

    // ── Merging fetched children ─────────────────────────────────────────────

    /// Idempotent merge of fetched children into a folder, starting at row
    /// `start`. Overlapping ranges overwrite.
    ///
    /// When `total` is given, the folder becomes FullyLoaded once every slot
    /// in `0..total` is covered, else PartiallyLoaded. Without a total the
    /// records are taken to be the folder's complete child set.
    ///
    /// Records whose `parent_id` resolves to no known node follow the
    /// parentless policy: dropped (with a debug log) or attached under the
    /// requested folder.
    pub fn attach_children(
        &mut self,
        parent: NodeKey,
        records: Vec<Record>,
        start: usize,
        total: Option<usize>,
    ) -> Result<Vec<NodeKey>> {
        let parent_rec_id = self.node_ref(parent)?.record.id.clone();

        let mut attached = Vec::new();
        let mut dropped = 0usize;
        let mut index = start;
        for record in records {
            if let Some(pid) = record.parent_id.clone() {
                let resolves = self.by_id.contains_key(&pid)
                    || parent_rec_id.as_deref() == Some(pid.as_str());
                if !resolves && self.discard_parentless {
                    tracing::debug!(parent_id = %pid, "dropping fetched record with unresolvable parent");
                    dropped += 1;
                    continue;
                }
            }
            let key = self.place_child(parent, record, index)?;
            attached.push(key);
            index += 1;
        }

        let total = total.map(|t| t.saturating_sub(dropped));
        match total {
            Some(t) => {
                let overflow: Vec<NodeKey> = {
                    let p = self.node_mut(parent)?;
                    p.record.is_folder = Some(true);
                    if p.children.len() > t {
                        p.children.drain(t..).flatten().collect()
                    } else {
                        p.children.resize(t, None);
                        Vec::new()
                    }
                };
                for key in overflow {
                    self.drop_subtree(key);
                }
                let p = self.node_mut(parent)?;
                p.load_state = if p.children.iter().all(|s| s.is_some()) {
                    LoadState::FullyLoaded
                } else {
                    LoadState::PartiallyLoaded { child_count: t }
                };
            }
            None => {
                let overflow: Vec<NodeKey> = {
                    let p = self.node_mut(parent)?;
                    p.record.is_folder = Some(true);
                    if p.children.len() > index {
                        p.children.drain(index..).flatten().collect()
                    } else {
                        Vec::new()
                    }
                };
                for key in overflow {
                    self.drop_subtree(key);
                }
                self.node_mut(parent)?.load_state = LoadState::FullyLoaded;
            }
        }
        Ok(attached)
    }

    /// Place one fetched record at a specific child index, reusing the
    /// existing node when the same id already lives under this parent.
    fn place_child(&mut self, parent: NodeKey, record: Record, index: usize) -> Result<NodeKey> {
        let reuse = record
            .id
            .as_ref()
            .and_then(|id| self.by_id.get(id).copied())
            .filter(|&k| self.arena.get(&k).and_then(|n| n.parent) == Some(parent));

        if reuse.is_none() {
            if let Some(id) = record.id.as_ref() {
                if let Some(&stale) = self.by_id.get(id) {
                    // same id cached under a different parent: the fetched
                    // response is authoritative
                    self.detach_slot(stale)?;
                    self.drop_subtree(stale);
                }
            }
        }

        // evict a different occupant of the target slot
        let occupant = self
            .node_ref(parent)?
            .children
            .get(index)
            .copied()
            .flatten();
        if let Some(occ) = occupant {
            if Some(occ) != reuse {
                if let Some(slot) = self.node_mut(parent)?.children.get_mut(index) {
                    *slot = None;
                }
                self.drop_subtree(occ);
            }
        }

        let record = self.normalize(record);
        let key = match reuse {
            Some(key) => {
                // relocate the slot if the server moved the row
                let p = self.node_mut(parent)?;
                if let Some(pos) = p.children.iter().position(|s| *s == Some(key)) {
                    if pos != index {
                        p.children[pos] = None;
                    }
                }
                self.node_mut(key)?.record = record;
                key
            }
            None => {
                let depth = self.node_ref(parent)?.depth + 1;
                let key = self.alloc_key();
                if let Some(id) = record.id.clone() {
                    self.by_id.insert(id, key);
                }
                self.arena.insert(
                    key,
                    Node {
                        key,
                        parent: Some(parent),
                        record,
                        children: Vec::new(),
                        load_state: LoadState::Unloaded,
                        expanded: false,
                        depth,
                    },
                );
                key
            }
        };

        let p = self.node_mut(parent)?;
        if p.children.len() <= index {
            p.children.resize(index + 1, None);
        }
        p.children[index] = Some(key);
        Ok(key)
    }

    /// Build a whole tree from one parent-linked response (non-incremental
    /// loading). Parentless records attach under root or are dropped per
    /// policy; nodes left unreachable by cyclic parent links are discarded.
    pub fn link_tree(&mut self, records: Vec<Record>) -> Result<Vec<NodeKey>> {
        let mut created = Vec::new();
        for record in records {
            let record = self.normalize(record);
            if let Some(id) = record.id.as_ref() {
                if let Some(&stale) = self.by_id.get(id) {
                    if stale != self.root {
                        self.detach_slot(stale)?;
                        self.drop_subtree(stale);
                    }
                }
            }
            let key = self.alloc_key();
            if let Some(id) = record.id.clone() {
                self.by_id.insert(id, key);
            }
            self.arena.insert(
                key,
                Node {
                    key,
                    parent: None,
                    record,
                    children: Vec::new(),
                    load_state: LoadState::Unloaded,
                    expanded: false,
                    depth: 0,
                },
            );
            created.push(key);
        }

        let mut kept = Vec::new();
        for key in created {
            let parent_id = self.node_ref(key)?.record.parent_id.clone();
            let parent = match parent_id {
                Some(pid) => match self.by_id.get(&pid).copied().filter(|&k| k != key) {
                    Some(pk) => Some(pk),
                    None => {
                        if self.discard_parentless {
                            tracing::debug!(parent_id = %pid, "dropping parentless record");
                            self.forget(key);
                            None
                        } else {
                            Some(self.root)
                        }
                    }
                },
                None => Some(self.root),
            };
            let Some(pk) = parent else { continue };
            self.node_mut(pk)?.children.push(Some(key));
            self.node_mut(key)?.parent = Some(pk);
            kept.push(key);
        }

        // cyclic parent links leave nodes unreachable from root; discard them
        let reachable = self.reachable_from_root();
        for &key in &kept {
            if !reachable.contains(&key) {
                tracing::debug!(?key, "discarding node with cyclic parent chain");
                self.forget(key);
            }
        }
        kept.retain(|k| reachable.contains(k));

        // a non-incremental response is the complete tree
        let mut stack = vec![(self.root, 0usize)];
        while let Some((key, depth)) = stack.pop() {
            if let Some(node) = self.arena.get_mut(&key) {
                node.depth = depth;
                node.load_state = LoadState::FullyLoaded;
                stack.extend(node.loaded_children().map(|c| (c, depth + 1)));
            }
        }
        Ok(kept)
    }

    // ── Structural edits ─────────────────────────────────────────────────────

    /// Drop cached children and reset the folder to Unloaded. Expansion
    /// state is untouched.
    pub fn invalidate(&mut self, key: NodeKey) -> Result<()> {
        let children: Vec<NodeKey> = self.node_ref(key)?.loaded_children().collect();
        for child in children {
            self.drop_subtree(child);
        }
        let node = self.node_mut(key)?;
        node.children.clear();
        node.load_state = LoadState::Unloaded;
        Ok(())
    }

    /// Structurally remove a node and its subtree: the parent's child list
    /// shrinks and any declared total is decremented. Never fetches.
    pub fn remove(&mut self, key: NodeKey) -> Result<()> {
        if key == self.root {
            return Err(TreeError::DanglingReference("cannot remove the root".into()));
        }
        self.node_ref(key)?;
        self.detach_slot(key)?;
        self.drop_subtree(key);
        Ok(())
    }

    /// Insert a record as a child at `index` (clamped to the loaded list),
    /// bumping any declared total. Never fetches.
    pub fn insert(&mut self, record: Record, parent: NodeKey, index: usize) -> Result<NodeKey> {
        if let Some(id) = record.id.as_ref() {
            if let Some(&stale) = self.by_id.get(id).filter(|&&k| k != self.root) {
                self.detach_slot(stale)?;
                self.drop_subtree(stale);
            }
        }
        let record = self.normalize(record);
        let depth = self.node_ref(parent)?.depth + 1;
        let key = self.alloc_key();
        if let Some(id) = record.id.clone() {
            self.by_id.insert(id, key);
        }
        self.arena.insert(
            key,
            Node {
                key,
                parent: Some(parent),
                record,
                children: Vec::new(),
                load_state: LoadState::Unloaded,
                expanded: false,
                depth,
            },
        );
        let p = self.node_mut(parent)?;
        let at = index.min(p.children.len());
        p.children.insert(at, Some(key));
        p.record.is_folder = Some(true);
        if let LoadState::PartiallyLoaded { child_count } = p.load_state {
            p.load_state = LoadState::PartiallyLoaded {
                child_count: child_count + 1,
            };
        }
        Ok(key)
    }

    /// Re-parent a node (with its subtree) under `new_parent` at `index`.
    pub fn move_node(&mut self, key: NodeKey, new_parent: NodeKey, index: usize) -> Result<()> {
        self.node_ref(new_parent)?;
        if key == self.root {
            return Err(TreeError::DanglingReference("cannot move the root".into()));
        }
        if self.subtree_keys(key).contains(&new_parent) {
            return Err(TreeError::DanglingReference(
                "cannot move a node under its own subtree".into(),
            ));
        }
        self.detach_slot(key)?;
        let p = self.node_mut(new_parent)?;
        let at = index.min(p.children.len());
        p.children.insert(at, Some(key));
        p.record.is_folder = Some(true);
        if let LoadState::PartiallyLoaded { child_count } = p.load_state {
            p.load_state = LoadState::PartiallyLoaded {
                child_count: child_count + 1,
            };
        }
        let new_depth = self.node_ref(new_parent)?.depth + 1;
        self.node_mut(key)?.parent = Some(new_parent);
        self.recompute_depths(key, new_depth);
        Ok(())
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    /// Structural position of a node: child indices from root down.
    pub fn path_to(&self, key: NodeKey) -> Option<Vec<usize>> {
        let mut path = Vec::new();
        let mut cur = key;
        while cur != self.root {
            let node = self.node(cur)?;
            let pk = node.parent?;
            let pos = self
                .node(pk)?
                .children
                .iter()
                .position(|s| *s == Some(cur))?;
            path.push(pos);
            cur = pk;
        }
        path.reverse();
        Some(path)
    }

    pub fn resolve_path(&self, path: &[usize]) -> Option<NodeKey> {
        let mut cur = self.root;
        for &i in path {
            cur = self.node(cur)?.children.get(i).copied().flatten()?;
        }
        Some(cur)
    }

    /// Keys of a node and all its cached descendants.
    pub fn subtree_keys(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            if let Some(node) = self.node(k) {
                out.push(k);
                stack.extend(node.loaded_children());
            }
        }
        out
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Remove the node's slot from its parent's child list, adjusting any
    /// declared total. The node itself stays in the arena.
    fn detach_slot(&mut self, key: NodeKey) -> Result<()> {
        let parent = self.node_ref(key)?.parent;
        let Some(pk) = parent else { return Ok(()) };
        let Some(p) = self.arena.get_mut(&pk) else {
            return Ok(());
        };
        if let Some(pos) = p.children.iter().position(|s| *s == Some(key)) {
            p.children.remove(pos);
            if let LoadState::PartiallyLoaded { child_count } = p.load_state {
                let remaining = child_count.saturating_sub(1);
                p.load_state = if p.children.len() == remaining
                    && p.children.iter().all(|s| s.is_some())
                {
                    LoadState::FullyLoaded
                } else {
                    LoadState::PartiallyLoaded {
                        child_count: remaining,
                    }
                };
            }
        }
        Ok(())
    }

    /// Remove a node and its descendants from the arena and id index. Does
    /// not touch the parent's child list.
    fn drop_subtree(&mut self, key: NodeKey) {
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            if let Some(node) = self.arena.remove(&k) {
                stack.extend(node.loaded_children());
                if let Some(id) = node.record.id.as_ref() {
                    if self.by_id.get(id) == Some(&k) {
                        self.by_id.remove(id);
                    }
                }
            }
        }
    }

    /// Remove a single unlinked node from the arena and id index.
    fn forget(&mut self, key: NodeKey) {
        if let Some(node) = self.arena.remove(&key) {
            if let Some(id) = node.record.id.as_ref() {
                if self.by_id.get(id) == Some(&key) {
                    self.by_id.remove(id);
                }
            }
        }
    }

    fn reachable_from_root(&self) -> HashSet<NodeKey> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(k) = stack.pop() {
            if !seen.insert(k) {
                continue;
            }
            if let Some(node) = self.node(k) {
                stack.extend(node.loaded_children());
            }
        }
        seen
    }

    fn recompute_depths(&mut self, key: NodeKey, depth: usize) {
        let mut stack = vec![(key, depth)];
        while let Some((k, d)) = stack.pop() {
            if let Some(node) = self.arena.get_mut(&k) {
                node.depth = d;
                stack.extend(node.loaded_children().map(|c| (c, d + 1)));
            }
        }
    }
}
