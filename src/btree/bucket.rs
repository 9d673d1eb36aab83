//! # Bucket: Node Arena and Tree Algorithms
//!
//! A `Bucket` owns every node materialized by a write transaction and runs
//! the algorithms that reshape the tree: split, spill, and rebalance.
//!
//! ## Materialization
//!
//! Nodes are created lazily by [`Bucket::node`]: the first access to a page
//! deserializes it and caches the node under its page id, so repeated
//! lookups return the same node. A materialized node registers itself with
//! its parent's `children` list; that list exists purely so spill can find
//! the dirty subtree, and it is discarded as spill descends.
//!
//! ## Spill
//!
//! Spill is the commit-time writeback. It descends depth-first in key
//! order, splits any node that outgrew its page, returns stale pages to the
//! freelist, allocates fresh spans, serializes each node, and threads the
//! new page ids into parent branch entries. Splitting the root grows the
//! tree by one level: a fresh parent appears with page id zero and is
//! spilled on the way back out.
//!
//! ## Rebalance
//!
//! Deletions leave nodes marked `unbalanced`. The rebalance pass runs
//! before spill and merges any node that fell below a quarter page or its
//! minimum key count into a sibling, collapsing single-child branch roots
//! on the way. Merging cascades: removing an entry from the parent can
//! leave it underfull in turn.

use eyre::{bail, Result};
use hashbrown::HashMap;
use tracing::trace;

use crate::config::{DEFAULT_FILL_PERCENT, MAX_FILL_PERCENT, MIN_FILL_PERCENT, MIN_KEYS_PER_PAGE};
use crate::storage::Pgid;

use super::bytes::ByteRef;
use super::node::Node;
use super::{NodeId, TxContext, TxStats};

#[derive(Debug)]
pub struct Bucket {
    /// Arena of every node this transaction has touched. Slots are never
    /// reclaimed mid-transaction; orphans are dropped with the bucket.
    nodes: Vec<Node>,
    /// Materialized nodes by the page id they were loaded from.
    node_map: HashMap<Pgid, NodeId>,
    root: Option<NodeId>,
    /// Split threshold as a fraction of the page size, clamped to
    /// [`MIN_FILL_PERCENT`, `MAX_FILL_PERCENT`] when used.
    pub fill_percent: f64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_map: HashMap::new(),
            root: None,
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }

    pub fn node_ref(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    /// The node cached for a page id, if it has been materialized.
    pub fn lookup(&self, pgid: Pgid) -> Option<NodeId> {
        self.node_map.get(&pgid).copied()
    }

    pub(crate) fn alloc_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Materializes the node for a page, or returns the cached one.
    pub fn node(
        &mut self,
        pgid: Pgid,
        parent: Option<NodeId>,
        ctx: &mut impl TxContext,
    ) -> Result<NodeId> {
        if let Some(&id) = self.node_map.get(&pgid) {
            return Ok(id);
        }

        let id = self.alloc_node(Node::default());
        self.nodes[id.0].parent = parent;
        match parent {
            Some(p) => self.nodes[p.0].children.push(id),
            None => self.root = Some(id),
        }

        {
            let page = ctx.page(pgid)?;
            // SAFETY: the page aliases the current mapping generation (or a
            // dirty buffer that outlives the bucket); every mapped range
            // created here is owned via dereference_all before any remap.
            unsafe { self.nodes[id.0].read(page)? };
        }

        self.node_map.insert(pgid, id);
        trace!(pgid, "materialized node");
        Ok(id)
    }

    /// Walks parent links to the top of the subtree containing `id`.
    pub fn root_of(&self, id: NodeId) -> NodeId {
        match self.nodes[id.0].parent {
            Some(p) => self.root_of(p),
            None => id,
        }
    }

    /// Index of `child`'s entry within its parent, located by the child's
    /// load-time key.
    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        let key = self.nodes[child.0].key.as_slice();
        self.nodes[parent.0]
            .inodes
            .partition_point(|inode| inode.key.as_slice() < key)
    }

    /// Materializes the child of a branch node at `index`.
    fn child_at(&mut self, parent: NodeId, index: usize, ctx: &mut impl TxContext) -> Result<NodeId> {
        if self.nodes[parent.0].is_leaf {
            panic!("invalid child_at({}) on a leaf node", index);
        }
        let pgid = self.nodes[parent.0].inodes[index].pgid;
        self.node(pgid, Some(parent), ctx)
    }

    fn next_sibling(&mut self, id: NodeId, ctx: &mut impl TxContext) -> Result<Option<NodeId>> {
        let Some(parent) = self.nodes[id.0].parent else {
            return Ok(None);
        };
        let index = self.child_index(parent, id);
        if index + 1 >= self.nodes[parent.0].num_children() {
            return Ok(None);
        }
        Ok(Some(self.child_at(parent, index + 1, ctx)?))
    }

    fn prev_sibling(&mut self, id: NodeId, ctx: &mut impl TxContext) -> Result<Option<NodeId>> {
        let Some(parent) = self.nodes[id.0].parent else {
            return Ok(None);
        };
        let index = self.child_index(parent, id);
        if index == 0 {
            return Ok(None);
        }
        Ok(Some(self.child_at(parent, index - 1, ctx)?))
    }

    /// Drops `target` from `parent`'s materialized-children list. Entries
    /// are untouched.
    fn remove_child(&mut self, parent: NodeId, target: NodeId) {
        let children = &mut self.nodes[parent.0].children;
        if let Some(pos) = children.iter().position(|&c| c == target) {
            children.remove(pos);
        }
    }

    /// Returns the node's current page to the freelist and clears its id.
    fn free_node(&mut self, id: NodeId, ctx: &mut impl TxContext) -> Result<()> {
        let pgid = self.nodes[id.0].pgid;
        if pgid != 0 {
            ctx.free(pgid)?;
            self.nodes[id.0].pgid = 0;
        }
        Ok(())
    }

    /// Descends from `root` to the leaf that owns `key`, materializing the
    /// path.
    pub fn node_for_key(
        &mut self,
        root: NodeId,
        key: &[u8],
        ctx: &mut impl TxContext,
    ) -> Result<NodeId> {
        let mut id = root;
        loop {
            if self.nodes[id.0].is_leaf {
                return Ok(id);
            }

            let node = &self.nodes[id.0];
            if node.inodes.is_empty() {
                bail!("branch page {} has no entries", node.pgid);
            }
            // Last entry whose key is at or below the target.
            let index = node.inodes.partition_point(|i| i.key.as_slice() <= key);
            let index = index.saturating_sub(1);

            id = self.child_at(id, index, ctx)?;
        }
    }

    /// Splits a node into two when it holds more than twice the minimum
    /// keys and outgrew the page, creating a parent if the node had none.
    /// Returns the new right-hand sibling.
    fn split_two(&mut self, id: NodeId, page_size: usize, stats: &mut TxStats) -> Option<NodeId> {
        {
            let node = &self.nodes[id.0];
            if node.inodes.len() <= MIN_KEYS_PER_PAGE * 2 || node.size_less_than(page_size) {
                return None;
            }
        }

        let fill = self.fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let (split_index, _) = self.nodes[id.0].split_index(threshold);

        let parent = match self.nodes[id.0].parent {
            Some(p) => p,
            None => {
                let p = self.alloc_node(Node::new(false));
                self.nodes[p.0].children.push(id);
                self.nodes[id.0].parent = Some(p);
                if self.root == Some(id) {
                    self.root = Some(p);
                }
                p
            }
        };

        let is_leaf = self.nodes[id.0].is_leaf;
        let next = self.alloc_node(Node::new(is_leaf));
        self.nodes[next.0].parent = Some(parent);
        self.nodes[parent.0].children.push(next);

        let tail = self.nodes[id.0].inodes.split_off(split_index);
        self.nodes[next.0].inodes = tail;

        stats.split += 1;
        Some(next)
    }

    /// Splits a node into as many page-sized pieces as needed. The first
    /// returned node is always the input node.
    fn split(&mut self, id: NodeId, page_size: usize, stats: &mut TxStats) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut current = id;
        loop {
            nodes.push(current);
            match self.split_two(current, page_size, stats) {
                Some(next) => current = next,
                None => break,
            }
        }
        nodes
    }

    /// Writes the subtree rooted at `id` to freshly allocated pages,
    /// splitting oversized nodes and threading new page ids into parents.
    pub fn spill(&mut self, id: NodeId, ctx: &mut impl TxContext, stats: &mut TxStats) -> Result<()> {
        if self.nodes[id.0].spilled {
            return Ok(());
        }

        // Children in key order. A child's spill can append fresh siblings
        // to this list, so iterate against the live list, not a snapshot.
        let mut kids = self.nodes[id.0].children.clone();
        kids.sort_by(|&a, &b| self.nodes[a.0].first_key().cmp(self.nodes[b.0].first_key()));
        self.nodes[id.0].children = kids;

        let mut i = 0;
        loop {
            let Some(&child) = self.nodes[id.0].children.get(i) else {
                break;
            };
            self.spill(child, ctx, stats)?;
            i += 1;
        }

        // The child list only existed for spill tracking.
        self.nodes[id.0].children.clear();

        let page_size = ctx.page_size();
        for nid in self.split(id, page_size, stats) {
            // Stale page back to the freelist before the node gets a new
            // home.
            if self.nodes[nid.0].pgid > 0 {
                ctx.free(self.nodes[nid.0].pgid)?;
                self.nodes[nid.0].pgid = 0;
            }

            let count = self.nodes[nid.0].size().div_ceil(page_size);
            let pgid = ctx.allocate(count)?;

            if pgid >= ctx.high_water() {
                panic!(
                    "pgid ({}) above high water mark ({})",
                    pgid,
                    ctx.high_water()
                );
            }

            self.nodes[nid.0].pgid = pgid;
            {
                let buf = ctx.page_mut(pgid)?;
                self.nodes[nid.0].write(buf)?;
            }
            self.nodes[nid.0].spilled = true;

            if let Some(parent) = self.nodes[nid.0].parent {
                let (old_key, first_key) = {
                    let node = &self.nodes[nid.0];
                    let old = if node.key.is_empty() {
                        node.inodes[0].key.clone()
                    } else {
                        node.key.clone()
                    };
                    (old, node.inodes[0].key.clone())
                };
                self.nodes[parent.0].put(
                    old_key.as_slice(),
                    first_key.clone(),
                    ByteRef::empty(),
                    pgid,
                    0,
                );
                self.nodes[nid.0].key = first_key;
            }

            stats.spill += 1;
        }

        // Splitting the root grew the tree: the fresh parent has no page
        // yet and must be spilled too.
        if let Some(parent) = self.nodes[id.0].parent {
            if self.nodes[parent.0].pgid == 0 {
                self.nodes[id.0].children.clear();
                return self.spill(parent, ctx, stats);
            }
        }

        Ok(())
    }

    /// Merges the node with a sibling when it fell below a quarter page or
    /// its minimum key count. No-op unless a deletion marked the node.
    pub fn rebalance(
        &mut self,
        id: NodeId,
        ctx: &mut impl TxContext,
        stats: &mut TxStats,
    ) -> Result<()> {
        if !self.nodes[id.0].unbalanced {
            return Ok(());
        }
        self.nodes[id.0].unbalanced = false;
        stats.rebalance += 1;

        let threshold = ctx.page_size() / 4;
        {
            let node = &self.nodes[id.0];
            if node.size() > threshold && node.inodes.len() > node.min_keys() {
                return Ok(());
            }
        }

        let Some(parent) = self.nodes[id.0].parent else {
            // A branch root holding a single entry collapses into its only
            // child; a leaf root is always acceptable.
            let collapse = {
                let node = &self.nodes[id.0];
                !node.is_leaf && node.inodes.len() == 1
            };
            if collapse {
                let child_pgid = self.nodes[id.0].inodes[0].pgid;
                let child = self.node(child_pgid, Some(id), ctx)?;

                let (is_leaf, inodes, children) = {
                    let c = &mut self.nodes[child.0];
                    (
                        c.is_leaf,
                        std::mem::take(&mut c.inodes),
                        std::mem::take(&mut c.children),
                    )
                };
                {
                    let node = &mut self.nodes[id.0];
                    node.is_leaf = is_leaf;
                    node.inodes = inodes;
                    node.children = children;
                }

                // The moved entries' materialized children get a new parent.
                let moved: Vec<Pgid> = self.nodes[id.0].inodes.iter().map(|i| i.pgid).collect();
                for pgid in moved {
                    if let Some(&grandchild) = self.node_map.get(&pgid) {
                        self.nodes[grandchild.0].parent = Some(id);
                    }
                }

                self.nodes[child.0].parent = None;
                self.node_map.remove(&child_pgid);
                self.free_node(child, ctx)?;
                trace!(pgid = child_pgid, "collapsed root into child");
            }
            return Ok(());
        };

        // A node left with nothing disappears outright.
        if self.nodes[id.0].num_children() == 0 {
            let key = self.nodes[id.0].key.clone();
            self.nodes[parent.0].del(key.as_slice());
            self.remove_child(parent, id);
            let pgid = self.nodes[id.0].pgid;
            self.node_map.remove(&pgid);
            self.free_node(id, ctx)?;
            return self.rebalance(parent, ctx, stats);
        }

        // Merge with the right sibling when this is the leftmost child,
        // otherwise with the left.
        let use_next_sibling = self.child_index(parent, id) == 0;
        let target = if use_next_sibling {
            self.next_sibling(id, ctx)?
        } else {
            self.prev_sibling(id, ctx)?
        };
        let Some(target) = target else {
            panic!("rebalance: node has no sibling to merge with");
        };

        if use_next_sibling {
            // Absorb the right sibling into this node.
            let moved: Vec<Pgid> = self.nodes[target.0].inodes.iter().map(|i| i.pgid).collect();
            for pgid in moved {
                if let Some(&child) = self.node_map.get(&pgid) {
                    if let Some(cp) = self.nodes[child.0].parent {
                        self.remove_child(cp, child);
                    }
                    self.nodes[child.0].parent = Some(id);
                    self.nodes[id.0].children.push(child);
                }
            }

            let mut inodes = std::mem::take(&mut self.nodes[target.0].inodes);
            self.nodes[id.0].inodes.append(&mut inodes);
            let key = self.nodes[target.0].key.clone();
            self.nodes[parent.0].del(key.as_slice());
            self.remove_child(parent, target);
            let pgid = self.nodes[target.0].pgid;
            self.node_map.remove(&pgid);
            self.free_node(target, ctx)?;
        } else {
            // Push this node's entries into the left sibling and vanish.
            let moved: Vec<Pgid> = self.nodes[id.0].inodes.iter().map(|i| i.pgid).collect();
            for pgid in moved {
                if let Some(&child) = self.node_map.get(&pgid) {
                    if let Some(cp) = self.nodes[child.0].parent {
                        self.remove_child(cp, child);
                    }
                    self.nodes[child.0].parent = Some(target);
                    self.nodes[target.0].children.push(child);
                }
            }

            let mut inodes = std::mem::take(&mut self.nodes[id.0].inodes);
            self.nodes[target.0].inodes.append(&mut inodes);
            let key = self.nodes[id.0].key.clone();
            self.nodes[parent.0].del(key.as_slice());
            self.remove_child(parent, id);
            let pgid = self.nodes[id.0].pgid;
            self.node_map.remove(&pgid);
            self.free_node(id, ctx)?;
        }

        // One entry left the parent either way.
        self.rebalance(parent, ctx, stats)
    }

    /// Rebalances every materialized node, in ascending page-id order so
    /// the pass is deterministic. Nodes absorbed mid-pass are skipped.
    pub fn rebalance_all(&mut self, ctx: &mut impl TxContext, stats: &mut TxStats) -> Result<()> {
        let mut entries: Vec<(Pgid, NodeId)> =
            self.node_map.iter().map(|(&p, &id)| (p, id)).collect();
        entries.sort_unstable_by_key(|&(pgid, _)| pgid);

        for (pgid, id) in entries {
            if self.node_map.get(&pgid) == Some(&id) {
                self.rebalance(id, ctx, stats)?;
            }
        }
        Ok(())
    }

    /// Copies the subtree's byte ranges off the mapping, recursing through
    /// materialized children.
    pub fn dereference(&mut self, id: NodeId, stats: &mut TxStats) {
        self.nodes[id.0].dereference();
        stats.node_deref += 1;

        let children = self.nodes[id.0].children.clone();
        for child in children {
            self.dereference(child, stats);
        }
    }

    /// Detaches every node in the arena from the mapping. Must run before
    /// any remap.
    pub fn dereference_all(&mut self, stats: &mut TxStats) {
        for node in &mut self.nodes {
            node.dereference();
            stats.node_deref += 1;
        }
    }
}
