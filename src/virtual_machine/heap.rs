//! Root tracking for heap-escaped locals.
//!
//! A local whose address is taken lives in a heap item. The tracker keeps one
//! node per such item, rooted while at least one stored pointer holds the
//! item as its base. Each node has at most one outgoing edge (the heap item
//! it points at), so marking follows chains instead of walking a graph.
//! Sweeping returns the nodes reached neither from a root nor from the extra
//! roots the caller scanned, and the machine releases their cost.

use crate::virtual_machine::values::HeapItemValue;
use std::collections::BTreeMap;
use std::rc::Rc;

pub type NodeId = u64;

#[derive(Clone, Debug)]
pub struct HeapNode {
    pub item: Rc<HeapItemValue>,
    pub marked: bool,
    /// The single heap item this one points at.
    pub edge: Option<NodeId>,
    /// Name of the variable holding the root; empty until claimed.
    pub path: String,
    /// Bytes released when the node is dropped.
    pub size: i64,
    /// Stored pointers holding the item as their base.
    pub pointers: usize,
    /// Never released, e.g. a package variable outliving every block.
    pub pinned: bool,
    /// Allocator collection count when the node was tracked.
    pub epoch: u64,
}

#[derive(Debug, Default)]
pub struct HeapTracker {
    nodes: BTreeMap<NodeId, HeapNode>,
    roots: Vec<NodeId>,
    next_id: NodeId,
}

impl HeapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `item` as a non-root node.
    pub fn track(&mut self, item: Rc<HeapItemValue>, size: i64, epoch: u64) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            HeapNode {
                item,
                marked: false,
                edge: None,
                path: String::new(),
                size,
                pointers: 0,
                pinned: false,
                epoch,
            },
        );
        id
    }

    pub fn add_root(&mut self, id: NodeId) {
        if self.nodes.contains_key(&id) && !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn remove_root(&mut self, id: NodeId) {
        self.roots.retain(|&r| r != id);
    }

    /// Keeps `id` rooted for good.
    pub fn pin(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.pinned = true;
            self.add_root(id);
        }
    }

    /// Counts one more stored pointer to `id` and roots it.
    pub fn retain(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.pointers += 1;
        self.add_root(id);
    }

    /// Names an unclaimed root once the variable it binds to is known.
    pub fn claim(&mut self, id: NodeId, path: &str) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.path.is_empty() => {
                node.path = path.to_string();
                true
            }
            _ => false,
        }
    }

    /// Drops one stored pointer; the last one unroots an unpinned node.
    pub fn release_pointer(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.pointers = node.pointers.saturating_sub(1);
        if node.pointers == 0 && !node.pinned {
            self.remove_root(id);
        }
    }

    /// Points `from` at `to`, replacing any previous edge.
    pub fn link(&mut self, from: NodeId, to: NodeId) {
        if !self.nodes.contains_key(&to) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.edge = Some(to);
        }
    }

    pub fn unlink(&mut self, from: NodeId) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.edge = None;
        }
    }

    pub fn find_by_item(&self, item: &Rc<HeapItemValue>) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| Rc::ptr_eq(&n.item, item))
            .map(|(&id, _)| id)
    }

    /// Node claimed by the variable `path`. For inspection only; the machine
    /// never looks roots up by name.
    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.path == path)
            .map(|(&id, _)| id)
    }

    pub fn node(&self, id: NodeId) -> Option<&HeapNode> {
        self.nodes.get(&id)
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.roots.contains(&id)
    }

    /// Current roots in rooting order. For inspection only.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Marks every chain reachable from a root or from `extra`, then removes
    /// and returns the unmarked non-root nodes. Marks are cleared for the
    /// next pass.
    pub fn mark_and_sweep(&mut self, extra: &[NodeId]) -> Vec<HeapNode> {
        for &root in self.roots.iter().chain(extra) {
            let mut next = Some(root);
            while let Some(id) = next {
                let Some(node) = self.nodes.get_mut(&id) else {
                    break;
                };
                if node.marked {
                    break;
                }
                node.marked = true;
                next = node.edge;
            }
        }

        let dropped: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, n)| !n.marked && !self.roots.contains(*id))
            .map(|(&id, _)| id)
            .collect();
        let mut swept = Vec::with_capacity(dropped.len());
        for id in dropped {
            if let Some(node) = self.nodes.remove(&id) {
                swept.push(node);
            }
        }
        for node in self.nodes.values_mut() {
            node.marked = false;
        }
        swept
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::values::TypedValue;

    fn item() -> Rc<HeapItemValue> {
        Rc::new(HeapItemValue::new(TypedValue::int(0)))
    }

    #[test]
    fn sweep_drops_only_unreachable_nodes() {
        let mut t = HeapTracker::new();
        let r = t.track(item(), 1, 0);
        let c1 = t.track(item(), 2, 0);
        let c2 = t.track(item(), 3, 0);
        t.add_root(r);
        t.link(r, c1);

        let dropped = t.mark_and_sweep(&[]);
        let sizes: Vec<i64> = dropped.iter().map(|n| n.size).collect();
        assert_eq!(sizes, vec![3]);
        assert!(t.node(c2).is_none());
        assert!(t.node(r).is_some());
        assert!(t.node(c1).is_some());
        assert!(!t.node(c1).unwrap().marked);
    }

    #[test]
    fn cycle_with_live_root_drops_nothing() {
        let mut t = HeapTracker::new();
        let a = t.track(item(), 10, 0);
        let b = t.track(item(), 10, 0);
        t.link(a, b);
        t.link(b, a);
        t.add_root(a);
        assert!(t.mark_and_sweep(&[]).is_empty());
        assert_eq!(t.len(), 2);
        // Marks were cleared, so a second pass agrees.
        assert!(t.mark_and_sweep(&[]).is_empty());
    }

    #[test]
    fn unrooted_cycle_is_dropped() {
        let mut t = HeapTracker::new();
        let a = t.track(item(), 10, 0);
        let b = t.track(item(), 10, 0);
        t.link(a, b);
        t.link(b, a);
        assert_eq!(t.mark_and_sweep(&[]).len(), 2);
        assert!(t.is_empty());
    }

    #[test]
    fn roots_are_claimed_once() {
        let mut t = HeapTracker::new();
        let shared = item();
        let id = t.track(shared.clone(), 72, 0);
        t.retain(id);
        assert_eq!(t.node(id).unwrap().path, "");
        assert!(t.claim(id, "p"));
        assert!(!t.claim(id, "q"));
        assert_eq!(t.find_by_path("p"), Some(id));
        assert_eq!(t.find_by_item(&shared), Some(id));
        assert_eq!(t.roots(), &[id]);
    }

    #[test]
    fn last_pointer_release_unroots() {
        let mut t = HeapTracker::new();
        let id = t.track(item(), 72, 3);
        t.retain(id);
        t.retain(id);
        assert_eq!(t.node(id).unwrap().pointers, 2);

        t.release_pointer(id);
        assert!(t.is_root(id));
        assert!(t.mark_and_sweep(&[]).is_empty());

        t.release_pointer(id);
        assert!(!t.is_root(id));
        let dropped = t.mark_and_sweep(&[]);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].epoch, 3);
    }

    #[test]
    fn pinned_node_outlives_its_pointers() {
        let mut t = HeapTracker::new();
        let id = t.track(item(), 72, 0);
        t.pin(id);
        t.retain(id);
        t.release_pointer(id);
        assert!(t.is_root(id));
        assert!(t.mark_and_sweep(&[]).is_empty());
    }

    #[test]
    fn extra_roots_protect_their_chains() {
        let mut t = HeapTracker::new();
        let a = t.track(item(), 1, 0);
        let b = t.track(item(), 2, 0);
        let c = t.track(item(), 4, 0);
        t.link(a, b);
        assert!(t.mark_and_sweep(&[a]).iter().map(|n| n.size).eq([4]));
        assert_eq!(t.len(), 2);

        t.unlink(a);
        let dropped = t.mark_and_sweep(&[a]);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].size, 2);
        assert!(t.node(c).is_none());
    }

    #[test]
    fn remove_root_exposes_chain() {
        let mut t = HeapTracker::new();
        let r = t.track(item(), 1, 0);
        let c = t.track(item(), 2, 0);
        t.add_root(r);
        t.link(r, c);
        t.remove_root(r);
        let mut sizes: Vec<i64> = t.mark_and_sweep(&[]).iter().map(|n| n.size).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }
}
