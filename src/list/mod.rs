//! Index-based intrusive rings
//!
//! Every queue in the runtime (the run queue, semaphore wait queues, mailbox
//! waiter queues) is a circular doubly-linked ring threaded through one
//! [`LinkArena`]. Nodes and sentinel heads live side by side in the arena and
//! are addressed by [`NodeId`], so a node can be unlinked in O(1) without
//! knowing which ring currently holds it.
//!
//! A node whose `next` points to itself is not linked; a head whose `next`
//! points to itself is an empty ring.

use crate::error::{Error, Result};

/// Index of a node (or sentinel head) inside a [`LinkArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy)]
struct Link {
    next: usize,
    prev: usize,
}

/// Fixed-size arena of ring links.
#[derive(Debug, Clone)]
pub struct LinkArena {
    links: Vec<Link>,
}

impl LinkArena {
    /// Create an arena of `len` self-linked nodes.
    pub fn new(len: usize) -> Result<Self> {
        let mut links = Vec::new();
        links
            .try_reserve_exact(len)
            .map_err(|e| Error::out_of_memory(format!("link arena of {} nodes: {}", len, e)))?;
        links.extend((0..len).map(|i| Link { next: i, prev: i }));
        Ok(Self { links })
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` if the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Reset `node` to the self-linked state without touching its neighbours.
    pub fn reset(&mut self, node: NodeId) {
        self.links[node.0] = Link {
            next: node.0,
            prev: node.0,
        };
    }

    /// Returns `true` if `node` is part of some ring.
    pub fn is_linked(&self, node: NodeId) -> bool {
        self.links[node.0].next != node.0
    }

    /// Returns `true` if the ring headed by `head` has no members.
    pub fn is_ring_empty(&self, head: NodeId) -> bool {
        self.links[head.0].next == head.0
    }

    /// Insert `node` right after `head`.
    pub fn add_front(&mut self, head: NodeId, node: NodeId) {
        debug_assert!(!self.is_linked(node), "node {} already linked", node.0);
        let first = self.links[head.0].next;
        self.links[first].prev = node.0;
        self.links[node.0] = Link {
            next: first,
            prev: head.0,
        };
        self.links[head.0].next = node.0;
    }

    /// Insert `node` right before `head`, i.e. at the ring's tail.
    pub fn add_tail(&mut self, head: NodeId, node: NodeId) {
        debug_assert!(!self.is_linked(node), "node {} already linked", node.0);
        let last = self.links[head.0].prev;
        self.links[last].next = node.0;
        self.links[node.0] = Link {
            next: head.0,
            prev: last,
        };
        self.links[head.0].prev = node.0;
    }

    /// Remove `node` from whatever ring holds it. No-op if it is not linked.
    pub fn unlink(&mut self, node: NodeId) {
        if !self.is_linked(node) {
            return;
        }
        let Link { next, prev } = self.links[node.0];
        self.links[next].prev = prev;
        self.links[prev].next = next;
        self.reset(node);
    }

    /// First member of the ring, if any.
    pub fn front(&self, head: NodeId) -> Option<NodeId> {
        let next = self.links[head.0].next;
        (next != head.0).then_some(NodeId(next))
    }

    /// Last member of the ring, if any.
    pub fn back(&self, head: NodeId) -> Option<NodeId> {
        let prev = self.links[head.0].prev;
        (prev != head.0).then_some(NodeId(prev))
    }

    /// Unlink and return the first member of the ring.
    pub fn pop_front(&mut self, head: NodeId) -> Option<NodeId> {
        let node = self.front(head)?;
        self.unlink(node);
        Some(node)
    }

    /// Iterate over the ring's members from front to back.
    pub fn iter(&self, head: NodeId) -> Iter<'_> {
        Iter {
            arena: self,
            head: head.0,
            cursor: self.links[head.0].next,
        }
    }
}

/// Front-to-back iterator over one ring.
pub struct Iter<'a> {
    arena: &'a LinkArena,
    head: usize,
    cursor: usize,
}

impl Iterator for Iter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.cursor == self.head {
            return None;
        }
        let node = self.cursor;
        self.cursor = self.arena.links[node].next;
        Some(NodeId(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: NodeId = NodeId(0);

    fn members(arena: &LinkArena, head: NodeId) -> Vec<usize> {
        arena.iter(head).map(|n| n.0).collect()
    }

    #[test]
    fn test_oversized_arena_is_out_of_memory() {
        let err = LinkArena::new(usize::MAX / 4).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::OutOfMemory);
    }

    #[test]
    fn test_new_nodes_are_unlinked() {
        let arena = LinkArena::new(4).unwrap();
        assert_eq!(arena.len(), 4);
        for i in 0..4 {
            assert!(!arena.is_linked(NodeId(i)));
        }
        assert!(arena.is_ring_empty(HEAD));
        assert_eq!(arena.front(HEAD), None);
        assert_eq!(arena.back(HEAD), None);
    }

    #[test]
    fn test_add_tail_is_fifo() {
        let mut arena = LinkArena::new(5).unwrap();
        for i in 1..5 {
            arena.add_tail(HEAD, NodeId(i));
        }
        assert_eq!(members(&arena, HEAD), vec![1, 2, 3, 4]);
        assert_eq!(arena.front(HEAD), Some(NodeId(1)));
        assert_eq!(arena.back(HEAD), Some(NodeId(4)));
    }

    #[test]
    fn test_add_front_is_lifo() {
        let mut arena = LinkArena::new(4).unwrap();
        for i in 1..4 {
            arena.add_front(HEAD, NodeId(i));
        }
        assert_eq!(members(&arena, HEAD), vec![3, 2, 1]);
    }

    #[test]
    fn test_unlink_middle_and_ends() {
        let mut arena = LinkArena::new(5).unwrap();
        for i in 1..5 {
            arena.add_tail(HEAD, NodeId(i));
        }
        arena.unlink(NodeId(2));
        assert!(!arena.is_linked(NodeId(2)));
        assert_eq!(members(&arena, HEAD), vec![1, 3, 4]);
        arena.unlink(NodeId(1));
        arena.unlink(NodeId(4));
        assert_eq!(members(&arena, HEAD), vec![3]);
        arena.unlink(NodeId(3));
        assert!(arena.is_ring_empty(HEAD));
    }

    #[test]
    fn test_unlink_unlinked_is_noop() {
        let mut arena = LinkArena::new(3).unwrap();
        arena.add_tail(HEAD, NodeId(1));
        arena.unlink(NodeId(2));
        assert_eq!(members(&arena, HEAD), vec![1]);
    }

    #[test]
    fn test_two_rings_share_one_arena() {
        // Heads 0 and 1, members 2..6.
        let mut arena = LinkArena::new(6).unwrap();
        let other = NodeId(1);
        arena.add_tail(HEAD, NodeId(2));
        arena.add_tail(other, NodeId(3));
        arena.add_tail(HEAD, NodeId(4));
        arena.add_tail(other, NodeId(5));

        // Move node 4 across rings without knowing where it was.
        arena.unlink(NodeId(4));
        arena.add_front(other, NodeId(4));

        assert_eq!(members(&arena, HEAD), vec![2]);
        assert_eq!(members(&arena, other), vec![4, 3, 5]);
    }

    #[test]
    fn test_pop_front() {
        let mut arena = LinkArena::new(4).unwrap();
        arena.add_tail(HEAD, NodeId(3));
        arena.add_tail(HEAD, NodeId(1));
        assert_eq!(arena.pop_front(HEAD), Some(NodeId(3)));
        assert_eq!(arena.pop_front(HEAD), Some(NodeId(1)));
        assert_eq!(arena.pop_front(HEAD), None);
    }
}
