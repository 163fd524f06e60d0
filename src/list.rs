use alloc::vec::Vec;

use crate::{k_assert, k_panic};
use crate::kpanic::KUnwrap;

//

pub(crate) type NodeIdx = u16;

/// Which list a node is linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListRef
{
    Ready(u8),
    Wait(u16)
}

pub(crate) struct Node<O>
{
    link: Option<NodeIdx>,
    on: Option<ListRef>,
    pub(crate) prio: u8,
    pub(crate) owner: O
}

impl<O> Node<O>
{
    pub(crate) fn on(&self) -> Option<ListRef>
    {
        self.on
    }
}

//

/// Slab of list nodes
///
/// Every node carries a single link, so a node can be a member of at most
/// one list at a time; linking a node that is already on a list is fatal.
pub(crate) struct Nodes<O>
{
    slots: Vec<Option<Node<O>>>,
    free: Vec<NodeIdx>
}

impl<O> Nodes<O>
{
    pub(crate) const fn new() -> Nodes<O>
    {
        Nodes {
            slots: Vec::new(),
            free: Vec::new()
        }
    }

    pub(crate) fn alloc(&mut self, prio: u8, owner: O) -> NodeIdx
    {
        let node = Node {
            link: None,
            on: None,
            prio,
            owner
        };

        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            idx
        }
        else {
            k_assert!(self.slots.len() < NodeIdx::MAX as usize, "out of list nodes");
            self.slots.push(Some(node));
            (self.slots.len() - 1) as NodeIdx
        }
    }

    pub(crate) fn free(&mut self, idx: NodeIdx)
    {
        let node = self.slots[idx as usize].take().k_unwrap();
        k_assert!(node.on.is_none(), "freeing node {} still on {:?}", idx, node.on);
        self.free.push(idx);
    }

    pub(crate) fn get(&self, idx: NodeIdx) -> &Node<O>
    {
        self.slots[idx as usize].as_ref().k_unwrap()
    }

    pub(crate) fn get_mut(&mut self, idx: NodeIdx) -> &mut Node<O>
    {
        self.slots[idx as usize].as_mut().k_unwrap()
    }

    fn link_in(&mut self, idx: NodeIdx, list: ListRef)
    {
        let node = self.get_mut(idx);
        if let Some(other) = node.on {
            k_panic!("node {} inserted on {:?} while on {:?}", idx, list, other);
        }
        node.on = Some(list);
        node.link = None;
    }
}

//

/// Singly linked list of nodes with O(1) append
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Queue
{
    head: Option<NodeIdx>,
    tail: Option<NodeIdx>
}

impl Queue
{
    pub(crate) const fn new() -> Queue
    {
        Queue {
            head: None,
            tail: None
        }
    }

    pub(crate) fn is_empty(&self) -> bool
    {
        self.head.is_none()
    }

    pub(crate) fn push_back<O>(&mut self, nodes: &mut Nodes<O>, idx: NodeIdx, list: ListRef)
    {
        nodes.link_in(idx, list);

        match self.tail {
            Some(tail) => nodes.get_mut(tail).link = Some(idx),
            None => self.head = Some(idx)
        }
        self.tail = Some(idx);
    }

    /// Inserts behind every node of greater or equal priority.
    pub(crate) fn insert_by_prio<O>(&mut self, nodes: &mut Nodes<O>, idx: NodeIdx, list: ListRef)
    {
        nodes.link_in(idx, list);

        let prio = nodes.get(idx).prio;

        let mut prev: Option<NodeIdx> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let node = nodes.get(c);
            if node.prio < prio {
                break;
            }
            prev = Some(c);
            cur = node.link;
        }

        nodes.get_mut(idx).link = cur;
        match prev {
            Some(p) => nodes.get_mut(p).link = Some(idx),
            None => self.head = Some(idx)
        }
        if cur.is_none() {
            self.tail = Some(idx);
        }
    }

    pub(crate) fn pop_front<O>(&mut self, nodes: &mut Nodes<O>) -> Option<NodeIdx>
    {
        let idx = self.head?;
        let node = nodes.get_mut(idx);

        self.head = node.link.take();
        node.on = None;
        if self.head.is_none() {
            self.tail = None;
        }

        Some(idx)
    }

    /// Unlinks `idx` if it is on this list; returns whether it was.
    pub(crate) fn remove<O>(&mut self, nodes: &mut Nodes<O>, idx: NodeIdx) -> bool
    {
        let mut prev: Option<NodeIdx> = None;
        let mut cur = self.head;

        while let Some(c) = cur {
            if c == idx {
                let node = nodes.get_mut(c);
                let next = node.link.take();
                node.on = None;

                match prev {
                    Some(p) => nodes.get_mut(p).link = next,
                    None => self.head = next
                }
                if next.is_none() {
                    self.tail = prev;
                }
                return true;
            }
            prev = cur;
            cur = nodes.get(c).link;
        }

        false
    }

    #[cfg(test)]
    fn iter<'n, O>(&self, nodes: &'n Nodes<O>) -> impl Iterator<Item = NodeIdx> + 'n
    {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let c = cur?;
            cur = nodes.get(c).link;
            Some(c)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L: ListRef = ListRef::Wait(0);

    fn owners(q: &Queue, nodes: &Nodes<u32>) -> Vec<u32> {
        q.iter(nodes).map(|n| nodes.get(n).owner).collect()
    }

    #[test]
    fn test_fifo() {
        let mut nodes = Nodes::new();
        let mut q = Queue::new();
        for i in 0..4 {
            let n = nodes.alloc(5, i);
            q.push_back(&mut nodes, n, ListRef::Ready(5));
        }
        assert_eq!(owners(&q, &nodes), [0, 1, 2, 3]);

        let n = q.pop_front(&mut nodes).unwrap();
        assert_eq!(nodes.get(n).owner, 0);
        assert_eq!(nodes.get(n).on(), None);

        // re-append after pop: round robin
        q.push_back(&mut nodes, n, ListRef::Ready(5));
        assert_eq!(owners(&q, &nodes), [1, 2, 3, 0]);
    }

    #[test]
    fn test_prio_order_stable() {
        let mut nodes = Nodes::new();
        let mut q = Queue::new();
        // (prio, arrival)
        for (i, p) in [3u8, 5, 3, 7, 5, 0].iter().enumerate() {
            let n = nodes.alloc(*p, i as u32);
            q.insert_by_prio(&mut nodes, n, L);
        }
        assert_eq!(owners(&q, &nodes), [3, 1, 4, 0, 2, 5]);

        let mut popped = Vec::new();
        while let Some(n) = q.pop_front(&mut nodes) {
            popped.push(nodes.get(n).prio);
        }
        assert_eq!(popped, [7, 5, 5, 3, 3, 0]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_keeps_tail() {
        let mut nodes = Nodes::new();
        let mut q = Queue::new();
        let a = nodes.alloc(1, 0);
        let b = nodes.alloc(1, 1);
        let c = nodes.alloc(1, 2);
        for n in [a, b, c] {
            q.push_back(&mut nodes, n, L);
        }

        assert!(q.remove(&mut nodes, c));
        assert!(!q.remove(&mut nodes, c));

        // tail moved back to b, appending must still work
        q.push_back(&mut nodes, c, L);
        assert_eq!(owners(&q, &nodes), [0, 1, 2]);

        assert!(q.remove(&mut nodes, a));
        assert!(q.remove(&mut nodes, c));
        assert_eq!(owners(&q, &nodes), [1]);
        assert!(q.remove(&mut nodes, b));
        assert!(q.is_empty());

        nodes.free(a);
        let d = nodes.alloc(2, 9);
        assert_eq!(d, a);
    }

    #[test]
    #[should_panic]
    fn test_double_insert_fatal() {
        let mut nodes = Nodes::new();
        let mut q1 = Queue::new();
        let mut q2 = Queue::new();
        let n = nodes.alloc(1, 0);
        q1.push_back(&mut nodes, n, ListRef::Ready(1));
        q2.insert_by_prio(&mut nodes, n, L);
    }
}
