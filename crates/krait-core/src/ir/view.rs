//! Read-only views over a sealed translation unit
//!
//! `IrListView` borrows the builder's arenas; `IrListCopy` deep-copies
//! them so a translation can outlive the builder that produced it (the
//! builder is rewound and reused per unit).

use super::node::{NodeId, OrderedNode};
use super::ops::Op;

/// Borrowed view over the node and op arenas of one translation unit.
#[derive(Clone, Copy)]
pub struct IrListView<'a> {
    nodes: &'a [OrderedNode],
    ops: &'a [Op],
    blocks: &'a [NodeId],
    head: NodeId,
}

impl<'a> IrListView<'a> {
    pub fn new(
        nodes: &'a [OrderedNode],
        ops: &'a [Op],
        blocks: &'a [NodeId],
        head: NodeId,
    ) -> Self {
        IrListView {
            nodes,
            ops,
            blocks,
            head,
        }
    }

    /// Random access by node id.
    pub fn node(&self, id: NodeId) -> &'a OrderedNode {
        &self.nodes[id.0 as usize]
    }

    /// The payload a node currently resolves to.
    pub fn op(&self, id: NodeId) -> &'a Op {
        &self.ops[self.node(id).op.0 as usize]
    }

    /// Code blocks in emission order.
    pub fn code_blocks(&self) -> &'a [NodeId] {
        self.blocks
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Iterate node ids in emission order, following the intrusive links.
    pub fn iter(&self) -> OrderIter<'a> {
        OrderIter {
            nodes: self.nodes,
            cursor: self.head,
        }
    }
}

/// Emission-order iterator over node ids.
pub struct OrderIter<'a> {
    nodes: &'a [OrderedNode],
    cursor: NodeId,
}

impl<'a> Iterator for OrderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if !self.cursor.is_valid() {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.nodes[id.0 as usize].next;
        Some(id)
    }
}

/// Owning deep copy of a translation unit, produced for caching.
pub struct IrListCopy {
    nodes: Vec<OrderedNode>,
    ops: Vec<Op>,
    blocks: Vec<NodeId>,
    head: NodeId,
}

impl IrListCopy {
    pub fn from_view(view: &IrListView<'_>) -> Self {
        IrListCopy {
            nodes: view.nodes.to_vec(),
            ops: view.ops.to_vec(),
            blocks: view.blocks.to_vec(),
            head: view.head,
        }
    }

    /// Borrow the copy as a view.
    pub fn view(&self) -> IrListView<'_> {
        IrListView {
            nodes: &self.nodes,
            ops: &self.ops,
            blocks: &self.blocks,
            head: self.head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ops::{OpId, OpKind};

    fn linked_nodes() -> (Vec<OrderedNode>, Vec<Op>) {
        // Three nodes in order 0 -> 1 -> 2.
        let mut nodes = vec![
            OrderedNode::new(OpId(0)),
            OrderedNode::new(OpId(1)),
            OrderedNode::new(OpId(2)),
        ];
        nodes[0].next = NodeId(1);
        nodes[1].prev = NodeId(0);
        nodes[1].next = NodeId(2);
        nodes[2].prev = NodeId(1);
        let ops = vec![
            Op::new(OpKind::Constant { value: 1 }, 8, 1, true, &[]),
            Op::new(OpKind::Constant { value: 2 }, 8, 1, true, &[]),
            Op::new(OpKind::Add, 8, 1, true, &[NodeId(0), NodeId(1)]),
        ];
        (nodes, ops)
    }

    #[test]
    fn test_iteration_follows_links() {
        let (nodes, ops) = linked_nodes();
        let blocks: Vec<NodeId> = vec![];
        let view = IrListView::new(&nodes, &ops, &blocks, NodeId(0));
        let order: Vec<u32> = view.iter().map(|n| n.0).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_random_access_resolves_payload() {
        let (nodes, ops) = linked_nodes();
        let blocks: Vec<NodeId> = vec![];
        let view = IrListView::new(&nodes, &ops, &blocks, NodeId(0));
        assert!(matches!(view.op(NodeId(2)).kind, OpKind::Add));
        assert_eq!(view.op(NodeId(2)).args(), &[NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_copy_is_independent() {
        let (nodes, ops) = linked_nodes();
        let blocks: Vec<NodeId> = vec![];
        let copy = {
            let view = IrListView::new(&nodes, &ops, &blocks, NodeId(0));
            IrListCopy::from_view(&view)
        };
        drop(nodes);
        drop(ops);
        let view = copy.view();
        assert_eq!(view.node_count(), 3);
        assert_eq!(view.iter().count(), 3);
    }
}
