//! # Expression-DAG node
//!
//! A [`Node`] records one scalar value in the expression graph: its
//! current value, its accumulated gradient, and (for derived nodes)
//! the operation and operands that produced it. Nodes are shared
//! (`x*x` holds two references to the same node) and structurally
//! immutable after construction; only the `value` and `grad` cells
//! mutate across passes.
//!
//! The value and gradient slots are `Cell<f32>` so that both the
//! interpreter and JIT-compiled code can address the same float cell:
//! [`Cell::as_ptr`] yields the stable heap address that the code
//! generator bakes into the emitted C.

use crate::op::OpKind;
use rustc_hash::FxHashSet;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// An operation application: the tag plus the ordered operand nodes.
pub(crate) struct Operation {
    pub kind: OpKind,
    pub parents: Vec<Rc<Node>>,
}

/// One scalar value in the expression graph.
pub(crate) struct Node {
    pub value: Cell<f32>,
    pub grad: Cell<f32>,
    /// `None` for a leaf, the producing operation otherwise.
    pub op: Option<Operation>,
    /// Literal leaf whose value may be inlined into generated code.
    pub constant: bool,
    /// Backward propagation stops at nodes without this flag.
    pub requires_grad: bool,
    /// Pretty-print label.
    pub name: RefCell<Option<String>>,
}

/// Distinct-node statistics for an expression, as returned by
/// [`Scalar::node_counts`](crate::Scalar::node_counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCounts {
    pub total: usize,
    pub constants: usize,
    pub requires_grad: usize,
}

impl Node {
    pub(crate) fn leaf(value: f32, constant: bool, requires_grad: bool) -> Rc<Node> {
        debug_assert!(!(constant && requires_grad));
        Rc::new(Node {
            value: Cell::new(value),
            grad: Cell::new(0.0),
            op: None,
            constant,
            requires_grad,
            name: RefCell::new(None),
        })
    }

    /// A derived node. The value is computed eagerly from the operands'
    /// current values; `requires_grad` is the OR of the operands'.
    pub(crate) fn from_op(kind: OpKind, parents: Vec<Rc<Node>>) -> Rc<Node> {
        debug_assert_eq!(kind.arity(), parents.len());
        let requires_grad = parents.iter().any(|p| p.requires_grad);
        let value = {
            let xs = operand_values(&parents);
            kind.forward(&xs[..parents.len()])
        };
        Rc::new(Node {
            value: Cell::new(value),
            grad: Cell::new(0.0),
            op: Some(Operation { kind, parents }),
            constant: false,
            requires_grad,
            name: RefCell::new(None),
        })
    }

    /// Recompute this node's value from the operands' current values,
    /// post-order. Leaves stop the recursion.
    pub(crate) fn forward(&self) {
        if let Some(op) = &self.op {
            for p in &op.parents {
                p.forward();
            }
            let xs = operand_values(&op.parents);
            self.value.set(op.kind.forward(&xs[..op.parents.len()]));
        }
    }

    /// Accumulate `gradient` into this node and propagate it to every
    /// operand, weighted by the operation's partial derivative at the
    /// operands' current values.
    ///
    /// The reverse pass visits every *edge* of the DAG: a node reached
    /// through `k` paths is incremented `k` times, which by linearity
    /// yields the total derivative. No memoisation.
    pub(crate) fn backward(&self, gradient: f32) {
        if !self.requires_grad {
            return;
        }
        self.grad.set(self.grad.get() + gradient);
        if let Some(op) = &self.op {
            let xs = operand_values(&op.parents);
            let y = self.value.get();
            for (i, p) in op.parents.iter().enumerate() {
                p.backward(op.kind.partial(i, &xs[..op.parents.len()], y) * gradient);
            }
        }
    }

    /// Count distinct reachable nodes and their flag tallies.
    pub(crate) fn counts(self: &Rc<Node>) -> NodeCounts {
        fn walk(node: &Rc<Node>, seen: &mut FxHashSet<usize>, acc: &mut NodeCounts) {
            if !seen.insert(Rc::as_ptr(node) as usize) {
                return;
            }
            acc.total += 1;
            if node.constant {
                acc.constants += 1;
            }
            if node.requires_grad {
                acc.requires_grad += 1;
            }
            if let Some(op) = &node.op {
                for p in &op.parents {
                    walk(p, seen, acc);
                }
            }
        }
        let mut acc = NodeCounts::default();
        walk(self, &mut FxHashSet::default(), &mut acc);
        acc
    }

    fn precedence(&self) -> i32 {
        match &self.op {
            Some(op) => op.kind.precedence(),
            None => i32::MAX,
        }
    }

    /// Human-readable infix form. A child is bracketed when its
    /// precedence is less than or equal to its parent's; `sqrt` and
    /// `Exp` never bracket their single operand. Leaves print their
    /// name if set, else their value.
    pub(crate) fn expr(&self) -> String {
        let Some(op) = &self.op else {
            return match &*self.name.borrow() {
                Some(name) => name.clone(),
                None => format!("{}", self.value.get()),
            };
        };
        if matches!(op.kind, OpKind::Sqrt | OpKind::Exp) {
            return op.kind.print(&op.parents[0].expr(), "");
        }
        let me = self.precedence();
        let mut l = op.parents[0].expr();
        if op.parents[0].precedence() <= me {
            l = format!("({l})");
        }
        let r = if op.parents.len() > 1 {
            let mut r = op.parents[1].expr();
            if op.parents[1].precedence() <= me {
                r = format!("({r})");
            }
            r
        } else {
            String::new()
        };
        op.kind.print(&l, &r)
    }
}

/// Operand values packed into a fixed buffer; slice to the arity.
fn operand_values(parents: &[Rc<Node>]) -> [f32; 2] {
    let mut xs = [0.0f32; 2];
    for (x, p) in xs.iter_mut().zip(parents) {
        *x = p.value.get();
    }
    xs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_flags() {
        let c = Node::leaf(3.0, true, false);
        assert!(c.constant && !c.requires_grad && c.op.is_none());
        let v = Node::leaf(3.0, false, true);
        assert!(!v.constant && v.requires_grad);
    }

    #[test]
    fn derived_node_ors_requires_grad() {
        let a = Node::leaf(2.0, false, true);
        let b = Node::leaf(5.0, true, false);
        let sum = Node::from_op(OpKind::Add, vec![a.clone(), b.clone()]);
        assert!(sum.requires_grad);
        assert!(!sum.constant);
        assert_eq!(sum.value.get(), 7.0);

        let prod = Node::from_op(OpKind::Mul, vec![b.clone(), b]);
        assert!(!prod.requires_grad);
    }

    #[test]
    fn counts_deduplicate_shared_nodes() {
        let a = Node::leaf(2.0, false, true);
        let sq = Node::from_op(OpKind::Mul, vec![a.clone(), a.clone()]);
        let counts = sq.counts();
        assert_eq!(
            counts,
            NodeCounts {
                total: 2,
                constants: 0,
                requires_grad: 2
            }
        );
    }

    #[test]
    fn backward_accumulates_per_edge() {
        let a = Node::leaf(3.0, false, true);
        let doubled = Node::from_op(OpKind::Add, vec![a.clone(), a.clone()]);
        doubled.backward(1.0);
        assert_eq!(a.grad.get(), 2.0);
    }
}
