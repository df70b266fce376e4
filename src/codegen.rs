//! # Straight-line C emission
//!
//! Translates an expression DAG into the bodies of two C functions: a
//! `forward` pass recomputing every node's value and returning the
//! root, and a `backward` pass propagating a seed gradient to every
//! differentiable node.
//!
//! Every node slot is addressed by its *runtime memory address*,
//! rendered as `v(0x…)` where `v` is the loader's float-deref macro.
//! The generated code therefore reads and writes the exact float cells
//! the interpreter uses; there is no separate runtime state. Constant
//! leaves are the exception: they are inlined as exact hex-float
//! literals so the compiled constant equals the in-memory value
//! bit-for-bit.
//!
//! The two passes deduplicate differently. Forward emission visits
//! each node once (a visited set keyed on the node address), so shared
//! subexpressions are assigned a single time. Backward emission must
//! accumulate once per incoming *edge*, so only the declaration of the
//! per-node gradient temporary is deduplicated; the `+=` runs on every
//! visit.

use crate::node::{Node, Operation};
use crate::op::OpKind;
use rustc_hash::FxHashSet;
use std::fmt::Write;
use std::rc::Rc;

/// Body of `float forward(void)`: post-order straight-line
/// assignments ending in `return value;`.
pub(crate) fn forward_body(root: &Rc<Node>) -> String {
    if root.op.is_none() {
        return format!("return {};\n", operand_ref(root));
    }
    let mut out = String::from("float value;\n");
    let mut visited = FxHashSet::default();
    emit_forward(root, &mut out, &mut visited);
    out.push_str("return value;\n");
    out
}

fn emit_forward(node: &Rc<Node>, out: &mut String, visited: &mut FxHashSet<usize>) {
    let Some(op) = &node.op else { return };
    if !visited.insert(Rc::as_ptr(node) as usize) {
        return;
    }
    for p in &op.parents {
        emit_forward(p, out, visited);
    }
    let (l, r) = operand_strings(op);
    let (rhs, tag) = op.kind.emit_forward(&l, &r);
    let _ = writeln!(out, "value = v({:p}) = {}; //{}", node.value.as_ptr(), rhs, tag);
}

/// Body of `void backward(float gradient)`: pre-order accumulation
/// from the root. Recursion stops at nodes without `requires_grad`.
pub(crate) fn backward_body(root: &Rc<Node>) -> String {
    let mut out = String::new();
    let mut declared = FxHashSet::default();
    emit_backward(root, &mut out, &mut declared);
    out
}

fn emit_backward(node: &Rc<Node>, out: &mut String, declared: &mut FxHashSet<usize>) {
    if !node.requires_grad {
        return;
    }
    let _ = writeln!(out, "v({:p}) += gradient;", node.grad.as_ptr());
    let Some(op) = &node.op else { return };

    // One temporary per node address holds the incoming gradient so
    // sibling operands see it after the recursion clobbers `gradient`.
    // A DAG-shared node is emitted once per edge; only the `float`
    // declaration is deduplicated.
    let g = format!("g{:p}", Rc::as_ptr(node));
    if declared.insert(Rc::as_ptr(node) as usize) {
        let _ = writeln!(out, "float {g} = gradient;");
    } else {
        let _ = writeln!(out, "{g} = gradient;");
    }

    let (l, r) = operand_strings(op);
    let y = format!("v({:p})", node.value.as_ptr());
    for (i, p) in op.parents.iter().enumerate() {
        if !p.requires_grad {
            continue;
        }
        let (expr, tag) = op.kind.emit_backward(i, &g, &l, &r, &y);
        let _ = writeln!(out, "gradient = {expr}; //{tag}");
        emit_backward(p, out, declared);
    }
}

/// How an operand appears in an emitted expression: constants are
/// inlined, everything else goes through its value address.
fn operand_ref(node: &Node) -> String {
    if node.constant {
        hex_float(node.value.get())
    } else {
        format!("v({:p})", node.value.as_ptr())
    }
}

fn operand_strings(op: &Operation) -> (String, String) {
    let l = operand_ref(&op.parents[0]);
    let r = match op.kind {
        OpKind::PowConst(e) => hex_float(e),
        _ if op.parents.len() > 1 => operand_ref(&op.parents[1]),
        _ => String::new(),
    };
    (l, r)
}

/// Exact C hex-float literal for an `f32` (`0x1.4p+2f` for 5.0).
/// Round-trips bit-for-bit through the C compiler. Non-finite values
/// fall back to the `<math.h>` macros.
pub(crate) fn hex_float(v: f32) -> String {
    let bits = v.to_bits();
    let sign = if bits & 0x8000_0000 != 0 { "-" } else { "" };
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;
    match exponent {
        0xff if mantissa == 0 => {
            if sign.is_empty() {
                "INFINITY".to_string()
            } else {
                "(-INFINITY)".to_string()
            }
        }
        0xff => "NAN".to_string(),
        0 if mantissa == 0 => format!("{sign}0x0p+0f"),
        // Subnormal: mantissa * 2^-149 as an integral hex significand.
        0 => format!("{sign}0x{mantissa:x}p-149f"),
        _ => {
            let e = exponent - 127;
            // 23 mantissa bits shifted to 24 make six hex digits.
            let frac = mantissa << 1;
            if frac == 0 {
                format!("{sign}0x1p{e:+}f")
            } else {
                let mut digits = format!("{frac:06x}");
                while digits.ends_with('0') {
                    digits.pop();
                }
                format!("{sign}0x1.{digits}p{e:+}f")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, "0x0p+0f")]
    #[case(1.0, "0x1p+0f")]
    #[case(0.5, "0x1p-1f")]
    #[case(5.0, "0x1.4p+2f")]
    #[case(-2.5, "-0x1.4p+1f")]
    #[case(0.1, "0x1.99999ap-4f")]
    #[case(f32::MIN_POSITIVE, "0x1p-126f")]
    #[case(f32::INFINITY, "INFINITY")]
    #[case(f32::NEG_INFINITY, "(-INFINITY)")]
    fn hex_float_literals(#[case] v: f32, #[case] expected: &str) {
        assert_eq!(hex_float(v), expected);
    }

    #[test]
    fn hex_float_subnormal() {
        assert_eq!(hex_float(f32::from_bits(1)), "0x1p-149f");
    }

    #[test]
    fn forward_inlines_constants_and_addresses_variables() {
        let a = Node::leaf(2.0, false, true);
        let five = Node::leaf(5.0, true, false);
        let y = Node::from_op(OpKind::Mul, vec![a.clone(), five]);
        let body = forward_body(&y);
        let expected = format!(
            "value = v({:p}) = v({:p}) * 0x1.4p+2f; //*",
            y.value.as_ptr(),
            a.value.as_ptr()
        );
        assert!(body.contains(&expected), "body was:\n{body}");
        assert!(body.ends_with("return value;\n"));
    }

    #[test]
    fn forward_emits_shared_subexpression_once() {
        let a = Node::leaf(2.0, false, true);
        let b = Node::leaf(3.0, false, true);
        let s = Node::from_op(OpKind::Add, vec![a, b]);
        let y = Node::from_op(OpKind::Mul, vec![s.clone(), s.clone()]);
        let body = forward_body(&y);
        let assign = format!("v({:p}) =", s.value.as_ptr());
        assert_eq!(body.matches(&assign).count(), 1, "body was:\n{body}");
    }

    #[test]
    fn forward_of_leaf_root_returns_reference() {
        let a = Node::leaf(2.0, false, true);
        assert_eq!(forward_body(&a), format!("return v({:p});\n", a.value.as_ptr()));
        let c = Node::leaf(2.0, true, false);
        assert_eq!(forward_body(&c), "return 0x1p+1f;\n");
    }

    #[test]
    fn backward_accumulates_per_edge_but_declares_once() {
        let a = Node::leaf(2.0, false, true);
        let b = Node::leaf(3.0, false, true);
        let s = Node::from_op(OpKind::Add, vec![a.clone(), b]);
        let y = Node::from_op(OpKind::Mul, vec![s.clone(), s.clone()]);
        let body = backward_body(&y);

        // s receives one accumulation per incoming edge...
        let accumulate = format!("v({:p}) += gradient;", s.grad.as_ptr());
        assert_eq!(body.matches(&accumulate).count(), 2, "body was:\n{body}");
        // ...but its temporary is declared only on the first visit.
        let declaration = format!("float g{:p} = gradient;", Rc::as_ptr(&s));
        let reassignment = format!("\ng{:p} = gradient;", Rc::as_ptr(&s));
        assert_eq!(body.matches(&declaration).count(), 1);
        assert_eq!(body.matches(&reassignment).count(), 1);
        // a's gradient also accumulates once per path through s.
        let leaf_accumulate = format!("v({:p}) += gradient;", a.grad.as_ptr());
        assert_eq!(body.matches(&leaf_accumulate).count(), 2);
    }

    #[test]
    fn backward_stops_at_non_differentiable_operands() {
        let a = Node::leaf(2.0, false, true);
        let five = Node::leaf(5.0, true, false);
        let y = Node::from_op(OpKind::Mul, vec![a.clone(), five.clone()]);
        let body = backward_body(&y);
        assert!(!body.contains(&format!("{:p}", five.grad.as_ptr())));
        // a's contribution multiplies by the inlined constant.
        let expr = format!("gradient = g{:p}*0x1.4p+2f; //.*", Rc::as_ptr(&y));
        assert!(body.contains(&expr), "body was:\n{body}");
    }

    #[test]
    fn backward_of_undifferentiable_root_is_empty() {
        let c = Node::leaf(2.0, true, false);
        let y = Node::from_op(OpKind::Mul, vec![c.clone(), c]);
        assert!(backward_body(&y).is_empty());
    }

    #[test]
    fn powconst_square_uses_fast_path() {
        let a = Node::leaf(3.0, false, true);
        let y = Node::from_op(OpKind::PowConst(2.0), vec![a.clone()]);
        let fwd = forward_body(&y);
        assert!(!fwd.contains("pow("), "fwd was:\n{fwd}");
        let squared = format!("v({0:p})*v({0:p})", a.value.as_ptr());
        assert!(fwd.contains(&squared), "fwd was:\n{fwd}");
        let bwd = backward_body(&y);
        assert!(bwd.contains(&format!("*2*v({:p})", a.value.as_ptr())), "bwd was:\n{bwd}");
    }
}
