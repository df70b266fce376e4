//! # Scalar engine handle
//!
//! [`Scalar`] is the public handle over the expression DAG. Arithmetic
//! on handles builds new nodes; `forward`/`backward` run the
//! interpreter; `compile` generates C for both passes, hands it to a
//! [`Loader`], and switches the handle over to the compiled entry
//! points for `forward_compiled`/`backward_compiled`.

use crate::codegen;
use crate::loader::{BackwardFn, FnKind, ForwardFn, Loader, LoaderError};
use crate::node::{Node, NodeCounts};
use crate::op::OpKind;
use std::fmt;
use std::ops;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// A compiled pass was requested before [`Scalar::compile`] succeeded.
#[derive(Debug, Clone, Copy, Error)]
#[error("expression has not been compiled; call compile() first")]
pub struct NotCompiled;

/// Compiled forward/backward pair. Keeps the shared object mapped for
/// as long as any clone of the handle can call into it.
struct Jit {
    forward: ForwardFn,
    backward: BackwardFn,
    _library: Arc<libloading::Library>,
}

/// Handle to one node of a shared expression DAG.
///
/// Cloning is cheap and shares the node. Leaves come from
/// [`Scalar::variable`] (differentiable), [`Scalar::constant`]
/// (inlinable literal) or [`Scalar::input`] (updatable, not
/// differentiated); everything else is built with ordinary operators
/// and the math methods.
#[derive(Clone)]
pub struct Scalar {
    // Field order: the loaded library must be released before the node
    // storage its generated code references.
    jit: Option<Rc<Jit>>,
    node: Rc<Node>,
}

impl Scalar {
    /// A literal constant leaf. Its value may be inlined into
    /// generated code, so it must not be updated after `compile`.
    pub fn constant(value: f32) -> Self {
        Scalar {
            jit: None,
            node: Node::leaf(value, true, false),
        }
    }

    /// A differentiable leaf. The flag is fixed at construction;
    /// rebuild the expression to change it.
    pub fn variable(value: f32) -> Self {
        Scalar {
            jit: None,
            node: Node::leaf(value, false, true),
        }
    }

    /// An updatable leaf that no gradient is wanted for. Unlike a
    /// constant it is referenced through its address in generated
    /// code, so `set_value` takes effect on compiled passes too.
    pub fn input(value: f32) -> Self {
        Scalar {
            jit: None,
            node: Node::leaf(value, false, false),
        }
    }

    fn binary(kind: OpKind, l: &Scalar, r: &Scalar) -> Scalar {
        Scalar {
            jit: None,
            node: Node::from_op(kind, vec![l.node.clone(), r.node.clone()]),
        }
    }

    fn unary(kind: OpKind, l: &Scalar) -> Scalar {
        Scalar {
            jit: None,
            node: Node::from_op(kind, vec![l.node.clone()]),
        }
    }

    /// `sqrt(self)`
    pub fn sqrt(&self) -> Scalar {
        Scalar::unary(OpKind::Sqrt, self)
    }

    /// `e^self`
    pub fn exp(&self) -> Scalar {
        Scalar::unary(OpKind::Exp, self)
    }

    /// `self^exponent` for a constant exponent.
    pub fn powf(&self, exponent: f32) -> Scalar {
        Scalar::unary(OpKind::PowConst(exponent), self)
    }

    /// `self^exponent` for an expression exponent.
    pub fn pow(&self, exponent: &Scalar) -> Scalar {
        Scalar::binary(OpKind::Pow, self, exponent)
    }

    pub fn value(&self) -> f32 {
        self.node.value.get()
    }

    /// Overwrite the value slot. On a leaf this is the way to feed new
    /// data between passes; structure is untouched.
    pub fn set_value(&self, value: f32) {
        self.node.value.set(value);
    }

    pub fn grad(&self) -> f32 {
        self.node.grad.get()
    }

    pub fn set_grad(&self, grad: f32) {
        self.node.grad.set(grad);
    }

    /// Gradient accumulation is additive across backward passes; the
    /// caller zeroes the slots it reads between passes.
    pub fn zero_grad(&self) {
        self.node.grad.set(0.0);
    }

    pub fn requires_grad(&self) -> bool {
        self.node.requires_grad
    }

    pub fn is_constant(&self) -> bool {
        self.node.constant
    }

    pub fn name(&self) -> Option<String> {
        self.node.name.borrow().clone()
    }

    /// Label used by [`Scalar::expr_string`] instead of the value.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.node.name.borrow_mut() = Some(name.into());
    }

    /// Recompute every node's value from the current leaf values.
    pub fn forward(&self) {
        self.node.forward();
    }

    /// Backward pass with seed 1, accumulating `∂self/∂node` into
    /// every reachable differentiable node's gradient slot.
    pub fn backward(&self) {
        self.node.backward(1.0);
    }

    /// Backward pass with an explicit seed.
    pub fn backward_seeded(&self, seed: f32) {
        self.node.backward(seed);
    }

    /// Generate C for both passes rooted here, compile and load it
    /// through `loader`, and resolve the two entry points. On error
    /// the handle keeps working in interpreted mode.
    pub fn compile(&mut self, loader: &mut Loader) -> Result<(), LoaderError> {
        loader.add_function("forward", FnKind::Forward, &codegen::forward_body(&self.node));
        loader.add_function(
            "backward",
            FnKind::Backward,
            &codegen::backward_body(&self.node),
        );
        loader.compile_and_load()?;
        let (forward, library) = loader.forward_entry("forward")?;
        let (backward, _) = loader.backward_entry("backward")?;
        self.jit = Some(Rc::new(Jit {
            forward,
            backward,
            _library: library,
        }));
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.jit.is_some()
    }

    /// Compiled forward pass. Writes every node's value slot and
    /// returns (and stores) the root value.
    pub fn forward_compiled(&self) -> Result<f32, NotCompiled> {
        let jit = self.jit.as_ref().ok_or(NotCompiled)?;
        // SAFETY: the entry point was resolved against this signature
        // and every address baked into it belongs to the DAG this
        // handle keeps alive.
        let value = unsafe { (jit.forward)() };
        self.node.value.set(value);
        Ok(value)
    }

    /// Compiled backward pass with seed 1.
    pub fn backward_compiled(&self) -> Result<(), NotCompiled> {
        self.backward_compiled_seeded(1.0)
    }

    /// Compiled backward pass with an explicit seed.
    pub fn backward_compiled_seeded(&self, seed: f32) -> Result<(), NotCompiled> {
        let jit = self.jit.as_ref().ok_or(NotCompiled)?;
        // SAFETY: as for `forward_compiled`.
        unsafe { (jit.backward)(seed) };
        Ok(())
    }

    /// Human-readable infix form of the expression.
    pub fn expr_string(&self) -> String {
        self.node.expr()
    }

    /// Distinct-node statistics for the expression rooted here.
    pub fn node_counts(&self) -> NodeCounts {
        self.node.counts()
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::constant(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr_string())
    }
}

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scalar")
            .field("value", &self.value())
            .field("grad", &self.grad())
            .field("requires_grad", &self.requires_grad())
            .field("constant", &self.is_constant())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $kind:expr) => {
        impl ops::$trait<&Scalar> for &Scalar {
            type Output = Scalar;
            fn $method(self, rhs: &Scalar) -> Scalar {
                Scalar::binary($kind, self, rhs)
            }
        }

        impl ops::$trait<Scalar> for &Scalar {
            type Output = Scalar;
            fn $method(self, rhs: Scalar) -> Scalar {
                Scalar::binary($kind, self, &rhs)
            }
        }

        impl ops::$trait<&Scalar> for Scalar {
            type Output = Scalar;
            fn $method(self, rhs: &Scalar) -> Scalar {
                Scalar::binary($kind, &self, rhs)
            }
        }

        impl ops::$trait<Scalar> for Scalar {
            type Output = Scalar;
            fn $method(self, rhs: Scalar) -> Scalar {
                Scalar::binary($kind, &self, &rhs)
            }
        }

        impl ops::$trait<f32> for &Scalar {
            type Output = Scalar;
            fn $method(self, rhs: f32) -> Scalar {
                Scalar::binary($kind, self, &Scalar::constant(rhs))
            }
        }

        impl ops::$trait<f32> for Scalar {
            type Output = Scalar;
            fn $method(self, rhs: f32) -> Scalar {
                Scalar::binary($kind, &self, &Scalar::constant(rhs))
            }
        }

        impl ops::$trait<&Scalar> for f32 {
            type Output = Scalar;
            fn $method(self, rhs: &Scalar) -> Scalar {
                Scalar::binary($kind, &Scalar::constant(self), rhs)
            }
        }

        impl ops::$trait<Scalar> for f32 {
            type Output = Scalar;
            fn $method(self, rhs: Scalar) -> Scalar {
                Scalar::binary($kind, &Scalar::constant(self), &rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, OpKind::Add);
impl_binary_op!(Sub, sub, OpKind::Sub);
impl_binary_op!(Mul, mul, OpKind::Mul);
impl_binary_op!(Div, div, OpKind::Div);
