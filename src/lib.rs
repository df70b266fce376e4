//! Cinder: scalar reverse-mode automatic differentiation with a
//! JIT-via-C backend.
//!
//! Expressions over scalar variables are recorded as a shared DAG.
//! The engine evaluates the expression forward, accumulates partial
//! derivatives of the root with respect to every variable by reverse
//! traversal, and can emit equivalent straight-line C for both passes,
//! compile it through the external C compiler and call the loaded
//! shared object in place of the interpreter.
//!
//! # Example
//!
//! ```rust
//! use cinder::Scalar;
//!
//! let a = Scalar::variable(3.0);
//! let b = Scalar::variable(2.0);
//! let x = (&a * &a + &b * 5.0).sqrt();
//!
//! x.backward();
//! assert!((x.value() - 19.0f32.sqrt()).abs() < 1e-6);
//! assert!((a.grad() - 3.0 / 19.0f32.sqrt()).abs() < 1e-6);
//!
//! // feed new data and re-evaluate; structure is reused
//! a.set_value(4.0);
//! x.forward();
//! assert!((x.value() - 26.0f32.sqrt()).abs() < 1e-6);
//! ```
//!
//! The compiled path mirrors the interpreted one:
//!
//! ```ignore
//! use cinder::{Loader, Scalar};
//!
//! let mut loader = Loader::default();
//! let mut x = build_expression();
//! x.compile(&mut loader)?;
//! let value = x.forward_compiled()?;
//! x.backward_compiled()?;
//! ```

mod codegen;
pub mod loader;
pub mod node;
pub mod op;
pub mod scalar;

pub use loader::{BackwardFn, FnKind, ForwardFn, Loader, LoaderError};
pub use node::NodeCounts;
pub use op::OpKind;
pub use scalar::{NotCompiled, Scalar};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::loader::Loader;
    pub use crate::scalar::Scalar;
}

/// Initialises the `env_logger` backend; safe to call repeatedly
/// (tests call it from every entry point).
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
