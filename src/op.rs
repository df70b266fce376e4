//! # Operation catalogue
//!
//! The closed family of elementary operations a node can be the result
//! of. Each operation knows its arity, its forward value function, its
//! partial derivative with respect to each operand, its infix
//! precedence and printing, and the C expression templates used by the
//! code generator for the forward and backward passes.

/// An enumeration of all scalar operations.
///
/// The set is fixed and closed; adding an operation means extending
/// every `match` below, which the compiler enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpKind {
    /// `l + r`
    Add,
    /// `l - r`
    Sub,
    /// `l * r`
    Mul,
    /// `l / r`
    Div,
    /// `sqrt(l)`
    Sqrt,
    /// `e^l`
    Exp,
    /// `l^e` for a constant exponent `e`
    PowConst(f32),
    /// `l^r`
    Pow,
}

impl OpKind {
    /// Number of operands (1 or 2).
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Pow => 2,
            OpKind::Sqrt | OpKind::Exp | OpKind::PowConst(_) => 1,
        }
    }

    /// Forward value from the operands' current values.
    pub fn forward(&self, x: &[f32]) -> f32 {
        match self {
            OpKind::Add => x[0] + x[1],
            OpKind::Sub => x[0] - x[1],
            OpKind::Mul => x[0] * x[1],
            OpKind::Div => x[0] / x[1],
            OpKind::Sqrt => x[0].sqrt(),
            OpKind::Exp => x[0].exp(),
            OpKind::PowConst(e) => x[0].powf(*e),
            OpKind::Pow => x[0].powf(x[1]),
        }
    }

    /// Partial derivative with respect to operand `i`, evaluated at the
    /// operands' current values. `y` is the node's own (already
    /// computed) value, which `Exp` reuses.
    pub fn partial(&self, i: usize, x: &[f32], y: f32) -> f32 {
        match self {
            OpKind::Add => 1.0,
            OpKind::Sub => 1.0 - 2.0 * i as f32,
            OpKind::Mul => x[1 - i],
            OpKind::Div => {
                if i == 0 {
                    1.0 / x[1]
                } else {
                    -x[0] / (x[1] * x[1])
                }
            }
            OpKind::Sqrt => 0.5 / x[0].sqrt(),
            OpKind::Exp => y,
            OpKind::PowConst(e) => e * x[0].powf(e - 1.0),
            OpKind::Pow => {
                if i == 0 {
                    x[1] * x[0].powf(x[1] - 1.0)
                } else {
                    x[0].powf(x[1]) * x[0].ln()
                }
            }
        }
    }

    /// Infix precedence for pretty-printing. A child is bracketed when
    /// its precedence is less than or equal to its parent's.
    pub fn precedence(&self) -> i32 {
        match self {
            OpKind::Sqrt | OpKind::Exp => 0,
            OpKind::Add | OpKind::Sub => 1,
            OpKind::Mul | OpKind::Div => 2,
            OpKind::PowConst(_) | OpKind::Pow => 3,
        }
    }

    /// Infix rendering from the already-formatted operand strings.
    /// Unary operations ignore `r`; `PowConst` prints its stored
    /// exponent instead.
    pub fn print(&self, l: &str, r: &str) -> String {
        match self {
            OpKind::Add => format!("{l} + {r}"),
            OpKind::Sub => format!("{l} - {r}"),
            OpKind::Mul => format!("{l}*{r}"),
            OpKind::Div => format!("{l}/{r}"),
            OpKind::Sqrt => format!("sqrt({l})"),
            OpKind::Exp => format!("Exp[{l}]"),
            OpKind::PowConst(e) => format!("{l}^{e}"),
            OpKind::Pow => format!("{l}^{r}"),
        }
    }

    /// C expression computing this node's value. `l`/`r` are operand
    /// references (`v(0x…)` or an inlined literal); for `PowConst`,
    /// `r` is the pre-rendered exponent literal. Returns the
    /// right-hand side and a short comment tag.
    pub(crate) fn emit_forward(&self, l: &str, r: &str) -> (String, String) {
        match self {
            OpKind::Add => (format!("{l} + {r}"), "+".into()),
            OpKind::Sub => (format!("{l} - {r}"), "-".into()),
            OpKind::Mul => (format!("{l} * {r}"), "*".into()),
            OpKind::Div => (format!("{l} / {r}"), "./.".into()),
            OpKind::Sqrt => (format!("sqrt({l})"), "sqrt".into()),
            OpKind::Exp => (format!("exp({l})"), "exp".into()),
            OpKind::PowConst(e) if *e == 2.0 => (format!("{l}*{l}"), ".^2".into()),
            OpKind::PowConst(e) => (format!("pow({l}, {r})"), format!(".^{e}")),
            OpKind::Pow => (format!("pow({l}, {r})"), ".^.".into()),
        }
    }

    /// C expression for the gradient flowing into operand `i`. `g` is
    /// the local holding this node's incoming gradient, `l`/`r` are
    /// operand references (`r` is the exponent literal for
    /// `PowConst`), and `y` references this node's own value slot.
    pub(crate) fn emit_backward(
        &self,
        i: usize,
        g: &str,
        l: &str,
        r: &str,
        y: &str,
    ) -> (String, String) {
        match self {
            OpKind::Add => (g.to_string(), "+".into()),
            OpKind::Sub => {
                if i == 0 {
                    (g.to_string(), ".-".into())
                } else {
                    (format!("-{g}"), "-.".into())
                }
            }
            OpKind::Mul => {
                let other = if i == 0 { r } else { l };
                let tag = if i == 0 { ".*" } else { "*." };
                (format!("{g}*{other}"), tag.into())
            }
            OpKind::Div => {
                if i == 0 {
                    (format!("{g}/{r}"), "./".into())
                } else {
                    (format!("-{g}*{l}/({r}*{r})"), "/.".into())
                }
            }
            OpKind::Sqrt => (format!("0.5f*{g}/sqrt({l})"), "sqrt".into()),
            OpKind::Exp => (format!("{g}*{y}"), "exp".into()),
            OpKind::PowConst(e) if *e == 2.0 => (format!("{g}*2*{l}"), ".^2".into()),
            OpKind::PowConst(e) => (format!("{g}*{r}*pow({l}, {r}-1)"), format!(".^{e}")),
            OpKind::Pow => {
                if i == 0 {
                    (format!("{g}*{r}*pow({l}, {r}-1)"), ".^".into())
                } else {
                    (format!("{g}*pow({l}, {r})*log({l})"), "^.".into())
                }
            }
        }
    }
}
