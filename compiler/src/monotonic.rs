// monotonic.rs — Monotonicity of an expression in one variable
//
// Preconditions: none.
// Postconditions: `Increasing`/`Decreasing` are non-strict and sound;
//                 anything not provable is `Unknown`.
// Failure modes: none.
// Side effects: none.

use crate::expr::{BinOp, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonic {
    Constant,
    Increasing,
    Decreasing,
    Unknown,
}

impl Monotonic {
    pub fn flip(self) -> Monotonic {
        match self {
            Monotonic::Increasing => Monotonic::Decreasing,
            Monotonic::Decreasing => Monotonic::Increasing,
            other => other,
        }
    }

    /// Monotonicity of a sum of two terms.
    fn combine(self, other: Monotonic) -> Monotonic {
        use Monotonic::*;
        match (self, other) {
            (Constant, m) | (m, Constant) => m,
            (Increasing, Increasing) => Increasing,
            (Decreasing, Decreasing) => Decreasing,
            _ => Unknown,
        }
    }
}

pub fn is_monotonic(e: &Expr, var: &str) -> Monotonic {
    if !e.uses_var(var) {
        return Monotonic::Constant;
    }
    match e {
        Expr::Var(v) if v == var => Monotonic::Increasing,
        Expr::Cast { ty, value } => {
            let from = value.ty();
            // Only casts that cannot wrap preserve order.
            if ty.min_value() <= from.min_value() && ty.max_value() >= from.max_value() {
                is_monotonic(value, var)
            } else {
                Monotonic::Unknown
            }
        }
        Expr::Bin { op, a, b } => {
            let ma = is_monotonic(a, var);
            let mb = is_monotonic(b, var);
            match op {
                BinOp::Add | BinOp::Min | BinOp::Max => ma.combine(mb),
                BinOp::Sub => ma.combine(mb.flip()),
                BinOp::Mul => match (a.as_int(), b.as_int()) {
                    (_, Some(k)) => scale(ma, k),
                    (Some(k), _) => scale(mb, k),
                    _ => Monotonic::Unknown,
                },
                BinOp::Div => match b.as_int() {
                    Some(k) => scale(ma, k),
                    None => Monotonic::Unknown,
                },
                BinOp::Mod => Monotonic::Unknown,
            }
        }
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => {
            if cond.uses_var(var) {
                return Monotonic::Unknown;
            }
            let mt = is_monotonic(then_value, var);
            let me = is_monotonic(else_value, var);
            match (mt, me) {
                (a, b) if a == b => a,
                (Monotonic::Constant, m) | (m, Monotonic::Constant) => m,
                _ => Monotonic::Unknown,
            }
        }
        _ => Monotonic::Unknown,
    }
}

fn scale(m: Monotonic, k: i64) -> Monotonic {
    match k {
        0 => Monotonic::Constant,
        k if k > 0 => m,
        _ => m.flip(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
