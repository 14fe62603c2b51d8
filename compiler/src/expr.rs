// expr.rs — Integer expression IR shared by every lowering phase
//
// Expressions describe Func definitions (values, update arguments, RDom
// bounds and predicates) and, after synthesis, every loop bound and let
// value in the loop-nest IR.
//
// Preconditions: none (types and pure helpers only).
// Postconditions: none.
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops;

use serde::{Deserialize, Serialize};

// ── Scalar types ────────────────────────────────────────────────────────────

/// Element type of an expression or a Func tuple component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    Int(u8),
    UInt(u8),
}

impl ScalarType {
    pub const I32: ScalarType = ScalarType::Int(32);

    pub fn bits(self) -> u8 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int(b) | ScalarType::UInt(b) => b,
        }
    }

    /// Smallest representable value.
    pub fn min_value(self) -> i64 {
        match self {
            ScalarType::Bool => 0,
            ScalarType::UInt(_) => 0,
            ScalarType::Int(b) if b >= 64 => i64::MIN,
            ScalarType::Int(b) => -(1i64 << (b - 1)),
        }
    }

    /// Largest representable value. `UInt(64)` saturates at `i64::MAX`.
    pub fn max_value(self) -> i64 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::UInt(b) if b >= 63 => i64::MAX,
            ScalarType::UInt(b) => (1i64 << b) - 1,
            ScalarType::Int(b) if b >= 64 => i64::MAX,
            ScalarType::Int(b) => (1i64 << (b - 1)) - 1,
        }
    }

    pub fn can_represent(self, v: i64) -> bool {
        v >= self.min_value() && v <= self.max_value()
    }

    /// True for types whose full range is small enough to serve as a value
    /// bound for data-dependent indexing.
    pub fn is_narrow(self) -> bool {
        self.bits() < 32
    }

    /// Truncate `v` to this type (two's complement wrap-around).
    pub fn wrap(self, v: i64) -> i64 {
        match self {
            ScalarType::Bool => (v != 0) as i64,
            ScalarType::Int(b) if b >= 64 => v,
            ScalarType::Int(b) => {
                let shift = 64 - b as u32;
                (v << shift) >> shift
            }
            ScalarType::UInt(b) if b >= 64 => v,
            ScalarType::UInt(b) => v & ((1i64 << b) - 1),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::Int(b) => write!(f, "i{}", b),
            ScalarType::UInt(b) => write!(f, "u{}", b),
        }
    }
}

// ── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

/// Comparisons. `>` and `>=` are expressed by swapping operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
}

// ── Expression tree ─────────────────────────────────────────────────────────

/// A call to a Func (or input image), selecting one tuple component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Call {
    pub func: String,
    pub args: Vec<Expr>,
    pub value_index: usize,
    pub ty: ScalarType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Var(String),
    Param {
        name: String,
        ty: ScalarType,
    },
    Cast {
        ty: ScalarType,
        value: Box<Expr>,
    },
    Bin {
        op: BinOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Cmp {
        op: CmpOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Select {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    Call(Call),
}

/// Variable reference.
pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

/// Scalar parameter reference.
pub fn param(name: impl Into<String>, ty: ScalarType) -> Expr {
    Expr::Param {
        name: name.into(),
        ty,
    }
}

pub fn bin(op: BinOp, a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Bin {
        op,
        a: Box::new(a.into()),
        b: Box::new(b.into()),
    }
}

pub fn cmp(op: CmpOp, a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Cmp {
        op,
        a: Box::new(a.into()),
        b: Box::new(b.into()),
    }
}

pub fn min(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    bin(BinOp::Min, a, b)
}

pub fn max(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    bin(BinOp::Max, a, b)
}

pub fn clamp(e: impl Into<Expr>, lo: impl Into<Expr>, hi: impl Into<Expr>) -> Expr {
    max(min(e, hi), lo)
}

pub fn lt(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Lt, a, b)
}

pub fn le(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Le, a, b)
}

pub fn gt(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Lt, b, a)
}

pub fn ge(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Le, b, a)
}

pub fn eq(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Eq, a, b)
}

pub fn ne(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    cmp(CmpOp::Ne, a, b)
}

pub fn and(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::And(Box::new(a.into()), Box::new(b.into()))
}

pub fn or(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Or(Box::new(a.into()), Box::new(b.into()))
}

pub fn not(a: impl Into<Expr>) -> Expr {
    Expr::Not(Box::new(a.into()))
}

pub fn select(cond: impl Into<Expr>, t: impl Into<Expr>, f: impl Into<Expr>) -> Expr {
    Expr::Select {
        cond: Box::new(cond.into()),
        then_value: Box::new(t.into()),
        else_value: Box::new(f.into()),
    }
}

pub fn cast(ty: ScalarType, e: impl Into<Expr>) -> Expr {
    Expr::Cast {
        ty,
        value: Box::new(e.into()),
    }
}

/// Conjunction of all `conds`; `true` when empty.
pub fn all_of(conds: impl IntoIterator<Item = Expr>) -> Expr {
    conds
        .into_iter()
        .reduce(and)
        .unwrap_or(Expr::Bool(true))
}

/// Disjunction of all `conds`; `false` when empty.
pub fn any_of(conds: impl IntoIterator<Item = Expr>) -> Expr {
    conds
        .into_iter()
        .reduce(or)
        .unwrap_or(Expr::Bool(false))
}

impl Expr {
    pub fn int(v: i64) -> Expr {
        Expr::Int(v)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Expr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Int(_) | Expr::Bool(_))
    }

    /// Result type of this expression. Loop and let variables are `i32`.
    pub fn ty(&self) -> ScalarType {
        match self {
            Expr::Int(_) | Expr::Var(_) => ScalarType::I32,
            Expr::Bool(_) | Expr::Cmp { .. } | Expr::And(..) | Expr::Or(..) | Expr::Not(_) => {
                ScalarType::Bool
            }
            Expr::Param { ty, .. } | Expr::Cast { ty, .. } => *ty,
            Expr::Call(c) => c.ty,
            Expr::Bin { a, b, .. } => match a.as_ref() {
                Expr::Int(_) => b.ty(),
                _ => a.ty(),
            },
            Expr::Select { then_value, .. } => then_value.ty(),
        }
    }

    /// Rebuild this node with `f` applied to each direct child.
    pub fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Param { .. } => self.clone(),
            Expr::Cast { ty, value } => Expr::Cast {
                ty: *ty,
                value: Box::new(f(value)),
            },
            Expr::Bin { op, a, b } => Expr::Bin {
                op: *op,
                a: Box::new(f(a)),
                b: Box::new(f(b)),
            },
            Expr::Cmp { op, a, b } => Expr::Cmp {
                op: *op,
                a: Box::new(f(a)),
                b: Box::new(f(b)),
            },
            Expr::And(a, b) => Expr::And(Box::new(f(a)), Box::new(f(b))),
            Expr::Or(a, b) => Expr::Or(Box::new(f(a)), Box::new(f(b))),
            Expr::Not(a) => Expr::Not(Box::new(f(a))),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => Expr::Select {
                cond: Box::new(f(cond)),
                then_value: Box::new(f(then_value)),
                else_value: Box::new(f(else_value)),
            },
            Expr::Call(c) => Expr::Call(Call {
                func: c.func.clone(),
                args: c.args.iter().map(&mut f).collect(),
                value_index: c.value_index,
                ty: c.ty,
            }),
        }
    }

    /// Visit every direct child.
    pub fn for_each_child(&self, mut f: impl FnMut(&Expr)) {
        match self {
            Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Param { .. } => {}
            Expr::Cast { value, .. } | Expr::Not(value) => f(value),
            Expr::Bin { a, b, .. } | Expr::Cmp { a, b, .. } | Expr::And(a, b) | Expr::Or(a, b) => {
                f(a);
                f(b);
            }
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
            Expr::Call(c) => c.args.iter().for_each(f),
        }
    }

    /// Pre-order traversal of the whole tree.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        self.for_each_child(|c| c.walk(f));
    }

    /// Names of all variables referenced (params excluded).
    pub fn free_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Var(name) = e {
                out.insert(name.clone());
            }
        });
        out
    }

    pub fn uses_var(&self, name: &str) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Var(n) = e {
                found |= n == name;
            }
        });
        found
    }

    /// True if any variable in `names` is referenced.
    pub fn uses_any_var(&self, names: &BTreeSet<String>) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Var(n) = e {
                found |= names.contains(n);
            }
        });
        found
    }

    pub fn has_calls(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Call(_)));
        found
    }

    pub fn calls_func(&self, func: &str) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Call(c) = e {
                found |= c.func == func;
            }
        });
        found
    }

    /// Names of all Funcs called anywhere in this expression.
    pub fn called_funcs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Call(c) = e {
                out.insert(c.func.clone());
            }
        });
        out
    }

    /// Simultaneously replace variables by expressions.
    pub fn substitute(&self, map: &BTreeMap<String, Expr>) -> Expr {
        if map.is_empty() {
            return self.clone();
        }
        match self {
            Expr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            _ => self.map_children(|c| c.substitute(map)),
        }
    }

    pub fn substitute_var(&self, name: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Var(n) if n == name => replacement.clone(),
            _ => self.map_children(|c| c.substitute_var(name, replacement)),
        }
    }

    /// Replace every call to `func` using `f(call, rewritten_args)`.
    /// Arguments are rewritten before the call itself.
    pub fn replace_calls(&self, func: &str, f: &mut dyn FnMut(&Call, Vec<Expr>) -> Expr) -> Expr {
        match self {
            Expr::Call(c) if c.func == func => {
                let args = c.args.iter().map(|a| a.replace_calls(func, f)).collect();
                f(c, args)
            }
            _ => self.map_children(|child| child.replace_calls(func, f)),
        }
    }
}

// ── Conversions and operator overloads ──────────────────────────────────────

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Int(v as i64)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::Bool(v)
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::Var(v.to_string())
    }
}

impl From<&Expr> for Expr {
    fn from(v: &Expr) -> Self {
        v.clone()
    }
}

macro_rules! impl_expr_bin_op {
    ($trait_name:ident, $trait_op:ident, $op:expr) => {
        impl ops::$trait_name<Expr> for Expr {
            type Output = Expr;
            fn $trait_op(self, rhs: Expr) -> Expr {
                bin($op, self, rhs)
            }
        }

        impl ops::$trait_name<i64> for Expr {
            type Output = Expr;
            fn $trait_op(self, rhs: i64) -> Expr {
                bin($op, self, Expr::Int(rhs))
            }
        }

        impl ops::$trait_name<Expr> for i64 {
            type Output = Expr;
            fn $trait_op(self, rhs: Expr) -> Expr {
                bin($op, Expr::Int(self), rhs)
            }
        }

        impl ops::$trait_name<&Expr> for &Expr {
            type Output = Expr;
            fn $trait_op(self, rhs: &Expr) -> Expr {
                bin($op, self.clone(), rhs.clone())
            }
        }

        impl ops::$trait_name<i64> for &Expr {
            type Output = Expr;
            fn $trait_op(self, rhs: i64) -> Expr {
                bin($op, self.clone(), Expr::Int(rhs))
            }
        }
    };
}

impl_expr_bin_op!(Add, add, BinOp::Add);
impl_expr_bin_op!(Sub, sub, BinOp::Sub);
impl_expr_bin_op!(Mul, mul, BinOp::Mul);
impl_expr_bin_op!(Div, div, BinOp::Div);
impl_expr_bin_op!(Rem, rem, BinOp::Mod);

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        bin(BinOp::Sub, Expr::Int(0), self)
    }
}

// ── Evaluation helpers ──────────────────────────────────────────────────────

/// Euclidean division; division by zero yields zero and `i64::MIN / -1`
/// wraps like every other evaluated operation.
pub fn div_euclid(a: i64, b: i64) -> i64 {
    if b == 0 {
        0
    } else {
        a.wrapping_div_euclid(b)
    }
}

/// Euclidean division for bounds and constant folding: `None` on overflow.
pub fn checked_div_euclid(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        Some(0)
    } else {
        a.checked_div_euclid(b)
    }
}

/// Euclidean remainder (always non-negative); modulo zero yields zero.
pub fn mod_euclid(a: i64, b: i64) -> i64 {
    if b == 0 {
        0
    } else {
        a.checked_rem_euclid(b).unwrap_or(0)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Param { name, .. } => write!(f, "{}", name),
            Expr::Cast { ty, value } => write!(f, "{}({})", ty, value),
            Expr::Bin { op, a, b } => match op {
                BinOp::Add => write!(f, "({} + {})", a, b),
                BinOp::Sub => write!(f, "({} - {})", a, b),
                BinOp::Mul => write!(f, "({}*{})", a, b),
                BinOp::Div => write!(f, "({}/{})", a, b),
                BinOp::Mod => write!(f, "({} % {})", a, b),
                BinOp::Min => write!(f, "min({}, {})", a, b),
                BinOp::Max => write!(f, "max({}, {})", a, b),
            },
            Expr::Cmp { op, a, b } => {
                let sym = match op {
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::And(a, b) => write!(f, "({} && {})", a, b),
            Expr::Or(a, b) => write!(f, "({} || {})", a, b),
            Expr::Not(a) => write!(f, "!{}", a),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => write!(f, "select({}, {}, {})", cond, then_value, else_value),
            Expr::Call(c) => {
                write!(f, "{}(", c.func)?;
                for (i, a) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")?;
                if c.value_index > 0 {
                    write!(f, "[{}]", c.value_index)?;
                }
                Ok(())
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
