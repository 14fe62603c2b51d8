// simplify.rs — Algebraic simplifier for integer expressions
//
// Bottom-up rewriting into an affine canonical form: sums of
// `coefficient * atom` plus a constant, where atoms are the non-affine
// subterms (variables, params, calls, min/max, division by non-constants).
// Division and modulus by positive constants pull out exactly divisible
// terms; min/max/comparisons fold when the operand difference is constant.
//
// Preconditions: none.
// Postconditions: the result is semantically equal to the input under
//   Euclidean division and 64-bit arithmetic; simplification is idempotent.
// Failure modes: none; arithmetic that would overflow i64 is left unfolded.
// Side effects: none.

use std::collections::BTreeMap;

use crate::expr::{self, checked_div_euclid, div_euclid, mod_euclid, BinOp, CmpOp, Expr, ScalarType};

// ── Affine form ─────────────────────────────────────────────────────────

/// `sum(coeff * atom) + constant`. Zero coefficients are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linear {
    pub terms: BTreeMap<Expr, i64>,
    pub constant: i64,
}

impl Linear {
    fn constant(c: i64) -> Self {
        Linear {
            terms: BTreeMap::new(),
            constant: c,
        }
    }

    fn atom(e: Expr) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(e, 1);
        Linear { terms, constant: 0 }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn coefficient(&self, atom: &Expr) -> i64 {
        self.terms.get(atom).copied().unwrap_or(0)
    }

    fn add(&self, other: &Linear) -> Option<Linear> {
        let mut out = self.clone();
        for (atom, c) in &other.terms {
            let entry = out.terms.entry(atom.clone()).or_insert(0);
            *entry = entry.checked_add(*c)?;
            if *entry == 0 {
                out.terms.remove(atom);
            }
        }
        out.constant = out.constant.checked_add(other.constant)?;
        Some(out)
    }

    fn scale(&self, k: i64) -> Option<Linear> {
        if k == 0 {
            return Some(Linear::constant(0));
        }
        let mut terms = BTreeMap::new();
        for (atom, c) in &self.terms {
            terms.insert(atom.clone(), c.checked_mul(k)?);
        }
        Some(Linear {
            terms,
            constant: self.constant.checked_mul(k)?,
        })
    }

    fn sub(&self, other: &Linear) -> Option<Linear> {
        self.add(&other.scale(-1)?)
    }

    /// Rebuild an expression. Terms appear in atom order, constant last.
    pub fn to_expr(&self) -> Expr {
        let mut acc: Option<Expr> = None;
        for (atom, &c) in &self.terms {
            acc = Some(match acc {
                None => term(atom, c),
                Some(prev) if c > 0 => expr::bin(BinOp::Add, prev, term(atom, c)),
                Some(prev) => match c.checked_neg() {
                    Some(nc) => expr::bin(BinOp::Sub, prev, term(atom, nc)),
                    None => expr::bin(BinOp::Add, prev, term(atom, c)),
                },
            });
        }
        match acc {
            None => Expr::Int(self.constant),
            Some(e) if self.constant > 0 => expr::bin(BinOp::Add, e, Expr::Int(self.constant)),
            Some(e) if self.constant < 0 => match self.constant.checked_neg() {
                Some(nc) => expr::bin(BinOp::Sub, e, Expr::Int(nc)),
                None => expr::bin(BinOp::Add, e, Expr::Int(self.constant)),
            },
            Some(e) => e,
        }
    }
}

fn term(atom: &Expr, c: i64) -> Expr {
    if c == 1 {
        atom.clone()
    } else {
        expr::bin(BinOp::Mul, atom.clone(), Expr::Int(c))
    }
}

/// Decompose an (already simplified) expression into affine form.
/// Returns `None` only when the coefficients overflow.
pub fn linearize(e: &Expr) -> Option<Linear> {
    match e {
        Expr::Int(v) => Some(Linear::constant(*v)),
        Expr::Bin { op, a, b } => match op {
            BinOp::Add => linearize(a)?.add(&linearize(b)?),
            BinOp::Sub => linearize(a)?.sub(&linearize(b)?),
            BinOp::Mul => {
                let la = linearize(a)?;
                let lb = linearize(b)?;
                if la.is_constant() {
                    lb.scale(la.constant)
                } else if lb.is_constant() {
                    la.scale(lb.constant)
                } else {
                    Some(Linear::atom(e.clone()))
                }
            }
            _ => Some(Linear::atom(e.clone())),
        },
        _ => Some(Linear::atom(e.clone())),
    }
}

/// Constant value of `a - b` if it does not depend on any variable.
pub fn const_difference(a: &Expr, b: &Expr) -> Option<i64> {
    let d = linearize(a)?.sub(&linearize(b)?)?;
    d.is_constant().then_some(d.constant)
}

/// True if `e` is affine in `v` with a non-zero coefficient and `v`
/// appears nowhere else (so distinct values of `v` give distinct results
/// when all other variables are fixed).
pub fn strictly_affine_in(e: &Expr, v: &str) -> bool {
    let s = simplify(e);
    let Some(lin) = linearize(&s) else {
        return false;
    };
    let atom = Expr::Var(v.to_string());
    if lin.coefficient(&atom) == 0 {
        return false;
    }
    lin.terms
        .keys()
        .filter(|a| **a != atom)
        .all(|a| !a.uses_var(v))
}

// ── Entry point ─────────────────────────────────────────────────────────

/// Simplify an expression.
pub fn simplify(e: &Expr) -> Expr {
    match e {
        Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Param { .. } => e.clone(),
        Expr::Cast { ty, value } => simplify_cast(*ty, simplify(value)),
        Expr::Bin { op, a, b } => simplify_bin(*op, simplify(a), simplify(b)),
        Expr::Cmp { op, a, b } => simplify_cmp(*op, simplify(a), simplify(b)),
        Expr::And(a, b) => simplify_and(simplify(a), simplify(b)),
        Expr::Or(a, b) => simplify_or(simplify(a), simplify(b)),
        Expr::Not(a) => simplify_not(simplify(a)),
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => {
            let c = simplify(cond);
            match c {
                Expr::Bool(true) => simplify(then_value),
                Expr::Bool(false) => simplify(else_value),
                _ => {
                    let t = simplify(then_value);
                    let f = simplify(else_value);
                    if t == f {
                        t
                    } else {
                        expr::select(c, t, f)
                    }
                }
            }
        }
        Expr::Call(_) => e.map_children(simplify),
    }
}

fn simplify_cast(ty: ScalarType, value: Expr) -> Expr {
    match value {
        Expr::Int(v) if ty == ScalarType::Bool => Expr::Bool(v != 0),
        Expr::Int(v) => Expr::Int(ty.wrap(v)),
        Expr::Bool(b) if ty != ScalarType::Bool => Expr::Int(b as i64),
        v if v.ty() == ty => v,
        v => expr::cast(ty, v),
    }
}

fn canonical(e: Expr) -> Expr {
    match linearize(&e) {
        Some(lin) => lin.to_expr(),
        None => e,
    }
}

fn simplify_bin(op: BinOp, a: Expr, b: Expr) -> Expr {
    match op {
        BinOp::Add | BinOp::Sub => canonical(expr::bin(op, a, b)),
        BinOp::Mul => {
            if a.as_int().is_some() || b.as_int().is_some() {
                canonical(expr::bin(op, a, b))
            } else if b < a {
                expr::bin(op, b, a)
            } else {
                expr::bin(op, a, b)
            }
        }
        BinOp::Div => simplify_div(a, b),
        BinOp::Mod => simplify_mod(a, b),
        BinOp::Min | BinOp::Max => simplify_minmax(op, a, b),
    }
}

fn simplify_div(a: Expr, b: Expr) -> Expr {
    let Some(c) = b.as_int() else {
        return expr::bin(BinOp::Div, a, b);
    };
    if c == 0 {
        return Expr::Int(0);
    }
    if let Some(x) = a.as_int() {
        return match checked_div_euclid(x, c) {
            Some(q) => Expr::Int(q),
            None => expr::bin(BinOp::Div, a, b),
        };
    }
    if c == 1 {
        return a;
    }
    if c < 0 {
        return expr::bin(BinOp::Div, a, b);
    }
    // (x / c1) / c2 == x / (c1 * c2) for positive divisors.
    if let Expr::Bin {
        op: BinOp::Div,
        a: inner,
        b: d,
    } = &a
    {
        if let Some(c1) = d.as_int().filter(|c1| *c1 > 0) {
            if let Some(prod) = c1.checked_mul(c) {
                return simplify_div((**inner).clone(), Expr::Int(prod));
            }
        }
    }
    let Some(lin) = linearize(&a) else {
        return expr::bin(BinOp::Div, a, b);
    };
    // floor((c*A + R) / c) == A + floor(R / c)
    let mut quotient = Linear::constant(div_euclid(lin.constant, c));
    let mut rest = Linear::constant(mod_euclid(lin.constant, c));
    for (atom, &k) in &lin.terms {
        if k % c == 0 {
            quotient.terms.insert(atom.clone(), k / c);
        } else {
            rest.terms.insert(atom.clone(), k);
        }
    }
    if rest.is_constant() {
        // 0 <= rest.constant < c, so its quotient is zero.
        return quotient.to_expr();
    }
    if quotient.is_constant() && quotient.constant == 0 {
        return expr::bin(BinOp::Div, rest.to_expr(), Expr::Int(c));
    }
    let divided = expr::bin(BinOp::Div, rest.to_expr(), Expr::Int(c));
    match quotient.add(&Linear::atom(divided.clone())) {
        Some(sum) => sum.to_expr(),
        None => expr::bin(BinOp::Div, a, Expr::Int(c)),
    }
}

fn simplify_mod(a: Expr, b: Expr) -> Expr {
    let Some(c) = b.as_int() else {
        return expr::bin(BinOp::Mod, a, b);
    };
    if c == 0 || c == 1 || c == -1 {
        return Expr::Int(0);
    }
    if let Some(x) = a.as_int() {
        return Expr::Int(mod_euclid(x, c));
    }
    if c < 0 {
        return expr::bin(BinOp::Mod, a, b);
    }
    let Some(lin) = linearize(&a) else {
        return expr::bin(BinOp::Mod, a, b);
    };
    let mut rest = Linear::constant(mod_euclid(lin.constant, c));
    for (atom, &k) in &lin.terms {
        let r = mod_euclid(k, c);
        if r != 0 {
            rest.terms.insert(atom.clone(), r);
        }
    }
    if rest.is_constant() {
        return Expr::Int(rest.constant);
    }
    expr::bin(BinOp::Mod, rest.to_expr(), Expr::Int(c))
}

fn simplify_minmax(op: BinOp, a: Expr, b: Expr) -> Expr {
    let pick_min = op == BinOp::Min;
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Expr::Int(if pick_min { x.min(y) } else { x.max(y) });
    }
    if let Some(d) = const_difference(&a, &b) {
        return if (d <= 0) == pick_min { a } else { b };
    }
    // Constant operand goes second.
    let (a, b) = if a.as_int().is_some() || (b.as_int().is_none() && b < a) {
        (b, a)
    } else {
        (a, b)
    };
    // min(min(x, c1), c2) -> min(x, min(c1, c2))
    if let (
        Expr::Bin {
            op: inner_op,
            a: x,
            b: c1,
        },
        Some(c2),
    ) = (&a, b.as_int())
    {
        if *inner_op == op {
            if let Some(c1) = c1.as_int() {
                let c = if pick_min { c1.min(c2) } else { c1.max(c2) };
                return expr::bin(op, (**x).clone(), Expr::Int(c));
            }
        }
    }
    // min(x, min(x, y)) -> min(x, y)
    if let Expr::Bin {
        op: inner_op,
        a: x,
        b: y,
    } = &b
    {
        if *inner_op == op && (**x == a || **y == a) {
            return b;
        }
    }
    expr::bin(op, a, b)
}

fn simplify_cmp(op: CmpOp, a: Expr, b: Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
        match op {
            CmpOp::Eq => return Expr::Bool(x == y),
            CmpOp::Ne => return Expr::Bool(x != y),
            _ => {}
        }
    }
    if let Some(d) = const_difference(&a, &b) {
        return Expr::Bool(match op {
            CmpOp::Lt => d < 0,
            CmpOp::Le => d <= 0,
            CmpOp::Eq => d == 0,
            CmpOp::Ne => d != 0,
        });
    }
    expr::cmp(op, a, b)
}

fn simplify_and(a: Expr, b: Expr) -> Expr {
    match (a.as_bool(), b.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Expr::Bool(false),
        (Some(true), _) => b,
        (_, Some(true)) => a,
        _ if a == b => a,
        _ => expr::and(a, b),
    }
}

fn simplify_or(a: Expr, b: Expr) -> Expr {
    match (a.as_bool(), b.as_bool()) {
        (Some(true), _) | (_, Some(true)) => Expr::Bool(true),
        (Some(false), _) => b,
        (_, Some(false)) => a,
        _ if a == b => a,
        _ => expr::or(a, b),
    }
}

fn simplify_not(a: Expr) -> Expr {
    match a {
        Expr::Bool(v) => Expr::Bool(!v),
        Expr::Not(inner) => *inner,
        Expr::Cmp { op, a, b } => match op {
            CmpOp::Lt => expr::cmp(CmpOp::Le, *b, *a),
            CmpOp::Le => expr::cmp(CmpOp::Lt, *b, *a),
            CmpOp::Eq => expr::cmp(CmpOp::Ne, *a, *b),
            CmpOp::Ne => expr::cmp(CmpOp::Eq, *a, *b),
        },
        other => expr::not(other),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{var, Call};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn s(e: Expr) -> Expr {
        simplify(&e)
    }

    #[test]
    fn folds_constants() {
        assert_eq!(s(Expr::Int(3) + 4), Expr::Int(7));
        assert_eq!(s(Expr::Int(-7) / 2), Expr::Int(-4));
        assert_eq!(s(Expr::Int(-7) % 2), Expr::Int(1));
        assert_eq!(s(Expr::Int(5) / 0), Expr::Int(0));
    }

    #[test]
    fn cancels_terms() {
        let x = var("x");
        assert_eq!(s(x.clone() + 3 - x.clone()), Expr::Int(3));
        assert_eq!(s((x.clone() + 10) - (x.clone() + 1) + 1), Expr::Int(10));
        assert_eq!(s(x.clone() * 2 + x.clone()), s(x.clone() * 3));
    }

    #[test]
    fn canonical_form_is_order_independent() {
        let (x, y) = (var("x"), var("y"));
        assert_eq!(s(x.clone() + y.clone() + 1), s(Expr::Int(1) + y + x));
    }

    #[test]
    fn exact_division_by_constant() {
        let x = var("x");
        assert_eq!(s((x.clone() * 8 + 16) / 8), s(x.clone() + 2));
        // floor((8x + 5) / 4) == 2x + floor(5/4) == 2x + 1
        assert_eq!(s((x.clone() * 8 + 5) / 4), s(x.clone() * 2 + 1));
        assert_eq!(s((x.clone() * 8 + 5) % 4), Expr::Int(1));
        assert_eq!(s((x.clone() / 2) / 3), s(x.clone() / 6));
    }

    #[test]
    fn split_extent_round_trip() {
        // Outer extent of a split by 8 over extent 64: (64 + 7) / 8 == 8
        let e = (Expr::Int(64) + 8 - 1) / 8;
        assert_eq!(s(e), Expr::Int(8));
        let n = var("n");
        let rebuilt = s((n.clone() + 7) / 8 * 8 - n.clone());
        assert!(rebuilt.uses_var("n"));
    }

    #[test]
    fn min_max_fold_on_constant_difference() {
        let x = var("x");
        assert_eq!(s(expr::min(x.clone() + 1, x.clone() + 5)), s(x.clone() + 1));
        assert_eq!(s(expr::max(x.clone() + 1, x.clone() + 5)), s(x.clone() + 5));
        assert_eq!(
            s(expr::min(expr::min(x.clone(), 3), 5)),
            expr::min(x.clone(), 3)
        );
        assert_eq!(s(expr::min(7, x.clone())), expr::min(x, 7));
    }

    #[test]
    fn comparisons_fold() {
        let x = var("x");
        assert_eq!(s(expr::lt(x.clone(), x.clone() + 1)), Expr::Bool(true));
        assert_eq!(s(expr::eq(x.clone() * 2, x.clone() + x.clone())), Expr::Bool(true));
        assert_eq!(
            s(expr::not(expr::lt(x.clone(), 4))),
            expr::le(4, x.clone())
        );
    }

    #[test]
    fn select_and_logic() {
        let x = var("x");
        assert_eq!(s(expr::select(true, x.clone(), 0)), x);
        assert_eq!(s(expr::select(var("c"), 1, 1)), Expr::Int(1));
        assert_eq!(s(expr::and(true, var("c"))), var("c"));
        assert_eq!(s(expr::or(var("c"), true)), Expr::Bool(true));
    }

    #[test]
    fn calls_are_atoms() {
        let call = Expr::Call(Call {
            func: "g".into(),
            args: vec![var("x") + 0],
            value_index: 0,
            ty: ScalarType::I32,
        });
        let e = s(call.clone() - call.clone() + 2);
        assert_eq!(e, Expr::Int(2));
    }

    #[test]
    fn strict_affinity() {
        assert!(strictly_affine_in(&(var("r") * 2 + 1), "r"));
        assert!(strictly_affine_in(&(var("r") + var("x")), "r"));
        assert!(!strictly_affine_in(&(var("r") / 2), "r"));
        assert!(!strictly_affine_in(&(var("r") + var("r") % 3), "r"));
        assert!(!strictly_affine_in(&var("x"), "r"));
    }

    #[test]
    fn overflow_is_left_unfolded() {
        let e = Expr::Int(i64::MAX) + 1;
        let out = s(e.clone());
        assert_eq!(out, e);
        let e = expr::bin(BinOp::Div, Expr::Int(i64::MIN), Expr::Int(-1));
        assert_eq!(s(e.clone()), e);
    }

    // ── Property tests ─────────────────────────────────────────────────

    fn eval(e: &Expr, env: &BTreeMap<String, i64>) -> i64 {
        match e {
            Expr::Int(v) => *v,
            Expr::Var(n) => env[n],
            Expr::Bin { op, a, b } => {
                let (a, b) = (eval(a, env), eval(b, env));
                match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => div_euclid(a, b),
                    BinOp::Mod => mod_euclid(a, b),
                    BinOp::Min => a.min(b),
                    BinOp::Max => a.max(b),
                }
            }
            other => panic!("unexpected {other}"),
        }
    }

    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-10i64..10).prop_map(Expr::Int),
            prop_oneof![Just("x"), Just("y")].prop_map(var),
        ];
        leaf.prop_recursive(3, 12, 2, |inner| {
            (
                prop_oneof![
                    Just(BinOp::Add),
                    Just(BinOp::Sub),
                    Just(BinOp::Mul),
                    Just(BinOp::Div),
                    Just(BinOp::Mod),
                    Just(BinOp::Min),
                    Just(BinOp::Max),
                ],
                inner.clone(),
                inner,
            )
                .prop_map(|(op, a, b)| expr::bin(op, a, b))
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 200,
            max_shrink_iters: 200,
            ..ProptestConfig::default()
        })]

        #[test]
        fn simplify_preserves_value(e in arb_expr(), x in -10i64..10, y in -10i64..10) {
            let env: BTreeMap<String, i64> =
                [("x".to_string(), x), ("y".to_string(), y)].into_iter().collect();
            let simplified = simplify(&e);
            prop_assert_eq!(eval(&e, &env), eval(&simplified, &env), "{} vs {}", e, simplified);
        }

        #[test]
        fn simplify_is_idempotent(e in arb_expr()) {
            let once = simplify(&e);
            prop_assert_eq!(simplify(&once), once);
        }
    }
}
