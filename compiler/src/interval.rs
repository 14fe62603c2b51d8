// interval.rs — Numeric interval arithmetic with unbounded ends
//
// `ConstInterval` is the concrete counterpart of the symbolic bounds
// interval: each end is either a known i64 or unbounded. Every operation
// is sound (the result contains every value the operation can produce on
// members of its inputs). Overflow never wraps: an end whose computation
// overflows becomes unbounded.
//
// Preconditions: intervals are non-empty (min <= max when both known).
// Postconditions: results are sound over-approximations.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::{checked_div_euclid, div_euclid, ScalarType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstInterval {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl ConstInterval {
    pub const EVERYTHING: ConstInterval = ConstInterval {
        min: None,
        max: None,
    };

    pub fn new(min: Option<i64>, max: Option<i64>) -> Self {
        ConstInterval { min, max }
    }

    pub fn bounded(min: i64, max: i64) -> Self {
        ConstInterval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn single(v: i64) -> Self {
        Self::bounded(v, v)
    }

    /// The full range of a scalar type.
    pub fn of_type(ty: ScalarType) -> Self {
        Self::bounded(ty.min_value(), ty.max_value())
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    pub fn is_everything(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn as_single(&self) -> Option<i64> {
        match (self.min, self.max) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        self.min.map_or(true, |m| m <= v) && self.max.map_or(true, |m| v <= m)
    }

    /// Number of values, when bounded and representable.
    pub fn extent(&self) -> Option<i64> {
        let (lo, hi) = (self.min?, self.max?);
        hi.checked_sub(lo)?.checked_add(1)
    }

    /// Smallest interval containing both.
    pub fn union(&self, other: &ConstInterval) -> ConstInterval {
        ConstInterval {
            min: both(self.min, other.min, i64::min),
            max: both(self.max, other.max, i64::max),
        }
    }

    /// Intersection, or `None` when the intervals are disjoint.
    pub fn intersect(&self, other: &ConstInterval) -> Option<ConstInterval> {
        let min = either(self.min, other.min, i64::max);
        let max = either(self.max, other.max, i64::min);
        match (min, max) {
            (Some(lo), Some(hi)) if lo > hi => None,
            _ => Some(ConstInterval { min, max }),
        }
    }

    pub fn neg(&self) -> ConstInterval {
        ConstInterval {
            min: self.max.and_then(i64::checked_neg),
            max: self.min.and_then(i64::checked_neg),
        }
    }

    pub fn add(&self, other: &ConstInterval) -> ConstInterval {
        ConstInterval {
            min: self.min.zip(other.min).and_then(|(a, b)| a.checked_add(b)),
            max: self.max.zip(other.max).and_then(|(a, b)| a.checked_add(b)),
        }
    }

    pub fn sub(&self, other: &ConstInterval) -> ConstInterval {
        ConstInterval {
            min: self.min.zip(other.max).and_then(|(a, b)| a.checked_sub(b)),
            max: self.max.zip(other.min).and_then(|(a, b)| a.checked_sub(b)),
        }
    }

    pub fn mul(&self, other: &ConstInterval) -> ConstInterval {
        if self.as_single() == Some(0) || other.as_single() == Some(0) {
            return ConstInterval::single(0);
        }
        if let (Some(a0), Some(a1), Some(b0), Some(b1)) =
            (self.min, self.max, other.min, other.max)
        {
            let products = [
                a0.checked_mul(b0),
                a0.checked_mul(b1),
                a1.checked_mul(b0),
                a1.checked_mul(b1),
            ];
            if products.iter().all(Option::is_some) {
                let vals = products.map(|p| p.unwrap_or(0));
                return ConstInterval::bounded(
                    vals.iter().copied().fold(i64::MAX, i64::min),
                    vals.iter().copied().fold(i64::MIN, i64::max),
                );
            }
            return ConstInterval::EVERYTHING;
        }
        if other.is_bounded() {
            mul_by_bounded(self, other)
        } else if self.is_bounded() {
            mul_by_bounded(other, self)
        } else {
            ConstInterval::EVERYTHING
        }
    }

    /// Euclidean division; division by zero yields zero.
    pub fn div(&self, other: &ConstInterval) -> ConstInterval {
        if let Some(c) = other.as_single() {
            return match c {
                0 => ConstInterval::single(0),
                c if c > 0 => ConstInterval {
                    min: self.min.map(|a| div_euclid(a, c)),
                    max: self.max.map(|a| div_euclid(a, c)),
                },
                // i64::MIN / -1 does not fit: that end becomes unbounded.
                c => ConstInterval {
                    min: self.max.and_then(|a| checked_div_euclid(a, c)),
                    max: self.min.and_then(|a| checked_div_euclid(a, c)),
                },
            };
        }
        match (other.min, other.max) {
            (Some(b0), _) if b0 > 0 => {
                // Corners, with an unbounded divisor tending to 0 / -1.
                let limit = |a: i64| if a < 0 { -1 } else { 0 };
                let mut lo_cands = vec![];
                let mut hi_cands = vec![];
                if let Some(a0) = self.min {
                    lo_cands.push(div_euclid(a0, b0));
                    match other.max {
                        Some(b1) => lo_cands.push(div_euclid(a0, b1)),
                        None => lo_cands.push(limit(a0)),
                    }
                }
                if let Some(a1) = self.max {
                    hi_cands.push(div_euclid(a1, b0));
                    match other.max {
                        Some(b1) => hi_cands.push(div_euclid(a1, b1)),
                        None => hi_cands.push(limit(a1)),
                    }
                }
                ConstInterval {
                    min: self.min.and(lo_cands.into_iter().min()),
                    max: self.max.and(hi_cands.into_iter().max()),
                }
            }
            (_, Some(b1)) if b1 < 0 => {
                // a div_euclid b == -(a div_euclid -b) for b < 0
                self.div(&other.neg()).neg()
            }
            _ => match (self.min, self.max) {
                (Some(a0), Some(a1)) => {
                    match a0.checked_abs().zip(a1.checked_abs()) {
                        Some((x, y)) => {
                            let m = x.max(y);
                            ConstInterval::bounded(-m, m)
                        }
                        None => ConstInterval::EVERYTHING,
                    }
                }
                _ => ConstInterval::EVERYTHING,
            },
        }
    }

    /// Euclidean remainder; always in `[0, |b| - 1]`, zero for `b == 0`.
    pub fn rem(&self, other: &ConstInterval) -> ConstInterval {
        if let (Some(a0), Some(a1), Some(b0)) = (self.min, self.max, other.min) {
            if a0 >= 0 && b0 > 0 && a1 < b0 {
                return *self;
            }
        }
        let max = match (other.min, other.max) {
            (Some(b0), Some(b1)) => {
                let hi = b1.checked_sub(1);
                let lo = b0.checked_neg().and_then(|n| n.checked_sub(1));
                hi.zip(lo).map(|(h, l)| h.max(l).max(0))
            }
            _ => None,
        };
        let max = match (max, self.min, self.max) {
            (Some(m), Some(a0), Some(a1)) if a0 >= 0 => Some(m.min(a1)),
            (None, Some(a0), Some(a1)) if a0 >= 0 => Some(a1),
            (m, _, _) => m,
        };
        ConstInterval { min: Some(0), max }
    }

    pub fn min(&self, other: &ConstInterval) -> ConstInterval {
        ConstInterval {
            min: both(self.min, other.min, i64::min),
            max: either(self.max, other.max, i64::min),
        }
    }

    pub fn max(&self, other: &ConstInterval) -> ConstInterval {
        ConstInterval {
            min: either(self.min, other.min, i64::max),
            max: both(self.max, other.max, i64::max),
        }
    }

    /// Interval after conversion to `ty`, plus whether the input had to be
    /// widened because it is not representable in `ty`.
    pub fn cast(&self, ty: ScalarType) -> (ConstInterval, bool) {
        let fits = match (self.min, self.max) {
            (Some(a), Some(b)) => ty.can_represent(a) && ty.can_represent(b),
            _ => false,
        };
        if fits {
            (*self, false)
        } else if ty.is_narrow() || ty == ScalarType::Bool {
            (ConstInterval::of_type(ty), self.is_bounded())
        } else {
            let lo = self.min.filter(|v| ty.can_represent(*v));
            let hi = self.max.filter(|v| ty.can_represent(*v));
            let widened = self.is_bounded();
            if widened {
                (ConstInterval::EVERYTHING, true)
            } else {
                (ConstInterval::new(lo, hi), false)
            }
        }
    }
}

/// Combine two ends only when both are known.
fn both(a: Option<i64>, b: Option<i64>, f: fn(i64, i64) -> i64) -> Option<i64> {
    a.zip(b).map(|(a, b)| f(a, b))
}

/// Combine two ends when either is known.
fn either(a: Option<i64>, b: Option<i64>, f: fn(i64, i64) -> i64) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// `a * b` where `b` is bounded and `a` has at least one unbounded end.
fn mul_by_bounded(a: &ConstInterval, b: &ConstInterval) -> ConstInterval {
    let (b0, b1) = match (b.min, b.max) {
        (Some(b0), Some(b1)) => (b0, b1),
        _ => return ConstInterval::EVERYTHING,
    };
    if b1 < 0 {
        return mul_by_bounded(a, &b.neg()).neg();
    }
    if b0 < 0 {
        // Sign-straddling multiplier with an unbounded operand.
        return ConstInterval::EVERYTHING;
    }
    // b in [b0, b1] with b0 >= 0.
    let lo = a.min.and_then(|a0| {
        if a0 >= 0 {
            a0.checked_mul(b0)
        } else {
            a0.checked_mul(b1)
        }
    });
    let hi = a.max.and_then(|a1| {
        if a1 >= 0 {
            a1.checked_mul(b1)
        } else {
            a1.checked_mul(b0)
        }
    });
    ConstInterval { min: lo, max: hi }
}

impl fmt::Display for ConstInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.min {
            Some(v) => write!(f, "[{}, ", v)?,
            None => write!(f, "[-inf, ")?,
        }
        match self.max {
            Some(v) => write!(f, "{}]", v),
            None => write!(f, "+inf]"),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
