// Parallel tuple updates through the whole lowering chain.
//
// Checks the synchronization chosen for racing tuple reductions and that
// the synchronized nest still computes the sequential result.

use std::collections::BTreeMap;

use nestc::diag::codes;
use nestc::expr::{self, var, Expr, ScalarType};
use nestc::func::{Func, Pipeline, RDom};
use nestc::nest::{AtomicOp, Stmt, Synchronization};
use nestc::pipeline::{lower, LowerOptions, Lowered};
use nestc::realize::{realize, Buffer};

const N: i64 = 32;
const BINS: i64 = 8;

fn a_values(r: i64) -> i64 {
    (r * 5) % BINS
}

fn b_values(r: i64) -> i64 {
    r % 3 - 1
}

fn inputs() -> BTreeMap<String, Buffer> {
    let mut inputs = BTreeMap::new();
    inputs.insert("a".to_string(), Buffer::from_fn(&[0], &[N], |p| a_values(p[0])));
    inputs.insert("b".to_string(), Buffer::from_fn(&[0], &[N], |p| b_values(p[0])));
    inputs
}

/// f(idx) *= (a(r) + i b(r)) for r in [0, N), with idx = a(r).
fn complex_multiply(atomic: bool) -> Pipeline {
    let a = Func::input("a", ScalarType::I32, &[0], &[N]);
    let b = Func::input("b", ScalarType::I32, &[0], &[N]);
    let idx = expr::clamp(a.call([var("r")]), 0, BINS - 1);
    let f = Func::new("f", &["x"]).typed(&[ScalarType::I32, ScalarType::I32]);
    let re = f.call_component([idx.clone()], 0);
    let im = f.call_component([idx.clone()], 1);
    let (ar, br) = (a.call([var("r")]), b.call([var("r")]));
    let f = f
        .clone()
        .define_tuple(vec![Expr::from(1), Expr::from(0)])
        .typed(&[ScalarType::I32, ScalarType::I32])
        .update_over(
            RDom::new(&[("r", 0, N)]),
            vec![idx],
            vec![
                re.clone() * ar.clone() - im.clone() * br.clone(),
                re * br + im * ar,
            ],
        )
        .stage(1, |s| {
            let s = s.parallel("r");
            if atomic {
                s.atomic(false)
            } else {
                s
            }
        });
    Pipeline::new()
        .with_func(a)
        .with_func(b)
        .with_func(f)
        .output("f", &[0], &[BINS])
}

fn expected_complex() -> (Vec<i64>, Vec<i64>) {
    let mut re = vec![1i64; BINS as usize];
    let mut im = vec![0i64; BINS as usize];
    for r in 0..N {
        let i = a_values(r) as usize;
        let (ar, br) = (a_values(r), b_values(r));
        let (x, y) = (re[i], im[i]);
        re[i] = x * ar - y * br;
        im[i] = x * br + y * ar;
    }
    (re, im)
}

fn lowered(p: &Pipeline) -> Lowered {
    lower(p, &LowerOptions::default()).unwrap_or_else(|e| panic!("{e}: {:?}", e.diagnostics))
}

fn count_atomics(l: &Lowered) -> usize {
    let mut n = 0;
    l.nest.body.walk(&mut |s| {
        if matches!(s, Stmt::Atomic(_)) {
            n += 1;
        }
    });
    n
}

#[test]
fn coupled_components_share_one_mutex() {
    let l = lowered(&complex_multiply(true));
    assert_eq!(l.sync.len(), 1);
    assert_eq!(
        l.sync[0].sync,
        Synchronization::Mutex {
            name: "f.s1.mutex".into()
        }
    );
    assert_eq!(count_atomics(&l), 1);
    assert!(l.diagnostics.is_empty(), "{:?}", l.diagnostics);
}

#[test]
fn unrequested_race_warns() {
    let l = lowered(&complex_multiply(false));
    assert!(matches!(l.sync[0].sync, Synchronization::Mutex { .. }));
    let found: Vec<_> = l.diagnostics.iter().filter_map(|d| d.code).collect();
    assert_eq!(found, vec![codes::W0300]);
}

#[test]
fn synchronized_nest_matches_sequential_result() {
    let l = lowered(&complex_multiply(true));
    let r = realize(&l.nest, &inputs(), &BTreeMap::new()).unwrap_or_else(|e| panic!("{e}"));
    let (re, im) = expected_complex();
    let out = &r.outputs["f"];
    assert_eq!(out[0].data, re);
    assert_eq!(out[1].data, im);
}

#[test]
fn independent_components_use_lock_free_ops() {
    let a = Func::input("a", ScalarType::I32, &[0], &[N]);
    let idx = expr::clamp(a.call([var("r")]), 0, BINS - 1);
    let f = Func::new("f", &["x"]).typed(&[ScalarType::I32, ScalarType::I32]);
    let count = f.call_component([idx.clone()], 0);
    let low = f.call_component([idx.clone()], 1);
    let f = f
        .clone()
        .define_tuple(vec![Expr::from(0), Expr::from(100)])
        .update_over(
            RDom::new(&[("r", 0, N)]),
            vec![idx],
            vec![count + 1, expr::min(low, var("r"))],
        )
        .stage(1, |s| s.parallel("r").atomic(false));
    let p = Pipeline::new().with_func(a).with_func(f).output("f", &[0], &[BINS]);
    let l = lowered(&p);
    assert_eq!(
        l.sync[0].sync,
        Synchronization::Atomic {
            ops: vec![AtomicOp::Add, AtomicOp::Min]
        }
    );

    let r = realize(&l.nest, &inputs(), &BTreeMap::new()).unwrap_or_else(|e| panic!("{e}"));
    let mut counts = vec![0i64; BINS as usize];
    let mut lows = vec![100i64; BINS as usize];
    for r in 0..N {
        let i = a_values(r) as usize;
        counts[i] += 1;
        lows[i] = lows[i].min(r);
    }
    assert_eq!(r.outputs["f"][0].data, counts);
    assert_eq!(r.outputs["f"][1].data, lows);
}
