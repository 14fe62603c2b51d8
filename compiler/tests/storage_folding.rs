// Storage folding and sliding window correctness.
//
// A producer stored at root and computed per output row is read through a
// vertical stencil of random radius. The lowered nest is run by the
// reference interpreter, which rejects any read of a folded slot that was
// overwritten (stale) or never written. Results must match the unfolded
// lowering and the closed form.
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::BTreeMap;

use nestc::expr::var;
use nestc::func::{Func, Pipeline};
use nestc::pipeline::{lower, LowerOptions, Lowered};
use nestc::realize::{realize, Buffer, Realization};
use nestc::storage::StorageChoice;
use proptest::prelude::*;

fn g_value(x: i64, y: i64) -> i64 {
    x * 7 + y * y
}

fn stencil(radius: i64, width: i64, height: i64) -> Pipeline {
    let g = Func::new("g", &["x", "y"])
        .define(var("x") * 7 + var("y") * var("y"))
        .store_root()
        .compute_at("out", "y");
    let mut value = g.call([var("x"), var("y") - radius]);
    for dy in (1 - radius)..=radius {
        value = value + g.call([var("x"), var("y") + dy]);
    }
    let out = Func::new("out", &["x", "y"]).define(value);
    Pipeline::new()
        .with_func(g)
        .with_func(out)
        .output("out", &[0, 0], &[width, height])
}

fn expected(radius: i64, width: i64, height: i64) -> Buffer {
    Buffer::from_fn(&[0, 0], &[width, height], |p| {
        (-radius..=radius).map(|dy| g_value(p[0], p[1] + dy)).sum()
    })
}

fn lowered(p: &Pipeline, options: &LowerOptions) -> Lowered {
    lower(p, options).unwrap_or_else(|e| panic!("{e}: {:?}", e.diagnostics))
}

fn run(l: &Lowered) -> Realization {
    realize(&l.nest, &BTreeMap::new(), &BTreeMap::new())
        .unwrap_or_else(|e| panic!("{e}\n{}", l.nest))
}

fn row_choice(l: &Lowered) -> Option<StorageChoice> {
    l.storage
        .iter()
        .find(|d| d.func == "g" && d.dim == 1)
        .map(|d| d.choice.clone())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn folded_stencil_matches_closed_form(
        radius in 0i64..=3,
        width in 1i64..=4,
        height in 1i64..=12,
    ) {
        let p = stencil(radius, width, height);
        let folded = lowered(&p, &LowerOptions::default());
        let r = run(&folded);
        prop_assert_eq!(r.output("out"), Some(&expected(radius, width, height)));
        // Sliding computes every row of g exactly once.
        prop_assert_eq!(r.store_count("g"), (width * (height + 2 * radius)) as u64);
    }

    #[test]
    fn folding_without_sliding_recomputes_but_agrees(
        radius in 1i64..=3,
        width in 1i64..=4,
        height in 1i64..=12,
    ) {
        let p = stencil(radius, width, height);
        let options = LowerOptions {
            sliding_window: false,
            ..LowerOptions::default()
        };
        let l = lowered(&p, &options);
        let r = run(&l);
        prop_assert_eq!(r.output("out"), Some(&expected(radius, width, height)));
        prop_assert_eq!(
            r.store_count("g"),
            (width * height * (2 * radius + 1)) as u64
        );
    }

    #[test]
    fn unfolded_lowering_agrees(
        radius in 0i64..=3,
        height in 1i64..=12,
    ) {
        let p = stencil(radius, 3, height);
        let options = LowerOptions {
            storage_folding: false,
            ..LowerOptions::default()
        };
        let full = lowered(&p, &options);
        prop_assert_eq!(row_choice(&full), Some(StorageChoice::Full));
        let folded = lowered(&p, &LowerOptions::default());
        let from_full = run(&full);
        let from_folded = run(&folded);
        prop_assert_eq!(from_full.output("out"), from_folded.output("out"));
    }
}

#[test]
fn three_row_stencil_folds_to_four_rows() {
    let l = lowered(&stencil(1, 8, 16), &LowerOptions::default());
    assert_eq!(row_choice(&l), Some(StorageChoice::Fold { factor: 4 }));
    let realize = l.nest.body.find_realize("g").cloned();
    let realize = realize.unwrap_or_else(|| panic!("g not realized"));
    assert_eq!(realize.dims[1].physical_extent(), Some(4));
}

#[test]
fn two_row_stride_uses_a_window() {
    let g = Func::new("g", &["x", "y"])
        .define(var("x") * 7 + var("y") * var("y"))
        .store_root()
        .compute_at("out", "y");
    let out = Func::new("out", &["x", "y"])
        .define(g.call([var("x"), var("y") * 2]) + g.call([var("x"), var("y") * 2 + 1]));
    let p = Pipeline::new()
        .with_func(g)
        .with_func(out)
        .output("out", &[0, 0], &[4, 6]);
    let l = lowered(&p, &LowerOptions::default());
    assert_eq!(row_choice(&l), Some(StorageChoice::Window { extent: 2 }));
    let r = run(&l);
    let expected = Buffer::from_fn(&[0, 0], &[4, 6], |p| {
        g_value(p[0], p[1] * 2) + g_value(p[0], p[1] * 2 + 1)
    });
    assert_eq!(r.output("out"), Some(&expected));
    assert_eq!(r.store_count("g"), 4 * 12);
}
