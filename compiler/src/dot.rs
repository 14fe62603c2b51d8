// dot.rs — Graphviz DOT output for pipeline call graphs
//
// Renders the Funcs of a pipeline as nodes (inputs, inlined, computed and
// output Funcs styled apart) and producer → consumer calls as edges. An
// edge into the consumer a Func is computed at is drawn bold and labelled
// with the loop variable.
//
// Preconditions: `graph` was built from `pipeline` by `build_graph`.
// Postconditions: returns a valid DOT string; output is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::func::{Func, Pipeline};
use crate::graph::FuncGraph;
use crate::inline::is_inlined;
use crate::schedule::{effective_compute_level, effective_store_level, LoopLevel};

/// Emit the call graph of `pipeline` as a Graphviz DOT string.
pub fn emit_dot(pipeline: &Pipeline, graph: &FuncGraph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph pipeline {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();
    writeln!(buf).unwrap();

    for name in &graph.names {
        let Some(func) = pipeline.func(name) else {
            continue;
        };
        writeln!(buf, "    {} [{}];", sanitize(name), node_attrs(pipeline, func)).unwrap();
    }

    writeln!(buf).unwrap();
    for (i, consumer) in graph.names.iter().enumerate() {
        for callee in &graph.callees[i] {
            let producer = graph.name(*callee);
            let attrs = pipeline
                .func(producer)
                .map(|f| edge_attrs(pipeline, f, consumer))
                .unwrap_or_default();
            writeln!(
                buf,
                "    {} -> {}{};",
                sanitize(producer),
                sanitize(consumer),
                attrs
            )
            .unwrap();
        }
    }
    for id in &graph.self_recursive {
        let name = sanitize(graph.name(*id));
        writeln!(buf, "    {name} -> {name} [style=dashed, label=\"update\"];").unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn node_label(pipeline: &Pipeline, func: &Func) -> String {
    if func.is_input() {
        return format!("{}({})", func.name, func.args.join(", "));
    }
    let mut label = format!("{}({})", func.name, func.args.join(", "));
    if func.num_stages() > 1 {
        write!(label, "\\nupdates: {}", func.num_stages() - 1).unwrap();
    }
    if !is_inlined(pipeline, func) {
        let compute = effective_compute_level(pipeline, func);
        let store = effective_store_level(pipeline, func);
        write!(label, "\\ncompute: {compute}").unwrap();
        if store != compute {
            write!(label, "\\nstore: {store}").unwrap();
        }
    }
    label
}

/// Return DOT attributes string for a Func node.
fn node_attrs(pipeline: &Pipeline, func: &Func) -> String {
    let (shape, style, color) = if func.is_input() {
        ("cylinder", "filled", "lightsalmon")
    } else if pipeline.is_output(&func.name) {
        ("box", "\"filled,bold\"", "lightgreen")
    } else if is_inlined(pipeline, func) {
        ("ellipse", "dashed", "white")
    } else {
        ("box", "filled", "lightblue")
    };
    let label = node_label(pipeline, func);
    format!("shape={shape}, style={style}, fillcolor={color}, label=\"{label}\"")
}

fn edge_attrs(pipeline: &Pipeline, producer: &Func, consumer: &str) -> String {
    match effective_compute_level(pipeline, producer) {
        LoopLevel::At { func, var, .. } if func == consumer => {
            format!(" [style=bold, label=\"at {var}\"]")
        }
        _ => String::new(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
