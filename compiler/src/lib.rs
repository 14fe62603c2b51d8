// nestc — Loop-nest compiler
//
// Library root. Lowers a scheduled pipeline of Funcs to a bounded,
// verified loop nest.

pub mod atomics;
pub mod bounds;
pub mod diag;
pub mod dot;
pub mod error;
pub mod expr;
pub mod func;
pub mod graph;
pub mod id;
pub mod inline;
pub mod interval;
pub mod lower;
pub mod monotonic;
pub mod nest;
pub mod pass;
pub mod pipeline;
pub mod realize;
pub mod region;
pub mod schedule;
pub mod simplify;
pub mod skip;
pub mod storage;
