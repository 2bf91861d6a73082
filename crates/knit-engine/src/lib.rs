//! Nomination maintenance and plan-graph consistency for knit.

pub mod cycle;
pub mod engine;
pub mod graph;
pub mod nominator;
pub mod registrar;

pub use engine::Engine;
