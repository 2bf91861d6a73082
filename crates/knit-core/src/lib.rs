//! Knit Core
//!
//! Core domain types, traits, and error handling for the knit metadata
//! engine: tags, plans, data, the matching rule, and the store ports.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod data;
pub mod error;
pub mod ids;
pub mod matcher;
pub mod nomination;
pub mod plan;
pub mod ports;
pub mod query;
pub mod run;
pub mod tags;

pub use error::{Error, Result};
pub use ids::*;
