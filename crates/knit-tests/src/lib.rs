//! Integration test infrastructure for knit.
//!
//! This crate provides testcontainers-based infrastructure for running
//! the engine against a real PostgreSQL catalog.
//!
//! # Usage
//!
//! ```ignore
//! use knit_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::postgres_only().await.unwrap();
//!     let engine = ctx.engine();
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
///
/// Reads a `.env` file first, so `RUST_LOG` can be set there.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = dotenvy::dotenv();
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,knit_engine=debug,knit_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
