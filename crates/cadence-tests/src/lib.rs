//! Integration test infrastructure for Cadence.
//!
//! Wires the scheduling service to the in-memory store and records every
//! committed event through a notification channel.
//!
//! # Usage
//!
//! ```ignore
//! use cadence_tests::{PipelineFixture, TestContext};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new(vec![PipelineFixture::single("cruise")]).await;
//!     ctx.commit(&cadence_tests::git("cruise"), "abc").await;
//!     ctx.trigger().await;
//! }
//! ```

pub mod context;
pub mod fixtures;

pub use context::TestContext;
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,cadence_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
