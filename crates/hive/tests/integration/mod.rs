//! Integration test helpers for Hive
//!
//! Provides an in-memory agent speaking the envelope codec over a
//! `tokio::io::duplex` stream, so the server-side pump can be exercised
//! without real listeners.

pub mod agent;

pub use agent::*;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
