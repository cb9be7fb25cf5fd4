#![cfg(any(test, feature = "test"))]
//! Test support: an in-memory storage backend and logging setup for tests.

use std::sync::Once;

pub use memory::MemoryConnection;
pub use memory::MemoryDatabase;
pub use memory::MemoryManager;

/// Route `tracing` output of the crate to the test harness. Controlled by `RUST_LOG`; silent by default.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
