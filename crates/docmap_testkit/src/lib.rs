//! # DocMap Testkit
//!
//! Test utilities for DocMap.
//!
//! This crate provides:
//! - A mapped test domain and session helpers
//! - A fault-injecting backend for partial-failure and retry tests
//! - A recording persister for asserting on write order
//! - Property-based test generators using proptest
//! - Opt-in log output for tests
//!
//! ## Usage
//!
//! ```rust
//! use docmap_testkit::prelude::*;
//!
//! with_session(|session| {
//!     let alice = full_user("alice", &[group("admins")]);
//!     session.persist(&alice).unwrap();
//!     let report = session.flush().unwrap();
//!     assert_eq!(report.inserted, 2);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::init_test_tracing;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Output is controlled by `RUST_LOG` and defaults to warnings only.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
