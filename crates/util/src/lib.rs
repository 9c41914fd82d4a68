//! Common utilities shared by the Sluice subcrates. The main purpose of this
//! crate is to hold test tooling and logging setup that would otherwise be
//! duplicated in each crate's dev-dependencies.
//!
//! **This crate is not semver compliant**. The version is locked to the root
//! `sluice` crate version. If you choose to depend directly on this crate, you
//! do so at your own risk of breakage.

mod test_util;

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing output for tests. Filtering is controlled by the
/// standard `RUST_LOG` variable. Safe to call multiple times; only the first
/// call installs the subscriber.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .init();
    });
}
