//! Logging helpers.
//!
//! The runtime logs scheduler transitions, fiber lifecycle events and
//! reactor/timer activity through the [`log`] crate's macros at `trace` and
//! `debug` level. There is no bundled [`log::Log`] backend here — unlike an
//! embedded host, this crate has no particular external sink to bridge logs
//! into, so it's up to the embedding application to install one (or to use
//! [`init_for_tests`] in its own tests).

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a bare [`env_logger`] subscriber controlled by `RUST_LOG`, once
/// per process. Intended for `#[test]` functions and integration tests;
/// safe to call from multiple tests concurrently.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
