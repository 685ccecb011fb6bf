//! Logging setup for hosts that load the library.
//!
//! The library only emits `tracing` events. Hosts that already install a
//! subscriber get them for free; others can call `nn_init_logger()`.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Install a compact fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Later calls are no-ops, and an already installed global
/// subscriber is left in place.
pub fn init_with_filter(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
            .is_ok();
        tracing::debug!(installed, "logger initialised");
    });
}

/// Initialise logging with the `info` default filter.
#[no_mangle]
pub extern "C" fn nn_init_logger() {
    init_with_filter("info");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        nn_init_logger();
        nn_init_logger();
        init_with_filter("debug");
    }
}
