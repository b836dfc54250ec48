//! Log output for test binaries.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "stackup=info,stackup_testcontainers=info";

/// Install a fmt subscriber writing through the test harness.
///
/// Honors `RUST_LOG`, otherwise logs the stackup crates at `info`. Safe to
/// call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
