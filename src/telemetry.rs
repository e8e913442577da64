//! Tracing subscriber setup for binaries and tests embedding the control plane.

use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber. `RUST_LOG` takes precedence over `default_filter`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init("house_core=debug");
        assert!(!init("house_core=trace"));
    }
}
