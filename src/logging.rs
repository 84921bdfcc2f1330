use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global fmt subscriber filtered by `RUST_LOG` (falling back to
/// `level`). Intended for binaries and integration tests; the library itself
/// only emits `tracing` events.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
