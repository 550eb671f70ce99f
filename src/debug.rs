//! Logging setup. `CHASER_DEBUG=1` lowers the default filter to debug.

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: Lazy<bool> =
    Lazy::new(|| std::env::var("CHASER_DEBUG").map(|v| v == "1").unwrap_or(false));

pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED
}

pub fn init_tracing() {
    let default = if debug_enabled() {
        "chaser=debug"
    } else {
        "chaser=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
