//! Diagnostics for the `docflow` binary
//!
//! Reads `RUST_LOG` and defaults to `warn`. Output goes to stderr so that
//! command output on stdout stays machine readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber; `json` switches to one JSON object per line
pub(crate) fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().with_writer(std::io::stderr).json()).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr).compact()).init();
    }
}
