use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) and a
/// fmt layer on stderr. Later calls do nothing.
pub fn init_tracing() {
    if INITIALISED.set(()).is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    // another subscriber may already be installed by a test harness
    let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}
