//! Log stream setup.
//!
//! Everything goes to stderr through `tracing-subscriber`'s fmt layer. The
//! watch loop runs inside a `deploy-watch` span, which the formatter prints
//! in front of every line it emits.
//!
//! Level resolution: `RUST_LOG`, then `[logging] level` from the config file,
//! then `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

const DEFAULT_LEVEL: &str = "info";

fn filter_for(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let directive = config.level.as_deref().unwrap_or(DEFAULT_LEVEL);
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("warning: invalid log level {directive:?}: {err}. Using {DEFAULT_LEVEL}.");
        EnvFilter::new(DEFAULT_LEVEL)
    })
}

/// Install the global subscriber. Only the first call has an effect.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true);

        tracing_subscriber::registry()
            .with(filter_for(config))
            .with(fmt_layer)
            .init();
    });
}
