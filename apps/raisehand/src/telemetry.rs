use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_FILTER: &str = "info,raisehand=debug";

/// Installs the global subscriber. A malformed filter falls back to the
/// default one; a second call is a no-op.
pub fn init_tracing(filter: &str) {
    let env_filter = match EnvFilter::try_new(filter) {
        Ok(env_filter) => env_filter,
        Err(err) => {
            eprintln!("invalid log filter {filter:?}: {err}; using {DEFAULT_LOG_FILTER}");
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}
