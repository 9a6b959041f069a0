use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging for the client
///
/// Sets up tracing-subscriber with either JSON or compact formatting. The
/// filter comes from `RUST_LOG` when present, otherwise from the supplied
/// directive (typically `Config::log_level`).
///
/// Call at most once per process; embedding applications that already install
/// a subscriber should skip this entirely.
pub fn init(directive: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}
