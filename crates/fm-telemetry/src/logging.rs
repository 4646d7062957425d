use tracing_subscriber::{fmt, EnvFilter};

/// Install a human-readable subscriber.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info" or "fm_queue=debug,warn").
/// Later calls are no-ops, so tests may call this freely.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Install a JSON subscriber, one object per line.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Pick the subscriber flavour from configuration.
pub fn init(service_name: &str, default_level: &str, json: bool) {
    if json {
        init_logging_json(service_name, default_level);
    } else {
        init_logging(service_name, default_level);
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
