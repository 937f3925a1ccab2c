use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Install the global tracing subscriber. Filtering follows `RUST_LOG`, defaulting to `info`.
/// Setting `LOG_FORMAT=json` switches to JSON lines.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|x| x.eq_ignore_ascii_case("json"));

    let registry = Registry::default().with(filter);
    // Tests call this once per context, so a second install is expected and ignored
    let _ = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}
