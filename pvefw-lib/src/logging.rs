use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";
const DEBUG_LOG_FILTER: &str = "debug";

/// Install the process-wide subscriber: env-filtered, plain text to
/// stderr. `debug` raises the default filter; an explicit `RUST_LOG`
/// always wins.
pub fn init(debug: bool) {
    let default = if debug { DEBUG_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
