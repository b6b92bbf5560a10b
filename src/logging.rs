use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber. Call once, from `main`.
///
/// Priority: RUST_LOG env var > `--debug` flag > config level > "info".
/// Logs go to stderr so stdout only carries the assessment.
pub fn init(debug_flag: bool, config_level: Option<&str>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if debug_flag {
        EnvFilter::new("debug")
    } else if let Some(level) = config_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Logging initialised");
}
