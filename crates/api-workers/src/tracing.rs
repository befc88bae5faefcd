use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber.
///
/// Verbosity comes from `RUST_LOG` and defaults to `info`:
/// - `RUST_LOG=debug` also shows every request posted and notification republished
/// - `RUST_LOG=api_workers=trace,media_app=info` filters per crate
///
/// Calling it again after a subscriber is installed does nothing.
pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .try_init();
}
