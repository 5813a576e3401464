//! Tracing initialization for services embedding the engine.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes structured logging from `RUST_LOG`, defaulting to `info`
/// with engine crates at `debug`.
///
/// Call once at process start; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,operon_engine=debug,operon_core=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    // try_init so tests and embedders that already installed a subscriber
    // are left alone.
    let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}
