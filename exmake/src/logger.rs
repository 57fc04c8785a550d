//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise `EXMAKE_DEBUG=1` selects debug-level
//! diagnostics. `EXMAKE_COLORS=0` disables ANSI color output.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let default = if std::env::var("EXMAKE_DEBUG").as_deref() == Ok("1") {
        "exmake=debug"
    } else {
        "exmake=info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let ansi = std::env::var("EXMAKE_COLORS").as_deref() != Ok("0");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(ansi)
                .with_target(false),
        )
        .try_init();
}
