//! Development-time tracing for debugging the engine.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`. They are not
//! product output: session events are printed to stdout by the CLI no matter
//! what the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";
const VERBOSE_FILTER: &str = "warn,treeloop=debug";

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `treeloop=debug` when `verbose` is on.
///
/// # Example
/// ```bash
/// RUST_LOG=treeloop::approval=debug treeloop run --scenario poster.toml --message "Make a poster"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .init();
}
