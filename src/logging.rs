use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr log subscriber.
///
/// `RUST_LOG` takes precedence. Without it only warnings are shown, or
/// everything down to `debug` with `--verbose`. Stdout stays reserved for the
/// rendered links. Calling this more than once is harmless.
pub fn init(verbose: bool) {
    let default = if verbose { "wslshot=debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .without_time(),
        )
        .try_init();

    tracing::debug!(verbose, "logging initialized");
}
