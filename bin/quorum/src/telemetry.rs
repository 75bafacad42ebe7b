use anyhow::Result;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// `RUST_LOG` when set, otherwise the configured directive.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber: everything the filter allows goes to
/// stdout, warnings and errors are repeated on stderr.
///
/// Workers run with `ansi = false` since the orchestrator points both
/// streams at files.
pub fn init_tracing(filter: &str, ansi: bool) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
        .with_ansi(ansi)
        .with_target(true)
        .with_filter(env_filter(filter));
    let stderr_layer = fmt::layer()
        .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
        .with_ansi(ansi)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(stderr_layer)
        .try_init()?;
    Ok(())
}
