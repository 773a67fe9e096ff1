//! Logging setup for the relay
//
// Call `logging::init(format, verbose)` once at the start of main().
// `RUST_LOG` overrides the default filter when set.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber.
pub fn init(format: LogFormat, verbose: bool) -> anyhow::Result<()> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(val) => EnvFilter::try_new(val)?,
        Err(_) => EnvFilter::new(default_filter(verbose)),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(verbose),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false),
            )
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(false), "info");
        assert_eq!(default_filter(true), "debug");
    }
}
