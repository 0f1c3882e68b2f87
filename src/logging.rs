//! Logging configuration for courier.
//!
//! Logs go to stderr so that stdout carries only query results.

use tracing_subscriber::EnvFilter;

/// Default filter directive: warnings only, or progress with `--verbose`.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "db_courier=info,courier=info,warn"
    } else {
        "warn"
    }
}

/// Initializes logging to stderr. `RUST_LOG` overrides the default level.
pub fn init_stderr_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        for verbose in [false, true] {
            assert!(default_directive(verbose)
                .parse::<EnvFilter>()
                .is_ok());
        }
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_stderr_logging(false);
        init_stderr_logging(true);
    }
}
