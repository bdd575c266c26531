//! Structured logging setup.
//!
//! Logs go to stderr through `tracing-subscriber`, leaving stdout for
//! command output. `RUST_LOG` takes precedence over `-v` flags.

use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count: warnings only, then info, then debug.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "tributary=debug,tributary_core=debug,info",
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_level() {
        assert_eq!(default_filter(0), "warn");
        assert_eq!(default_filter(1), "info");
        assert!(default_filter(3).contains("tributary_core=debug"));
    }
}
