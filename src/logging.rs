//! Tracing initialization.
//!
//! One fmt subscriber, filtered by the configured level unless `RUST_LOG`
//! is set, in which case the environment wins. Double initialization (as
//! happens when several tests call in) is tolerated and reported as a
//! no-op rather than an error.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from the configured level.
///
/// Returns an error only for an unparseable level string; a subscriber
/// already being installed is fine.
pub fn init(log_level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| format!("invalid log level '{log_level}': {e}"))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_levels_and_repeated_init() {
        init("debug").expect("valid level");
        init("info").expect("second init is a no-op");
    }

    #[test]
    fn rejects_garbage_levels() {
        assert!(init("extremely_loud=").is_err());
    }
}
