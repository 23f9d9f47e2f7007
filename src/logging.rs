//! Structured logging (A2): JSON-formatted `tracing` output, with level
//! controlled by `CONCRON_LOGLEVEL`.

use crate::error::FatalError;
use tracing_subscriber::EnvFilter;

/// Maps `CONCRON_LOGLEVEL` (debug/info/warn/error/fatal) onto a
/// `tracing` filter directive. `fatal` has no direct `tracing` level
/// equivalent and is mapped to `error`, its most restrictive supported level.
fn directive_for(level: &str) -> Result<&'static str, FatalError> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        "fatal" => Ok("error"),
        other => Err(FatalError::BadLogLevel(other.to_string())),
    }
}

pub fn init(level: &str) -> Result<(), FatalError> {
    let directive = directive_for(level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        assert!(matches!(directive_for("noisy"), Err(FatalError::BadLogLevel(_))));
    }

    #[test]
    fn accepts_known_levels() {
        for lvl in ["debug", "info", "warn", "error", "fatal", "WARN"] {
            assert!(directive_for(lvl).is_ok());
        }
    }
}
